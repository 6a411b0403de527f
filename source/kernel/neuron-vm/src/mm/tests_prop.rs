// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for address-space operations
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - translate honours the USER flag for every permission mix
//!   - grow followed by shrink restores the mapped-page set and frees every grown frame
//!   - fork yields distinct frames with identical contents
//!   - shared mappings alias rather than snapshot

extern crate alloc;

use alloc::vec::Vec;

use proptest::prelude::*;

use super::address_space::AddressSpace;
use super::frame::{Frames, HeapFrameAllocator};
use super::page_table::PageTable;
use super::share::map_shared;
use super::uaccess::{copy_in, copy_out};
use super::{PageFlags, PAGE_SIZE};

fn arb_leaf_flags() -> impl Strategy<Value = PageFlags> {
    (1usize..8, any::<bool>()).prop_map(|(perms, user)| {
        let mut flags = PageFlags::from_bits_truncate(perms << 1);
        if user {
            flags |= PageFlags::USER;
        }
        flags
    })
}

fn leaves(space: &AddressSpace) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    space.page_table().for_each_leaf(0, usize::MAX, |va, pte| out.push((va, pte.pa())));
    out
}

fn user_space(frames: &mut Frames<HeapFrameAllocator>, pages: usize) -> AddressSpace {
    let mut space = AddressSpace::create(frames).expect("create");
    space.grow(frames, pages * PAGE_SIZE, PageFlags::WRITE).expect("grow");
    space
}

proptest! {
    #[test]
    fn translate_matches_user_flag(page in 0usize..4096, flags in arb_leaf_flags()) {
        let mut frames = Frames::new(HeapFrameAllocator::new());
        let mut table = PageTable::new(&mut frames).expect("root");
        let va = page * PAGE_SIZE;
        let pa = 0x8000_0000 + page * PAGE_SIZE;
        table.map_range(&mut frames, va, PAGE_SIZE, pa, flags).expect("map");
        let expected = flags.contains(PageFlags::USER).then_some(pa);
        prop_assert_eq!(table.translate(va), expected);
        prop_assert_eq!(table.translate(va + PAGE_SIZE - 1), expected);
        prop_assert!(table.lookup(va).is_some());
    }

    #[test]
    fn grow_then_shrink_restores_mappings(base in 1usize..5, extra in 1usize..24, tail in 0usize..PAGE_SIZE) {
        let mut frames = Frames::new(HeapFrameAllocator::new());
        let mut space = user_space(&mut frames, base);
        let before = leaves(&space);
        let live = frames.allocator().live_frames();
        let old_size = space.size();

        space.grow(&mut frames, old_size + extra * PAGE_SIZE + tail, PageFlags::WRITE).expect("grow");
        prop_assert!(space.page_table().mapped_pages() >= before.len() + extra);
        space.shrink(&mut frames, old_size);

        prop_assert_eq!(space.size(), old_size);
        prop_assert_eq!(leaves(&space), before);
        // Intermediate tables allocated by grow stay until destroy.
        prop_assert!(frames.allocator().live_frames() <= live + 2);
        space.destroy(&mut frames);
        prop_assert_eq!(frames.allocator().live_frames(), 0);
    }

    #[test]
    fn fork_copies_are_distinct_but_equal(contents in proptest::collection::vec(any::<u8>(), 1..(6 * PAGE_SIZE))) {
        let mut frames = Frames::new(HeapFrameAllocator::new());
        let pages = contents.len().div_ceil(PAGE_SIZE);
        let parent = user_space(&mut frames, pages);
        copy_out(parent.page_table(), 0, &contents).expect("fill");

        let child = parent.fork(&mut frames).expect("fork");
        for page in 0..pages {
            let va = page * PAGE_SIZE;
            prop_assert_ne!(parent.translate(va), child.translate(va));
        }
        let mut copied = alloc::vec![0u8; contents.len()];
        copy_in(child.page_table(), &mut copied, 0).expect("read child");
        prop_assert_eq!(copied, contents);
        child.destroy(&mut frames);
        parent.destroy(&mut frames);
    }

    #[test]
    fn shared_mapping_observes_later_writes(offset in 0usize..(3 * PAGE_SIZE), len in 1usize..PAGE_SIZE, byte in any::<u8>()) {
        let mut frames = Frames::new(HeapFrameAllocator::new());
        let source = user_space(&mut frames, 4);
        let mut dest = user_space(&mut frames, 1);
        let va = map_shared(&source, &mut dest, &mut frames, offset, len).expect("share");
        prop_assert_eq!(va % PAGE_SIZE, offset % PAGE_SIZE);

        let payload = alloc::vec![byte; len];
        copy_out(source.page_table(), offset, &payload).expect("write source");
        let mut seen = alloc::vec![0u8; len];
        copy_in(dest.page_table(), &mut seen, va).expect("read dest");
        prop_assert_eq!(seen, payload);
        dest.destroy(&mut frames);
        source.destroy(&mut frames);
        prop_assert_eq!(frames.allocator().live_frames(), 0);
    }
}
