// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cross-address-space aliasing of user frames
//! OWNERS: @kernel-mm-team
//! PUBLIC API: map_shared, unmap_shared, SharePlan, find_free_range
//! DEPENDS_ON: PageTable, AddressSpace, Frames share ledger
//! INVARIANTS: Aliases carry PageFlags::SHARED and hold one ledger reference each;
//!             a rejected request installs nothing; revocation only clears USER
//!
//! Range lifecycle: unmapped -> mapped (aliased, user-accessible) -> revoked
//! (aliased, not user-accessible). A revoked range stays mapped until the
//! address space shrinks past it or is destroyed; the free-range search
//! treats it as occupied until then.

extern crate alloc;

use alloc::vec::Vec;

use super::address_space::AddressSpace;
use super::frame::{FrameAllocator, Frames};
use super::page_table::PageTable;
use super::{checked_page_round_up, page_round_down, PageFlags, VmError, LEAF_PERMS, MAXVA, PAGE_SIZE};

/// Lowest address considered for shared mappings.
pub const SHARED_BASE: usize = MAXVA / 2;

/// First-fit search for `len` bytes of unmapped, page-aligned space at or above [`SHARED_BASE`].
pub fn find_free_range(table: &PageTable, len: usize) -> Option<usize> {
    let mut candidate = SHARED_BASE;
    'search: loop {
        if candidate.checked_add(len)? > MAXVA {
            return None;
        }
        let mut offset = 0;
        while offset < len {
            if table.lookup(candidate + offset).is_some() {
                candidate += offset + PAGE_SIZE;
                continue 'search;
            }
            offset += PAGE_SIZE;
        }
        return Some(candidate);
    }
}

/// Validated snapshot of the source frames behind a shared-mapping request.
#[derive(Debug)]
pub struct SharePlan {
    offset: usize,
    pages: Vec<(usize, PageFlags)>,
}

impl SharePlan {
    /// Records the frame and permissions of every page in `[va, va + size)` of `source`.
    ///
    /// Every page must be mapped user-accessible.
    pub fn collect(source: &PageTable, va: usize, size: usize) -> Result<Self, VmError> {
        if size == 0 {
            return Err(VmError::InvalidArgs);
        }
        let start = page_round_down(va);
        let end = va
            .checked_add(size)
            .and_then(checked_page_round_up)
            .filter(|end| *end <= MAXVA)
            .ok_or(VmError::OutOfRange)?;
        let keep = LEAF_PERMS | PageFlags::USER;
        // Grows only with validated pages; `size` is caller-controlled.
        let mut pages = Vec::new();
        for page in (start..end).step_by(PAGE_SIZE) {
            let Some(pte) = source.lookup(page).filter(|pte| pte.is_user()) else {
                log_warn!(target: "share", "source page {:#x} is not user-mapped", page);
                return Err(VmError::BadSourceMapping);
            };
            pages.push((pte.pa(), pte.flags() & keep));
        }
        Ok(Self { offset: va - start, pages })
    }

    /// Length of the planned mapping in bytes (whole pages).
    pub fn len(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Aliases the planned frames into the first free range of `dest`.
    ///
    /// Returns the destination address matching the original, unrounded
    /// source address. Extends `dest`'s size when the range ends above it.
    pub fn install<A: FrameAllocator>(
        &self,
        dest: &mut AddressSpace,
        frames: &mut Frames<A>,
    ) -> Result<usize, VmError> {
        let Some(base) = find_free_range(dest.page_table(), self.len()) else {
            log_warn!(target: "share", "no free range for {:#x} bytes", self.len());
            return Err(VmError::NoSpace);
        };
        for (index, &(pa, flags)) in self.pages.iter().enumerate() {
            let va = base + index * PAGE_SIZE;
            let table = dest.page_table_mut();
            if let Err(err) = table.map_range(frames, va, PAGE_SIZE, pa, flags | PageFlags::SHARED) {
                table.unmap_range(frames, base, index, false);
                return Err(err);
            }
            frames.share(pa);
        }
        let end = base + self.len();
        if end > dest.size() {
            dest.set_size(end);
        }
        dest.verify_after("map_shared");
        log_info!(target: "share", "aliased {} page(s) at {:#x}", self.pages.len(), base);
        Ok(base + self.offset)
    }
}

/// Aliases `[va, va + size)` of `source` into a free upper-half range of `dest`.
pub fn map_shared<A: FrameAllocator>(
    source: &AddressSpace,
    dest: &mut AddressSpace,
    frames: &mut Frames<A>,
    va: usize,
    size: usize,
) -> Result<usize, VmError> {
    SharePlan::collect(source.page_table(), va, size)?.install(dest, frames)
}

/// Revokes user access to every page of `[addr, addr + size)` in `space`.
///
/// The whole range is checked first; nothing changes if any page lacks a valid entry.
pub fn unmap_shared(space: &mut AddressSpace, addr: usize, size: usize) -> Result<(), VmError> {
    if size == 0 {
        return Err(VmError::InvalidArgs);
    }
    let start = page_round_down(addr);
    let end = addr
        .checked_add(size)
        .and_then(checked_page_round_up)
        .filter(|end| *end <= MAXVA)
        .ok_or(VmError::BadAddress)?;
    let pages = (start..end).step_by(PAGE_SIZE);
    if let Some(missing) = pages.clone().find(|page| space.page_table().lookup(*page).is_none()) {
        log_warn!(target: "share", "unmap_shared: {:#x} is not mapped", missing);
        return Err(VmError::BadAddress);
    }
    for page in pages {
        space.clear_user_access(page);
    }
    log_info!(target: "share", "revoked {:#x}..{:#x}", start, end);
    Ok(())
}
