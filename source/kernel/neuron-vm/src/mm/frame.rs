// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame collaborator and alias ledger for shared frames
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameAllocator, Frames, HeapFrameAllocator
//! DEPENDS_ON: external frame allocator, kernel heap (HeapFrameAllocator)
//! INVARIANTS: A frame with live aliases is never returned to the allocator;
//!             the last holder (owner or alias) frees it exactly once

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};

use super::PAGE_SIZE;

/// External physical frame allocator.
///
/// Implementations hand out page-aligned frames reachable through the kernel
/// direct map and are synchronised by their owner.
pub trait FrameAllocator {
    /// Returns the physical address of a fresh frame, or `None` when exhausted.
    fn allocate_frame(&mut self) -> Option<usize>;
    /// Returns `pa` to the allocator.
    fn free_frame(&mut self, pa: usize);
}

#[derive(Clone, Copy, Debug, Default)]
struct ShareState {
    aliases: usize,
    owner_released: bool,
}

/// Frame allocator plus the alias ledger for frames mapped shared-not-owned.
pub struct Frames<A> {
    allocator: A,
    shares: BTreeMap<usize, ShareState>,
}

impl<A: FrameAllocator> Frames<A> {
    pub fn new(allocator: A) -> Self {
        Self { allocator, shares: BTreeMap::new() }
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut A {
        &mut self.allocator
    }

    /// Allocates a zero-filled frame.
    pub fn allocate(&mut self) -> Option<usize> {
        let pa = self.allocator.allocate_frame()?;
        if pa % PAGE_SIZE != 0 {
            panic!("allocate_frame: unaligned frame {:#x}", pa);
        }
        // SAFETY: the allocator handed us exclusive ownership of a direct-mapped frame.
        unsafe { core::ptr::write_bytes(frame_ptr(pa), 0, PAGE_SIZE) };
        Some(pa)
    }

    /// Returns a frame nobody aliases (page-table nodes, unwound allocations).
    pub(crate) fn free(&mut self, pa: usize) {
        self.allocator.free_frame(pa);
    }

    /// Called when an owning leaf entry for `pa` is torn down.
    pub fn release(&mut self, pa: usize) {
        match self.shares.get_mut(&pa) {
            Some(state) => {
                if state.owner_released {
                    panic!("release: frame {:#x} released twice by its owner", pa);
                }
                state.owner_released = true;
                log_debug!(
                    target: "share",
                    "owner released {:#x}; {} alias(es) keep it alive",
                    pa,
                    state.aliases
                );
            }
            None => self.allocator.free_frame(pa),
        }
    }

    /// Records a new shared-not-owned entry for `pa`.
    pub fn share(&mut self, pa: usize) {
        let state = self.shares.entry(pa).or_default();
        state.aliases += 1;
        #[cfg(feature = "debug_uart")]
        log_trace!(target: "share", "share {:#x} aliases={}", pa, state.aliases);
    }

    /// Drops one shared-not-owned entry for `pa`, freeing the frame if it was the last holder.
    pub fn unshare(&mut self, pa: usize) {
        let Some(state) = self.shares.get_mut(&pa) else {
            panic!("unshare: frame {:#x} has no recorded aliases", pa);
        };
        state.aliases -= 1;
        #[cfg(feature = "debug_uart")]
        log_trace!(target: "share", "unshare {:#x} aliases={}", pa, state.aliases);
        if state.aliases == 0 {
            let released = state.owner_released;
            self.shares.remove(&pa);
            if released {
                log_debug!(target: "share", "last alias of {:#x} dropped; freeing", pa);
                self.allocator.free_frame(pa);
            }
        }
    }

    /// Number of shared-not-owned entries currently pointing at `pa`.
    pub fn alias_count(&self, pa: usize) -> usize {
        self.shares.get(&pa).map_or(0, |state| state.aliases)
    }

    /// Whether the owner of `pa` has already torn down its mapping.
    pub fn owner_released(&self, pa: usize) -> bool {
        self.shares.get(&pa).is_some_and(|state| state.owner_released)
    }
}

/// Direct-map view of a physical frame.
#[inline]
pub(crate) fn frame_ptr(pa: usize) -> *mut u8 {
    pa as *mut u8
}

#[repr(C, align(4096))]
struct HeapPage([u8; PAGE_SIZE]);

/// Frame source backed by the kernel heap.
///
/// Used during bring-up before the physical allocator is online and by host
/// tests. Tracks every live frame, rejects foreign or repeated frees, and can
/// be given an allocation budget to simulate exhaustion.
#[derive(Default)]
pub struct HeapFrameAllocator {
    live: BTreeSet<usize>,
    budget: Option<usize>,
}

impl HeapFrameAllocator {
    pub const fn new() -> Self {
        Self { live: BTreeSet::new(), budget: None }
    }

    /// Allows `remaining` more allocations before reporting exhaustion; `None` lifts the limit.
    pub fn set_budget(&mut self, remaining: Option<usize>) {
        self.budget = remaining;
    }

    pub fn live_frames(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, pa: usize) -> bool {
        self.live.contains(&pa)
    }
}

impl FrameAllocator for HeapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<usize> {
        if let Some(remaining) = self.budget.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        let page = Box::new(HeapPage([0; PAGE_SIZE]));
        let pa = Box::into_raw(page) as usize;
        self.live.insert(pa);
        Some(pa)
    }

    fn free_frame(&mut self, pa: usize) {
        if !self.live.remove(&pa) {
            panic!("free_frame: {:#x} is not a live frame", pa);
        }
        // SAFETY: `pa` came from `Box::into_raw` in `allocate_frame` and was live until now.
        unsafe { drop(Box::from_raw(pa as *mut HeapPage)) };
    }
}

impl Drop for HeapFrameAllocator {
    fn drop(&mut self) {
        while let Some(pa) = self.live.pop_first() {
            // SAFETY: every live address originates from `Box::into_raw` and is unique.
            unsafe { drop(Box::from_raw(pa as *mut HeapPage)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_returns_aligned_zeroed_frames() {
        let mut frames = Frames::new(HeapFrameAllocator::new());
        let pa = frames.allocate().expect("frame");
        assert_eq!(pa % PAGE_SIZE, 0);
        let bytes = unsafe { core::slice::from_raw_parts(frame_ptr(pa), PAGE_SIZE) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn budget_simulates_exhaustion() {
        let mut alloc = HeapFrameAllocator::new();
        alloc.set_budget(Some(1));
        assert!(alloc.allocate_frame().is_some());
        assert!(alloc.allocate_frame().is_none());
        alloc.set_budget(None);
        assert!(alloc.allocate_frame().is_some());
        assert_eq!(alloc.live_frames(), 2);
    }

    #[test]
    #[should_panic(expected = "is not a live frame")]
    fn double_free_is_fatal() {
        let mut alloc = HeapFrameAllocator::new();
        let pa = alloc.allocate_frame().expect("frame");
        alloc.free_frame(pa);
        alloc.free_frame(pa);
    }

    #[test]
    fn release_without_aliases_frees_immediately() {
        let mut frames = Frames::new(HeapFrameAllocator::new());
        let pa = frames.allocate().expect("frame");
        frames.release(pa);
        assert!(!frames.allocator().is_live(pa));
    }

    #[test]
    fn last_alias_frees_after_owner_release() {
        let mut frames = Frames::new(HeapFrameAllocator::new());
        let pa = frames.allocate().expect("frame");
        frames.share(pa);
        frames.share(pa);
        frames.release(pa);
        assert!(frames.allocator().is_live(pa));
        assert!(frames.owner_released(pa));
        frames.unshare(pa);
        assert_eq!(frames.alias_count(pa), 1);
        assert!(frames.allocator().is_live(pa));
        frames.unshare(pa);
        assert!(!frames.allocator().is_live(pa));
        assert_eq!(frames.alias_count(pa), 0);
    }

    #[test]
    fn alias_drop_before_owner_keeps_frame() {
        let mut frames = Frames::new(HeapFrameAllocator::new());
        let pa = frames.allocate().expect("frame");
        frames.share(pa);
        frames.unshare(pa);
        assert!(frames.allocator().is_live(pa));
        frames.release(pa);
        assert!(!frames.allocator().is_live(pa));
    }

    #[test]
    #[should_panic(expected = "no recorded aliases")]
    fn unshare_without_alias_is_fatal() {
        let mut frames = Frames::new(HeapFrameAllocator::new());
        let pa = frames.allocate().expect("frame");
        frames.unshare(pa);
    }
}
