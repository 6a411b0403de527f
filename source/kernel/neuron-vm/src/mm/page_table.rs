// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page-table implementation with lazy allocation of intermediate levels.
//!
//! Every node is one frame of 512 entries owned by its parent; the root is
//! owned by the [`PageTable`] handle. Leaves reference frames owned by the
//! address space unless they carry [`PageFlags::SHARED`].

use core::fmt;
use core::ops::Range;

use static_assertions::const_assert_eq;

use super::frame::{FrameAllocator, Frames};
use super::{
    page_round_down, PageFlags, VmError, LEAF_PERMS, LEVELS, MAXVA, PAGE_SHIFT, PAGE_SIZE,
    PT_ENTRIES,
};

/// Low PTE bits holding flags; the PPN starts above them.
const PTE_FLAG_BITS: usize = 10;
const INDEX_BITS: usize = 9;

/// Sv39 page-table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(usize);

impl Pte {
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn new(pa: usize, flags: PageFlags) -> Self {
        Self(((pa >> PAGE_SHIFT) << PTE_FLAG_BITS) | flags.bits())
    }

    #[inline]
    pub const fn bits(self) -> usize {
        self.0
    }

    /// Physical address of the frame or child table.
    #[inline]
    pub const fn pa(self) -> usize {
        (self.0 >> PTE_FLAG_BITS) << PAGE_SHIFT
    }

    #[inline]
    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & ((1 << PTE_FLAG_BITS) - 1))
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 & PageFlags::VALID.bits() != 0
    }

    /// Valid and carrying at least one of R/W/X.
    #[inline]
    pub fn is_leaf(self) -> bool {
        self.is_valid() && self.0 & LEAF_PERMS.bits() != 0
    }

    #[inline]
    pub fn is_user(self) -> bool {
        self.0 & PageFlags::USER.bits() != 0
    }

    #[inline]
    pub fn is_shared(self) -> bool {
        self.0 & PageFlags::SHARED.bits() != 0
    }

    #[inline]
    pub(crate) fn clear(&mut self, flags: PageFlags) {
        self.0 &= !flags.bits();
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pte({:#x} {:?})", self.pa(), self.flags())
    }
}

#[repr(C, align(4096))]
struct TablePage {
    entries: [Pte; PT_ENTRIES],
}

const_assert_eq!(core::mem::size_of::<TablePage>(), PAGE_SIZE);

#[inline]
fn node(pa: usize) -> *mut TablePage {
    pa as *mut TablePage
}

/// Copies entry `index` out of the node at `table`.
#[inline]
fn entry(table: usize, index: usize) -> Pte {
    // SAFETY: `table` is a live node reached from a root this module owns.
    unsafe { (*node(table)).entries[index] }
}

#[inline]
const fn px(level: usize, va: usize) -> usize {
    (va >> (PAGE_SHIFT + INDEX_BITS * level)) & (PT_ENTRIES - 1)
}

/// Bytes of virtual address space covered by one entry at `level`.
#[inline]
const fn span(level: usize) -> usize {
    1 << (PAGE_SHIFT + INDEX_BITS * level)
}

/// Indices of a `level` node based at `base` whose span intersects `[start, end)`.
fn index_range(level: usize, base: usize, start: usize, end: usize) -> Range<usize> {
    let step = span(level);
    let lo = start.saturating_sub(base) / step;
    let hi = if end > base { (end - base).div_ceil(step).min(PT_ENTRIES) } else { 0 };
    lo.min(hi)..hi
}

/// Drops a leaf's claim on its frame.
///
/// Shared-not-owned leaves always give up their alias; owned frames are
/// released only when `free` is set.
fn release_leaf<A: FrameAllocator>(frames: &mut Frames<A>, pte: Pte, free: bool) {
    if pte.is_shared() {
        frames.unshare(pte.pa());
    } else if free {
        frames.release(pte.pa());
    }
}

/// Structural defect reported by [`PageTable::verify`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PtViolation {
    pub level: usize,
    pub index: usize,
    pub entry: Pte,
}

/// Three-level Sv39 page table allocating intermediate levels on demand.
pub struct PageTable {
    root: usize,
}

impl PageTable {
    /// Allocates a zeroed root node.
    pub fn new<A: FrameAllocator>(frames: &mut Frames<A>) -> Result<Self, VmError> {
        let root = frames.allocate().ok_or(VmError::OutOfMemory)?;
        Ok(Self { root })
    }

    pub fn root_pa(&self) -> usize {
        self.root
    }

    /// Returns the physical page number of the root page suitable for SATP.
    pub fn root_ppn(&self) -> usize {
        self.root >> PAGE_SHIFT
    }

    /// Returns the leaf slot for `va`, allocating missing intermediate tables when `alloc` is set.
    ///
    /// `None` when `va >= MAXVA`, when a table is missing and `alloc` is false,
    /// or when the allocator is exhausted.
    pub fn walk<A: FrameAllocator>(
        &mut self,
        frames: &mut Frames<A>,
        va: usize,
        alloc: bool,
    ) -> Option<&mut Pte> {
        if va >= MAXVA {
            return None;
        }
        let mut table = self.root;
        for level in (1..LEVELS).rev() {
            // SAFETY: `table` is a node of this tree; `&mut self` gives exclusive access.
            let slot = unsafe { &mut (*node(table)).entries[px(level, va)] };
            if slot.is_valid() {
                if slot.is_leaf() {
                    panic!("walk: leaf at level {} for va {:#x}", level, va);
                }
                table = slot.pa();
            } else {
                if !alloc {
                    return None;
                }
                let child = frames.allocate()?;
                *slot = Pte::new(child, PageFlags::VALID);
                table = child;
            }
        }
        // SAFETY: as above; the returned borrow is tied to `&mut self`.
        Some(unsafe { &mut (*node(table)).entries[px(0, va)] })
    }

    /// Non-allocating walk; the slot may hold an invalid entry.
    fn slot(&self, va: usize) -> Option<*mut Pte> {
        if va >= MAXVA {
            return None;
        }
        let mut table = self.root;
        for level in (1..LEVELS).rev() {
            let pte = entry(table, px(level, va));
            if !pte.is_valid() || pte.is_leaf() {
                return None;
            }
            table = pte.pa();
        }
        // SAFETY: `table` is a live level-0 node of this tree.
        Some(unsafe { core::ptr::addr_of_mut!((*node(table)).entries[px(0, va)]) })
    }

    /// Returns the valid leaf entry for `va`'s page, regardless of privilege.
    pub fn lookup(&self, va: usize) -> Option<Pte> {
        let slot = self.slot(va)?;
        // SAFETY: `slot` points into a live node of this tree.
        let pte = unsafe { *slot };
        pte.is_valid().then_some(pte)
    }

    /// Non-allocating mutable walk.
    pub(crate) fn entry_mut(&mut self, va: usize) -> Option<&mut Pte> {
        // SAFETY: `&mut self` gives exclusive access to every node of the tree.
        self.slot(va).map(|slot| unsafe { &mut *slot })
    }

    /// Physical frame backing `va`'s page if it is mapped and user-accessible.
    pub fn translate(&self, va: usize) -> Option<usize> {
        let pte = self.lookup(va)?;
        pte.is_user().then(|| pte.pa())
    }

    /// Installs leaves for every page of `[va, va + size)` at consecutive frames from `pa`.
    ///
    /// Panics on a remap: an already-valid target means the caller's view of
    /// the address space is corrupt.
    pub fn map_range<A: FrameAllocator>(
        &mut self,
        frames: &mut Frames<A>,
        va: usize,
        size: usize,
        pa: usize,
        flags: PageFlags,
    ) -> Result<(), VmError> {
        if size == 0 {
            panic!("map_range: zero size at {:#x}", va);
        }
        if !flags.intersects(LEAF_PERMS) {
            panic!("map_range: flags {:?} do not describe a leaf", flags);
        }
        let mut addr = page_round_down(va);
        let last = va.checked_add(size - 1).map(page_round_down).ok_or(VmError::OutOfRange)?;
        if last >= MAXVA {
            return Err(VmError::OutOfRange);
        }
        let mut frame = pa;
        loop {
            let slot = self.walk(frames, addr, true).ok_or(VmError::OutOfMemory)?;
            if slot.is_valid() {
                log_error!(target: "pt", "remap at va {:#x} (existing {:?})", addr, slot);
                panic!("map_range: remap at {:#x}", addr);
            }
            *slot = Pte::new(frame, flags | PageFlags::VALID);
            if addr == last {
                return Ok(());
            }
            addr += PAGE_SIZE;
            frame += PAGE_SIZE;
        }
    }

    /// Clears `npages` consecutive leaves starting at the page-aligned `va`.
    ///
    /// Every page must be mapped. With `free`, owned frames are released;
    /// shared-not-owned leaves only drop their alias.
    pub fn unmap_range<A: FrameAllocator>(
        &mut self,
        frames: &mut Frames<A>,
        va: usize,
        npages: usize,
        free: bool,
    ) {
        if va % PAGE_SIZE != 0 {
            panic!("unmap_range: unaligned va {:#x}", va);
        }
        for page in 0..npages {
            let addr = va + page * PAGE_SIZE;
            let Some(slot) = self.entry_mut(addr) else {
                panic!("unmap_range: not mapped at {:#x}", addr);
            };
            if !slot.is_valid() {
                panic!("unmap_range: not mapped at {:#x}", addr);
            }
            if !slot.is_leaf() {
                panic!("unmap_range: not a leaf at {:#x}", addr);
            }
            let pte = core::mem::replace(slot, Pte::EMPTY);
            release_leaf(frames, pte, free);
        }
    }

    /// Clears every present leaf in `[start, end)`, skipping holes. Returns the number cleared.
    pub fn unmap_present<A: FrameAllocator>(
        &mut self,
        frames: &mut Frames<A>,
        start: usize,
        end: usize,
        free: bool,
    ) -> usize {
        let mut cleared = 0;
        self.visit_leaves(start, end, &mut |va, slot| {
            if !slot.is_leaf() {
                panic!("unmap_present: not a leaf at {:#x}", va);
            }
            let pte = core::mem::replace(slot, Pte::EMPTY);
            release_leaf(frames, pte, free);
            cleared += 1;
        });
        cleared
    }

    /// Calls `f(va, pte)` for each valid level-0 entry in `[start, end)`, in address order.
    pub fn for_each_leaf(&self, start: usize, end: usize, mut f: impl FnMut(usize, Pte)) {
        self.visit_leaves(start, end, &mut |va, slot| f(va, *slot));
    }

    /// Number of valid leaves in the whole tree.
    pub fn mapped_pages(&self) -> usize {
        let mut count = 0;
        self.for_each_leaf(0, MAXVA, |_, _| count += 1);
        count
    }

    fn visit_leaves(&self, start: usize, end: usize, visit: &mut dyn FnMut(usize, &mut Pte)) {
        let end = end.min(MAXVA);
        if start >= end {
            return;
        }
        for i2 in index_range(2, 0, start, end) {
            let upper = entry(self.root, i2);
            if !upper.is_valid() {
                continue;
            }
            if upper.is_leaf() {
                panic!("visit_leaves: leaf at level 2 index {}", i2);
            }
            let base2 = i2 * span(2);
            for i1 in index_range(1, base2, start, end) {
                let middle = entry(upper.pa(), i1);
                if !middle.is_valid() {
                    continue;
                }
                if middle.is_leaf() {
                    panic!("visit_leaves: leaf at level 1 index {}", i1);
                }
                let base1 = base2 + i1 * span(1);
                for i0 in index_range(0, base1, start, end) {
                    // SAFETY: `middle` points at a live level-0 node of this tree.
                    let slot = unsafe { &mut (*node(middle.pa())).entries[i0] };
                    if slot.is_valid() {
                        visit(base1 + i0 * PAGE_SIZE, slot);
                    }
                }
            }
        }
    }

    /// Frees every node of the tree, children before parents, root last.
    ///
    /// All leaves must already be unmapped; a remaining leaf is fatal.
    pub fn free<A: FrameAllocator>(self, frames: &mut Frames<A>) {
        // (node, next index) per level; depth is fixed so the stack is too.
        let mut stack = [(0usize, 0usize); LEVELS];
        let mut depth = 0;
        stack[0] = (self.root, 0);
        loop {
            let (table, index) = stack[depth];
            if index == PT_ENTRIES {
                frames.free(table);
                if depth == 0 {
                    return;
                }
                depth -= 1;
                continue;
            }
            stack[depth].1 += 1;
            // SAFETY: `table` is a node of the tree being consumed.
            let slot = unsafe { &mut (*node(table)).entries[index] };
            if !slot.is_valid() {
                continue;
            }
            if slot.is_leaf() {
                panic!("free: leaf {:?} at depth {} index {}", slot, depth, index);
            }
            if depth + 1 == LEVELS {
                panic!("free: table pointer below the last level at index {}", index);
            }
            let child = slot.pa();
            *slot = Pte::EMPTY;
            depth += 1;
            stack[depth] = (child, 0);
        }
    }

    /// Checks structural invariants: pointer entries above level 0, leaves only at level 0.
    pub fn verify(&self) -> Result<(), PtViolation> {
        let pointer_only = LEAF_PERMS | PageFlags::USER | PageFlags::SHARED;
        for i2 in 0..PT_ENTRIES {
            let upper = entry(self.root, i2);
            if !upper.is_valid() {
                continue;
            }
            if upper.flags().intersects(pointer_only) {
                return Err(PtViolation { level: 2, index: i2, entry: upper });
            }
            for i1 in 0..PT_ENTRIES {
                let middle = entry(upper.pa(), i1);
                if !middle.is_valid() {
                    continue;
                }
                if middle.flags().intersects(pointer_only) {
                    return Err(PtViolation { level: 1, index: i1, entry: middle });
                }
                for i0 in 0..PT_ENTRIES {
                    let leaf = entry(middle.pa(), i0);
                    if leaf.is_valid() && !leaf.is_leaf() {
                        return Err(PtViolation { level: 0, index: i0, entry: leaf });
                    }
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTable").field("root", &format_args!("{:#x}", self.root)).finish()
    }
}
