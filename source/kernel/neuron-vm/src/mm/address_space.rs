// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-process Sv39 address spaces: the user region from 0 up to `size`
//! plus any shared mappings placed in the upper half.

extern crate alloc;

use alloc::vec::Vec;

use super::frame::{frame_ptr, FrameAllocator, Frames};
use super::page_table::{PageTable, Pte};
use super::{page_round_up, PageFlags, VmError, MAXVA, PAGE_SIZE};

/// Tracks the state of a single user address space.
pub struct AddressSpace {
    page_table: PageTable,
    size: usize,
}

impl AddressSpace {
    /// Creates an empty address space with a zeroed root table and size 0.
    pub fn create<A: FrameAllocator>(frames: &mut Frames<A>) -> Result<Self, VmError> {
        let page_table = PageTable::new(frames)?;
        log_debug!(target: "as", "create root={:#x}", page_table.root_pa());
        Ok(Self { page_table, size: 0 })
    }

    /// Borrows the page table for read-only inspection.
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub(crate) fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.page_table
    }

    /// Top of the user region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    /// Physical frame behind `va` if it is mapped user-accessible.
    pub fn translate(&self, va: usize) -> Option<usize> {
        self.page_table.translate(va)
    }

    /// Returns the SATP value describing this address space.
    pub fn satp_value(&self) -> usize {
        const MODE_SV39: usize = 8;
        (MODE_SV39 << 60) | self.page_table.root_ppn()
    }

    /// Maps page 0 to a fresh frame holding `image` with user R/W/X.
    ///
    /// Panics if `image` does not fit in one page.
    pub fn load_initial_image<A: FrameAllocator>(
        &mut self,
        frames: &mut Frames<A>,
        image: &[u8],
    ) -> Result<(), VmError> {
        if image.len() > PAGE_SIZE {
            panic!("load_initial_image: {} bytes exceed one page", image.len());
        }
        let frame = frames.allocate().ok_or(VmError::OutOfMemory)?;
        // SAFETY: the frame was just allocated and is exclusively ours.
        unsafe { core::ptr::copy_nonoverlapping(image.as_ptr(), frame_ptr(frame), image.len()) };
        let flags = PageFlags::READ | PageFlags::WRITE | PageFlags::EXECUTE | PageFlags::USER;
        if let Err(err) = self.page_table.map_range(frames, 0, PAGE_SIZE, frame, flags) {
            frames.free(frame);
            return Err(err);
        }
        self.size = PAGE_SIZE;
        Ok(())
    }

    /// Extends the user region to `new_size` with zeroed pages mapped `R|U|extra`.
    ///
    /// Returns the resulting size; a `new_size` below the current size is a
    /// no-op returning the current size. On failure every page installed by
    /// this call is unmapped and freed and the size is unchanged.
    pub fn grow<A: FrameAllocator>(
        &mut self,
        frames: &mut Frames<A>,
        new_size: usize,
        extra: PageFlags,
    ) -> Result<usize, VmError> {
        let old_size = self.size;
        if new_size < old_size {
            return Ok(old_size);
        }
        if new_size > MAXVA {
            return Err(VmError::OutOfRange);
        }
        let flags = PageFlags::READ | PageFlags::USER | extra;
        let first = page_round_up(old_size);
        let mut va = first;
        while va < new_size {
            let result = match frames.allocate() {
                Some(frame) => {
                    let mapped = self.page_table.map_range(frames, va, PAGE_SIZE, frame, flags);
                    if mapped.is_err() {
                        frames.free(frame);
                    }
                    mapped
                }
                None => Err(VmError::OutOfMemory),
            };
            if let Err(err) = result {
                log_warn!(target: "as", "grow {:#x}->{:#x} failed at {:#x}: {}", old_size, new_size, va, err);
                self.page_table.unmap_range(frames, first, (va - first) / PAGE_SIZE, true);
                return Err(err);
            }
            va += PAGE_SIZE;
        }
        self.size = new_size;
        self.verify_after("grow");
        Ok(new_size)
    }

    /// Releases the pages between `new_size` and the current size (page-rounded).
    ///
    /// Returns the resulting size; a `new_size` at or above the current size is a no-op.
    pub fn shrink<A: FrameAllocator>(&mut self, frames: &mut Frames<A>, new_size: usize) -> usize {
        let old_size = self.size;
        if new_size >= old_size {
            return old_size;
        }
        let start = page_round_up(new_size);
        let end = page_round_up(old_size);
        if start < end {
            let cleared = self.page_table.unmap_present(frames, start, end, true);
            log_debug!(target: "as", "shrink {:#x}->{:#x} cleared {} page(s)", old_size, new_size, cleared);
        }
        self.size = new_size;
        new_size
    }

    /// Tears down every mapping and frees the table structure.
    ///
    /// Owned frames are released; shared aliases only drop their reference.
    pub fn destroy<A: FrameAllocator>(mut self, frames: &mut Frames<A>) {
        let root = self.page_table.root_pa();
        let cleared = self.page_table.unmap_present(frames, 0, MAXVA, true);
        self.page_table.free(frames);
        log_debug!(target: "as", "destroy root={:#x} released {} page(s)", root, cleared);
    }

    /// Deep-copies every mapped page below `size` into `child` and sets its size.
    ///
    /// The child gets private frames with the parent's permissions; shared
    /// aliases become private copies. On failure the pages installed by this
    /// call are unmapped and freed again; anything `child` already held stays.
    pub fn duplicate_into<A: FrameAllocator>(
        &self,
        child: &mut AddressSpace,
        frames: &mut Frames<A>,
    ) -> Result<(), VmError> {
        let mut leaves: Vec<(usize, Pte)> = Vec::new();
        self.page_table.for_each_leaf(0, self.size, |va, pte| leaves.push((va, pte)));
        for (copied, &(va, pte)) in leaves.iter().enumerate() {
            if let Err(err) = child.copy_page_from(frames, va, pte) {
                log_warn!(target: "as", "duplicate failed at {:#x}: {}", va, err);
                for &(installed, _) in &leaves[..copied] {
                    child.page_table.unmap_range(frames, installed, 1, true);
                }
                return Err(err);
            }
        }
        child.size = self.size;
        child.verify_after("duplicate");
        Ok(())
    }

    fn copy_page_from<A: FrameAllocator>(
        &mut self,
        frames: &mut Frames<A>,
        va: usize,
        pte: Pte,
    ) -> Result<(), VmError> {
        let frame = frames.allocate().ok_or(VmError::OutOfMemory)?;
        // SAFETY: `pte` references a live frame; `frame` is freshly allocated and distinct.
        unsafe { core::ptr::copy_nonoverlapping(frame_ptr(pte.pa()), frame_ptr(frame), PAGE_SIZE) };
        let flags = pte.flags().difference(PageFlags::SHARED);
        self.page_table.map_range(frames, va, PAGE_SIZE, frame, flags).inspect_err(|_| frames.free(frame))
    }

    /// Creates a child address space holding a private copy of this one.
    pub fn fork<A: FrameAllocator>(&self, frames: &mut Frames<A>) -> Result<AddressSpace, VmError> {
        let mut child = AddressSpace::create(frames)?;
        if let Err(err) = self.duplicate_into(&mut child, frames) {
            child.destroy(frames);
            return Err(err);
        }
        Ok(child)
    }

    /// Revokes user access to the page holding `va`; the mapping stays valid.
    ///
    /// Panics if the page has no valid entry.
    pub fn clear_user_access(&mut self, va: usize) {
        match self.page_table.entry_mut(va) {
            Some(pte) if pte.is_valid() => pte.clear(PageFlags::USER),
            _ => panic!("clear_user_access: no entry for {:#x}", va),
        }
    }

    #[cfg(feature = "debug_pt_verify")]
    pub(crate) fn verify_after(&self, op: &str) {
        if let Err(violation) = self.page_table.verify() {
            log_error!(target: "pt", "PT-VERIFY: {:?} after {}", violation, op);
        }
    }

    #[cfg(not(feature = "debug_pt_verify"))]
    #[inline]
    pub(crate) fn verify_after(&self, _op: &str) {}
}
