// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual memory primitives for Sv39.
//!
//! Physical memory is reached through the kernel direct map: a physical
//! address handed out by the frame allocator is dereferenceable at the same
//! numeric address. Every page-table node and every user frame is touched
//! through that mapping.

use core::fmt;

use bitflags::bitflags;
use static_assertions::const_assert;

pub mod address_space;
pub mod frame;
pub mod kernel;
pub mod page_table;
pub mod share;
pub mod uaccess;

pub use address_space::AddressSpace;
pub use frame::{FrameAllocator, Frames, HeapFrameAllocator};
pub use page_table::{PageTable, Pte, PtViolation};
pub use share::{map_shared, unmap_shared, SharePlan};

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;
/// Number of entries per Sv39 page-table page.
pub const PT_ENTRIES: usize = 512;
/// Depth of the radix tree.
pub const LEVELS: usize = 3;
/// One past the highest usable virtual address.
///
/// One bit below the Sv39 maximum so addresses never need sign extension.
pub const MAXVA: usize = 1 << (9 * LEVELS + PAGE_SHIFT - 1);
/// Highest page of every address space; the kernel maps its trampoline here.
pub const TRAMPOLINE: usize = MAXVA - PAGE_SIZE;

const_assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
const_assert!(PT_ENTRIES * core::mem::size_of::<usize>() == PAGE_SIZE);

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Flags stored in an Sv39 PTE.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
        /// Software bit (RSW): the frame belongs to another address space.
        const SHARED = 1 << 8;
    }
}

/// Permission bits that make an entry a leaf.
pub const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

/// Recoverable failures reported by the VM subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// The frame allocator could not supply a frame.
    OutOfMemory,
    /// A user address did not translate to an accessible page.
    BadAddress,
    /// No free virtual range large enough for a shared mapping.
    NoSpace,
    /// A source page for a shared mapping is missing or not user-accessible.
    BadSourceMapping,
    /// Address lies at or above MAXVA.
    OutOfRange,
    /// Arguments supplied by the caller were invalid.
    InvalidArgs,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            VmError::OutOfMemory => "out of memory",
            VmError::BadAddress => "bad address",
            VmError::NoSpace => "no free virtual range",
            VmError::BadSourceMapping => "bad source mapping",
            VmError::OutOfRange => "address beyond MAXVA",
            VmError::InvalidArgs => "invalid arguments",
        };
        f.write_str(text)
    }
}

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds up to the next page boundary; callers keep `addr` below MAXVA.
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[inline]
pub fn checked_page_round_up(addr: usize) -> Option<usize> {
    addr.checked_add(PAGE_SIZE - 1).map(page_round_down)
}

#[cfg(test)]
mod tests_prop;
