// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal newtypes for safer syscall decoding (debug-friendly, low overhead)
//! OWNERS: @kernel-team
//! PUBLIC API: VirtAddr, ByteLen, Pid
//! DEPENDS_ON: mm::MAXVA
//! INVARIANTS: VirtAddr is always below MAXVA; ByteLen is never zero

use core::fmt;

use crate::mm::MAXVA;

/// User virtual address decoded from a syscall register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub fn new(addr: usize) -> Option<Self> {
        if addr < MAXVA {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub fn raw(self) -> usize {
        self.0
    }

    /// Returns the exclusive end of a `len`-byte range starting here, if it stays below MAXVA.
    #[inline]
    pub fn span_end(self, len: ByteLen) -> Option<usize> {
        self.0.checked_add(len.raw()).filter(|end| *end <= MAXVA)
    }
}

/// Non-zero byte count decoded from a syscall register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ByteLen(usize);

impl ByteLen {
    #[inline]
    pub fn new(bytes: usize) -> Option<Self> {
        if bytes == 0 {
            None
        } else {
            Some(Self(bytes))
        }
    }

    #[inline]
    pub fn raw(self) -> usize {
        self.0
    }
}

/// Process identifier.
///
/// **Ownership**: Only the process table creates PIDs; this subsystem only compares them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// Creates a PID from a raw value.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw PID value.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}
