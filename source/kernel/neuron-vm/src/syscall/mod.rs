// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling for the VM entry points
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, encode, SYSCALL_* IDs
//! DEPENDS_ON: mm, task, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL window; stable IDs; decode/check/execute discipline

pub mod api;

use core::fmt;

use crate::mm::VmError;

/// Maximum number of syscalls supported by the dispatch table.
const MAX_SYSCALL: usize = 32;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in registers a0-a5.
#[derive(Default, Clone, Copy, Debug)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

/// Grows or shrinks the caller's user region by a signed byte delta; returns the old size.
pub const SYSCALL_SBRK: usize = 12;
/// Aliases another process's pages into the caller (a0 = source va, a1 = source pid, a2 = size).
pub const SYSCALL_MAP_SHARED_PAGES: usize = 22;
/// Revokes user access to a range of the caller's pages (a0 = va, a1 = size).
pub const SYSCALL_UNMAP_SHARED_PAGES: usize = 23;

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    InvalidSyscall,
    /// The referenced process does not exist.
    NoSuchProcess,
    /// The VM subsystem rejected the request.
    Vm(VmError),
}

impl From<VmError> for Error {
    fn from(value: VmError) -> Self {
        Self::Vm(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidSyscall => f.write_str("invalid syscall"),
            Error::NoSuchProcess => f.write_str("no such process"),
            Error::Vm(err) => write!(f, "vm: {}", err),
        }
    }
}

/// Encodes a handler result for the a0 return register; every error is `-1`.
#[inline]
pub fn encode(result: SysResult<usize>) -> usize {
    result.unwrap_or(usize::MAX)
}

/// Type alias for a syscall handler.
pub type Handler<A> = fn(&mut api::Context<'_, A>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable<A> {
    handlers: [Option<Handler<A>>; MAX_SYSCALL],
}

impl<A> SyscallTable<A> {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        Self { handlers: [None; MAX_SYSCALL] }
    }

    /// Registers a handler.
    pub fn register(&mut self, number: usize, handler: Handler<A>) {
        if number < MAX_SYSCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(
        &self,
        number: usize,
        ctx: &mut api::Context<'_, A>,
        args: &Args,
    ) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}

impl<A> Default for SyscallTable<A> {
    fn default() -> Self {
        Self::new()
    }
}
