// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: VM syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context
//! DEPENDS_ON: task::ProcessTable, mm::{AddressSpace, Frames, share}
//! INVARIANTS: Decode→Check→Execute; the caller is always the destination of a shared mapping

use crate::mm::{map_shared, unmap_shared, FrameAllocator, Frames, PageFlags, SharePlan, VmError};
use crate::task::{Pid, ProcessTable};
use crate::types::{ByteLen, VirtAddr};

use super::{
    Args, Error, SysResult, SyscallTable, SYSCALL_MAP_SHARED_PAGES, SYSCALL_SBRK,
    SYSCALL_UNMAP_SHARED_PAGES,
};

// Typed decoders for Decode→Check→Execute

#[derive(Copy, Clone)]
struct SbrkArgsTyped {
    delta: isize,
}

impl SbrkArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self { delta: args.get(0) as isize }
    }
}

#[derive(Copy, Clone)]
struct MapSharedArgsTyped {
    va: VirtAddr,
    source: Pid,
    len: ByteLen,
}

impl MapSharedArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let va = VirtAddr::new(args.get(0)).ok_or(VmError::BadAddress)?;
        let source =
            u32::try_from(args.get(1)).map(Pid::from_raw).map_err(|_| Error::NoSuchProcess)?;
        let len = ByteLen::new(args.get(2)).ok_or(VmError::InvalidArgs)?;
        Ok(Self { va, source, len })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        self.va.span_end(self.len).ok_or(VmError::OutOfRange)?;
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct UnmapSharedArgsTyped {
    va: VirtAddr,
    len: ByteLen,
}

impl UnmapSharedArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let va = VirtAddr::new(args.get(0)).ok_or(VmError::BadAddress)?;
        let len = ByteLen::new(args.get(1)).ok_or(VmError::InvalidArgs)?;
        Ok(Self { va, len })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        self.va.span_end(self.len).ok_or(VmError::BadAddress)?;
        Ok(())
    }
}

/// Execution context shared across syscalls.
pub struct Context<'a, A> {
    pub processes: &'a mut dyn ProcessTable,
    pub frames: &'a mut Frames<A>,
}

impl<'a, A: FrameAllocator> Context<'a, A> {
    /// Creates a new context for the current process.
    pub fn new(processes: &'a mut dyn ProcessTable, frames: &'a mut Frames<A>) -> Self {
        Self { processes, frames }
    }
}

/// Registers the VM syscall handlers.
pub fn install_handlers<A: FrameAllocator>(table: &mut SyscallTable<A>) {
    table.register(SYSCALL_SBRK, sys_sbrk::<A>);
    table.register(SYSCALL_MAP_SHARED_PAGES, sys_map_shared_pages::<A>);
    table.register(SYSCALL_UNMAP_SHARED_PAGES, sys_unmap_shared_pages::<A>);
}

fn sys_sbrk<A: FrameAllocator>(ctx: &mut Context<'_, A>, args: &Args) -> SysResult<usize> {
    let typed = SbrkArgsTyped::decode(args);
    let pid = ctx.processes.current_pid();
    let space = ctx.processes.address_space_mut(pid).ok_or(Error::NoSuchProcess)?;
    let old_size = space.size();
    let magnitude = typed.delta.unsigned_abs();
    if typed.delta >= 0 {
        let new_size = old_size.checked_add(magnitude).ok_or(VmError::OutOfRange)?;
        space.grow(ctx.frames, new_size, PageFlags::WRITE)?;
    } else {
        let new_size = old_size.checked_sub(magnitude).ok_or(VmError::InvalidArgs)?;
        space.shrink(ctx.frames, new_size);
    }
    Ok(old_size)
}

fn sys_map_shared_pages<A: FrameAllocator>(
    ctx: &mut Context<'_, A>,
    args: &Args,
) -> SysResult<usize> {
    let typed = MapSharedArgsTyped::decode(args)?;
    typed.check()?;
    let caller = ctx.processes.current_pid();
    let (va, len) = (typed.va.raw(), typed.len.raw());
    let mapped = if typed.source == caller {
        let space = ctx.processes.address_space_mut(caller).ok_or(Error::NoSuchProcess)?;
        SharePlan::collect(space.page_table(), va, len)?.install(space, ctx.frames)?
    } else {
        let (source, dest) =
            ctx.processes.address_space_pair(typed.source, caller).ok_or(Error::NoSuchProcess)?;
        map_shared(source, dest, ctx.frames, va, len)?
    };
    log_debug!(
        target: "syscall",
        "map_shared_pages pid={} src={} va={:#x} len={:#x} -> {:#x}",
        caller,
        typed.source,
        va,
        len,
        mapped
    );
    Ok(mapped)
}

fn sys_unmap_shared_pages<A: FrameAllocator>(
    ctx: &mut Context<'_, A>,
    args: &Args,
) -> SysResult<usize> {
    let typed = UnmapSharedArgsTyped::decode(args)?;
    typed.check()?;
    let caller = ctx.processes.current_pid();
    let space = ctx.processes.address_space_mut(caller).ok_or(Error::NoSuchProcess)?;
    unmap_shared(space, typed.va.raw(), typed.len.raw())?;
    Ok(0)
}
