// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process-table seam used by the syscall front
//! OWNERS: @kernel-team
//! PUBLIC API: ProcessTable, SpaceTable, Pid
//! DEPENDS_ON: mm::AddressSpace
//! INVARIANTS: A pair lookup never hands out two borrows of the same address space

extern crate alloc;

use alloc::vec::Vec;

use crate::mm::AddressSpace;
pub use crate::types::Pid;

/// Lookup of processes and their address spaces, provided by the scheduler.
pub trait ProcessTable {
    /// PID of the process on whose behalf the syscall runs.
    fn current_pid(&self) -> Pid;

    /// Address space of `pid`, if such a process exists.
    fn address_space_mut(&mut self, pid: Pid) -> Option<&mut AddressSpace>;

    /// Disjoint borrows of two distinct processes' address spaces.
    ///
    /// Returns `None` if either PID is unknown or both name the same process.
    fn address_space_pair(
        &mut self,
        source: Pid,
        dest: Pid,
    ) -> Option<(&AddressSpace, &mut AddressSpace)>;
}

/// Slot-indexed process table; the PID is the slot index.
#[derive(Default)]
pub struct SpaceTable {
    slots: Vec<Option<AddressSpace>>,
    current: Option<Pid>,
}

impl SpaceTable {
    pub const fn new() -> Self {
        Self { slots: Vec::new(), current: None }
    }

    /// Stores `space` in the first free slot and returns its PID.
    pub fn insert(&mut self, space: AddressSpace) -> Pid {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(free) => {
                self.slots[free] = Some(space);
                free
            }
            None => {
                self.slots.push(Some(space));
                self.slots.len() - 1
            }
        };
        let pid = Pid::from_raw(index as u32);
        if self.current.is_none() {
            self.current = Some(pid);
        }
        pid
    }

    /// Takes the address space of `pid` out of the table.
    pub fn remove(&mut self, pid: Pid) -> Option<AddressSpace> {
        let space = self.slots.get_mut(pid.as_raw() as usize)?.take();
        if self.current == Some(pid) {
            self.current = None;
        }
        space
    }

    /// Makes `pid` the current process. Panics if it does not exist.
    pub fn set_current(&mut self, pid: Pid) {
        if self.get(pid).is_none() {
            panic!("set_current: no process {}", pid);
        }
        self.current = Some(pid);
    }

    pub fn get(&self, pid: Pid) -> Option<&AddressSpace> {
        self.slots.get(pid.as_raw() as usize).and_then(Option::as_ref)
    }
}

impl ProcessTable for SpaceTable {
    fn current_pid(&self) -> Pid {
        match self.current {
            Some(pid) => pid,
            None => panic!("current_pid: no current process"),
        }
    }

    fn address_space_mut(&mut self, pid: Pid) -> Option<&mut AddressSpace> {
        self.slots.get_mut(pid.as_raw() as usize).and_then(Option::as_mut)
    }

    fn address_space_pair(
        &mut self,
        source: Pid,
        dest: Pid,
    ) -> Option<(&AddressSpace, &mut AddressSpace)> {
        let (src, dst) = (source.as_raw() as usize, dest.as_raw() as usize);
        if src == dst || src >= self.slots.len() || dst >= self.slots.len() {
            return None;
        }
        if src < dst {
            let (low, high) = self.slots.split_at_mut(dst);
            Some((low[src].as_ref()?, high[0].as_mut()?))
        } else {
            let (low, high) = self.slots.split_at_mut(src);
            Some((high[0].as_ref()?, low[dst].as_mut()?))
        }
    }
}
