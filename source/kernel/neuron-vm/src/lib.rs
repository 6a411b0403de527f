// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Sv39 virtual-memory subsystem of the NEURON kernel
//! OWNERS: @kernel-mm-team
//! PUBLIC API: mm (page tables, address spaces, user copies, shared mappings), syscall, task
//! DEPENDS_ON: external frame allocator (mm::frame::FrameAllocator), process table (task::ProcessTable)
//! INVARIANTS: remap / unmap-of-absent / malformed tree are fatal; aliased frames are freed by the last holder

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::unwrap_used)]

extern crate alloc;

#[macro_use]
pub mod log;

pub mod mm;
pub mod syscall;
pub mod task;
pub mod types;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod uart;
