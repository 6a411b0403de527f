// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel page table built once at boot and shared by every hart
//! OWNERS: @kernel-mm-team
//! PUBLIC API: KernelLayout, build, init, get, activate, kstack
//! DEPENDS_ON: PageTable, Frames, riscv (satp/sfence on target)
//! INVARIANTS: init runs exactly once; the table is never torn down after init

use spin::Once;

use super::frame::{FrameAllocator, Frames};
use super::page_table::PageTable;
use super::{PageFlags, VmError, MAXVA, PAGE_SIZE, TRAMPOLINE};

static KERNEL_TABLE: Once<PageTable> = Once::new();

/// Physical layout the kernel table identity-maps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelLayout {
    pub uart0: usize,
    pub virtio0: usize,
    pub plic: usize,
    pub plic_len: usize,
    pub kernbase: usize,
    /// End of kernel text; must be page aligned.
    pub etext: usize,
    pub phystop: usize,
    /// Physical page holding the trampoline code.
    pub trampoline: usize,
    /// Number of per-process kernel stacks to map.
    pub nproc: usize,
}

impl KernelLayout {
    /// QEMU `virt` machine with 128 MiB of RAM.
    pub const fn qemu_virt(etext: usize, trampoline: usize, nproc: usize) -> Self {
        const KERNBASE: usize = 0x8000_0000;
        Self {
            uart0: 0x1000_0000,
            virtio0: 0x1000_1000,
            plic: 0x0c00_0000,
            plic_len: 0x40_0000,
            kernbase: KERNBASE,
            etext,
            phystop: KERNBASE + 128 * 1024 * 1024,
            trampoline,
            nproc,
        }
    }
}

/// Virtual address of kernel stack `slot`; the page below each stack stays unmapped as a guard.
pub const fn kstack(slot: usize) -> usize {
    TRAMPOLINE - (slot + 1) * 2 * PAGE_SIZE
}

/// Builds a kernel page table for `layout`.
///
/// On failure the partially built table is torn down; identity mappings
/// never free their frames, kernel stacks do.
pub fn build<A: FrameAllocator>(
    frames: &mut Frames<A>,
    layout: &KernelLayout,
) -> Result<PageTable, VmError> {
    if layout.etext % PAGE_SIZE != 0 || layout.etext < layout.kernbase || layout.phystop < layout.etext {
        log_error!(target: "kvm", "bad layout {:?}", layout);
        return Err(VmError::InvalidArgs);
    }
    let mut table = PageTable::new(frames)?;
    if let Err(err) = map_segments(&mut table, frames, layout) {
        log_error!(target: "kvm", "kernel table build failed: {}", err);
        let stacks = kstack(layout.nproc.saturating_sub(1));
        table.unmap_present(frames, stacks, TRAMPOLINE, true);
        table.unmap_present(frames, 0, MAXVA, false);
        table.free(frames);
        return Err(err);
    }
    log_info!(target: "kvm", "kernel table root={:#x} stacks={}", table.root_pa(), layout.nproc);
    Ok(table)
}

fn map_segments<A: FrameAllocator>(
    table: &mut PageTable,
    frames: &mut Frames<A>,
    layout: &KernelLayout,
) -> Result<(), VmError> {
    let rw = PageFlags::READ | PageFlags::WRITE;
    let rx = PageFlags::READ | PageFlags::EXECUTE;
    identity(table, frames, layout.uart0, PAGE_SIZE, rw)?;
    identity(table, frames, layout.virtio0, PAGE_SIZE, rw)?;
    identity(table, frames, layout.plic, layout.plic_len, rw)?;
    identity(table, frames, layout.kernbase, layout.etext - layout.kernbase, rx)?;
    identity(table, frames, layout.etext, layout.phystop - layout.etext, rw)?;
    table.map_range(frames, TRAMPOLINE, PAGE_SIZE, layout.trampoline, rx)?;
    for slot in 0..layout.nproc {
        let frame = frames.allocate().ok_or(VmError::OutOfMemory)?;
        if let Err(err) = table.map_range(frames, kstack(slot), PAGE_SIZE, frame, rw) {
            frames.free(frame);
            return Err(err);
        }
    }
    Ok(())
}

fn identity<A: FrameAllocator>(
    table: &mut PageTable,
    frames: &mut Frames<A>,
    pa: usize,
    len: usize,
    flags: PageFlags,
) -> Result<(), VmError> {
    if len == 0 {
        return Ok(());
    }
    log_debug!(target: "kvm", "identity {:#x}..{:#x} {:?}", pa, pa + len, flags);
    table.map_range(frames, pa, len, pa, flags)
}

/// Builds the kernel table and publishes it. Panics if called twice.
pub fn init<A: FrameAllocator>(
    frames: &mut Frames<A>,
    layout: &KernelLayout,
) -> Result<&'static PageTable, VmError> {
    let mut built_here = false;
    let table = KERNEL_TABLE.try_call_once(|| {
        built_here = true;
        build(frames, layout)
    })?;
    if !built_here {
        panic!("kvm init: kernel page table already initialised");
    }
    Ok(table)
}

/// The kernel table, once [`init`] has run.
pub fn get() -> Option<&'static PageTable> {
    KERNEL_TABLE.get()
}

/// Switches the current hart to the kernel table. Panics before [`init`].
pub fn activate() {
    let Some(table) = get() else {
        panic!("kvm activate: kernel page table not initialised");
    };
    switch_root(table.root_ppn());
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn switch_root(ppn: usize) {
    use riscv::register::satp;

    // SAFETY: the kernel table identity-maps the running kernel image and stacks.
    unsafe {
        riscv::asm::sfence_vma_all();
        satp::set(satp::Mode::Sv39, 0, ppn);
        riscv::asm::sfence_vma_all();
    }
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
fn switch_root(ppn: usize) {
    log_debug!(target: "kvm", "activate ppn={:#x} (host: no-op)", ppn);
}

#[cfg(test)]
mod tests {
    use std::boxed::Box;
    use std::vec::Vec;

    use super::*;
    use crate::mm::HeapFrameAllocator;

    const ETEXT: usize = 0x8000_2000;
    const TRAMPOLINE_PA: usize = 0x8000_1000;

    #[test]
    fn qemu_layout_maps_devices_kernel_and_stacks() {
        let mut frames = Frames::new(HeapFrameAllocator::new());
        let layout = KernelLayout::qemu_virt(ETEXT, TRAMPOLINE_PA, 2);
        let table = build(&mut frames, &layout).expect("build");

        let uart = table.lookup(layout.uart0).expect("uart");
        assert_eq!(uart.pa(), layout.uart0);
        assert!(uart.flags().contains(PageFlags::READ | PageFlags::WRITE));
        assert!(!uart.is_user());
        assert_eq!(table.translate(layout.uart0), None);

        let plic_last = layout.plic + layout.plic_len - PAGE_SIZE;
        assert_eq!(table.lookup(plic_last).map(|pte| pte.pa()), Some(plic_last));
        assert!(table.lookup(layout.plic + layout.plic_len).is_none());

        let text = table.lookup(layout.kernbase).expect("text").flags();
        assert!(text.contains(PageFlags::EXECUTE) && !text.contains(PageFlags::WRITE));
        let data = table.lookup(ETEXT).expect("data").flags();
        assert!(data.contains(PageFlags::WRITE) && !data.contains(PageFlags::EXECUTE));
        assert!(table.lookup(layout.phystop - PAGE_SIZE).is_some());
        assert!(table.lookup(layout.phystop).is_none());

        assert_eq!(table.lookup(TRAMPOLINE).map(|pte| pte.pa()), Some(TRAMPOLINE_PA));
        for slot in 0..2 {
            let stack = table.lookup(kstack(slot)).expect("stack");
            assert!(frames.allocator().is_live(stack.pa()));
            assert!(table.lookup(kstack(slot) - PAGE_SIZE).is_none());
        }
        assert_eq!(table.verify(), Ok(()));
    }

    #[test]
    fn kernel_stacks_are_separated_by_guard_pages() {
        assert_eq!(kstack(0), TRAMPOLINE - 2 * PAGE_SIZE);
        assert_eq!(kstack(1), TRAMPOLINE - 4 * PAGE_SIZE);
    }

    #[test]
    fn build_rejects_unaligned_text_end() {
        let mut frames = Frames::new(HeapFrameAllocator::new());
        let layout = KernelLayout::qemu_virt(ETEXT + 8, TRAMPOLINE_PA, 1);
        assert!(matches!(build(&mut frames, &layout), Err(VmError::InvalidArgs)));
        assert_eq!(frames.allocator().live_frames(), 0);
    }

    #[test]
    fn build_unwinds_when_frames_run_out() {
        let mut frames = Frames::new(HeapFrameAllocator::new());
        frames.allocator_mut().set_budget(Some(10));
        let layout = KernelLayout::qemu_virt(ETEXT, TRAMPOLINE_PA, 4);
        assert!(matches!(build(&mut frames, &layout), Err(VmError::OutOfMemory)));
        assert_eq!(frames.allocator().live_frames(), 0);
    }

    #[test]
    fn init_publishes_once_when_harts_race() {
        let layout = KernelLayout::qemu_virt(ETEXT, TRAMPOLINE_PA, 1);
        assert!(get().is_none());
        let harts: Vec<_> = (0..2)
            .map(|_| {
                std::thread::spawn(move || {
                    let frames = Box::leak(Box::new(Frames::new(HeapFrameAllocator::new())));
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        init(&mut *frames, &layout).map(PageTable::root_pa)
                    }));
                    (outcome, frames.allocator().live_frames())
                })
            })
            .collect();

        let mut winners = 0;
        for hart in harts {
            match hart.join().expect("hart") {
                (Ok(root), _) => {
                    winners += 1;
                    assert_eq!(get().map(PageTable::root_pa), Some(root.expect("init")));
                }
                // The losing hart panics without building a second table.
                (Err(_), live) => assert_eq!(live, 0),
            }
        }
        assert_eq!(winners, 1);
        activate();
    }
}
