// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! 16550 console on the QEMU `virt` machine; sink for `log_*` lines.

use core::fmt::{self, Write};
use spin::Mutex;

const UART0_BASE: usize = 0x1000_0000;
const THR: usize = 0x0;
const LSR: usize = 0x5;
const LSR_THR_EMPTY: u8 = 1 << 5;

static CONSOLE: Mutex<Console> = Mutex::new(Console { base: UART0_BASE });

/// Polled transmitter; the kernel page table identity-maps `UART0_BASE`.
pub struct Console {
    base: usize,
}

impl Console {
    /// Returns a guard for the console singleton.
    pub fn lock() -> spin::MutexGuard<'static, Console> {
        CONSOLE.lock()
    }

    fn put(&self, byte: u8) {
        let lsr = (self.base + LSR) as *const u8;
        let thr = (self.base + THR) as *mut u8;
        // SAFETY: LSR and THR are registers of the 16550 at `base`, identity-mapped R/W in the kernel table.
        unsafe {
            while core::ptr::read_volatile(lsr) & LSR_THR_EMPTY == 0 {}
            core::ptr::write_volatile(thr, byte);
        }
    }
}

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                self.put(b'\r');
            }
            self.put(byte);
        }
        Ok(())
    }
}
