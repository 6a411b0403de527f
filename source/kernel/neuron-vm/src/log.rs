// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Levelled, single-line diagnostics for the VM subsystem
//! OWNERS: @kernel-team
//! STATUS: Functional
//! PUBLIC API: log_error!/log_warn!/log_info!/log_debug!/log_trace!, emit(level,target,args)
//! DEPENDS_ON: uart::Console (riscv64 none), stderr (host unit tests)
//! INVARIANTS: Debug/Trace compiled out of release builds; one line per call

use core::fmt::Arguments;

/// Severity of a log line.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    pub const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    /// Debug and Trace only exist in builds with debug assertions.
    pub const fn enabled(self) -> bool {
        match self {
            Level::Debug | Level::Trace => cfg!(debug_assertions),
            Level::Error | Level::Warn | Level::Info => true,
        }
    }
}

/// Writes `[LEVEL target] message` to the sink if `level` is enabled.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if level.enabled() {
        sink(level, target, args);
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn sink(level: Level, target: &'static str, args: Arguments<'_>) {
    use core::fmt::Write;

    let mut console = crate::uart::Console::lock();
    let _ = write!(console, "[{} {}] ", level.tag(), target);
    let _ = console.write_fmt(args);
    let _ = console.write_char('\n');
}

#[cfg(all(test, not(all(target_arch = "riscv64", target_os = "none"))))]
fn sink(level: Level, target: &'static str, args: Arguments<'_>) {
    std::eprintln!("[{} {}] {}", level.tag(), target, args);
}

// Host library builds have no console.
#[cfg(not(any(test, all(target_arch = "riscv64", target_os = "none"))))]
fn sink(_level: Level, _target: &'static str, _args: Arguments<'_>) {}

#[doc(hidden)]
#[macro_export]
macro_rules! __vm_log {
    ($level:ident, target: $target:expr, $($arg:tt)+) => {
        $crate::log::emit($crate::log::Level::$level, $target, format_args!($($arg)+))
    };
    ($level:ident, $($arg:tt)+) => {
        $crate::log::emit($crate::log::Level::$level, module_path!(), format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)+) => { $crate::__vm_log!(Error, $($arg)+) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)+) => { $crate::__vm_log!(Warn, $($arg)+) };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)+) => { $crate::__vm_log!(Info, $($arg)+) };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)+) => { $crate::__vm_log!(Debug, $($arg)+) };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)+) => { $crate::__vm_log!(Trace, $($arg)+) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severities_are_ordered_and_tagged() {
        assert!(Level::Error < Level::Trace);
        assert_eq!(Level::Warn.tag(), "WARN");
        assert!(Level::Error.enabled());
        assert_eq!(Level::Trace.enabled(), cfg!(debug_assertions));
    }

    #[test]
    fn macros_accept_optional_target() {
        log_info!(target: "pt", "mapped {:#x}", 0x1000);
        log_warn!("no target {}", 1);
    }
}
