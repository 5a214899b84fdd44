//! Kernel logger.
//!
//! Backs the `log` crate facade with a console sink. Filtering is controlled
//! from the boot environment:
//!
//! - `klog-quiet` raises the threshold to errors only,
//! - `klog-verbose` lowers it to trace,
//! - `klog-mask=<hex>` selects which subsystems may log at all; each bit
//!   corresponds to one entry of [`ORIGINS`], matched against the log target.
//!
//! The sink is a plain `fn(&str)` installed by the platform glue (UART
//! writer, semihosting, a test buffer). Until one is installed messages are
//! dropped, never buffered.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use log::{Level, LevelFilter, Metadata, Record};

use crate::kenv;

/// Log origins recognized by `klog-mask`, in bit order.
pub const ORIGINS: &[&str] = &[
    "physmem", "vmem", "kmem", "pmap", "vm", "sched", "thread", "sleepq", "turnstile", "callout",
    "signal", "proc", "syscall", "trap",
];

const MASK_ALL: u32 = u32::MAX;

static MASK: AtomicU32 = AtomicU32::new(MASK_ALL);
static SINK: AtomicUsize = AtomicUsize::new(0);

struct Klog;

static KLOG: Klog = Klog;

impl log::Log for Klog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let mask = MASK.load(Ordering::Relaxed);
        match ORIGINS.iter().position(|o| *o == metadata.target()) {
            Some(bit) => mask & (1 << bit) != 0,
            // Targets outside the kernel's origin list (e.g. module paths)
            // are only filtered by level.
            None => true,
        }
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let sink = SINK.load(Ordering::Acquire);
        if sink == 0 {
            return;
        }
        let sink: fn(&str) = unsafe { core::mem::transmute(sink) };
        let tag = match record.level() {
            Level::Error => "E",
            Level::Warn => "W",
            Level::Info => "I",
            Level::Debug => "D",
            Level::Trace => "T",
        };
        let line = alloc::format!("[{}:{}] {}\n", tag, record.target(), record.args());
        sink(&line);
    }

    fn flush(&self) {}
}

/// Install the console sink. Replaces any previous sink.
pub fn set_sink(sink: fn(&str)) {
    SINK.store(sink as usize, Ordering::Release);
}

/// Configure the logger from the boot environment and register it with the
/// `log` facade. Safe to call once; later calls only refresh the filters.
pub fn init() {
    let level = if kenv::has("klog-quiet") {
        LevelFilter::Error
    } else if kenv::has("klog-verbose") {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };
    if let Some(mask) = kenv::get("klog-mask") {
        let mask = mask.trim_start_matches("0x");
        if let Ok(mask) = u32::from_str_radix(mask, 16) {
            MASK.store(mask, Ordering::Relaxed);
        }
    }
    // set_logger fails if a logger is already installed (e.g. the test
    // harness); the filters above still apply in that case.
    let _ = log::set_logger(&KLOG);
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_mask_gates_targets() {
        MASK.store(0b1, Ordering::Relaxed);
        let physmem = Metadata::builder().target("physmem").level(Level::Info).build();
        let sched = Metadata::builder().target("sched").level(Level::Info).build();
        let other = Metadata::builder().target("oni::foo").level(Level::Info).build();
        assert!(log::Log::enabled(&KLOG, &physmem));
        assert!(!log::Log::enabled(&KLOG, &sched));
        assert!(log::Log::enabled(&KLOG, &other));
        MASK.store(MASK_ALL, Ordering::Relaxed);
    }
}
