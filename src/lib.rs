//! Machine-independent core of a small Unix-like research kernel.
//!
//! The crate implements the layers that turn raw CPU context into preemptive,
//! priority-inheriting threads running in isolated virtual address spaces:
//!
//! - physical page allocator (buddy system) and kernel virtual address
//!   allocator ([`physmem`], [`vmem`], [`kmem`]),
//! - the physical map abstraction hiding page-table details ([`pmap`]),
//! - on-demand, copy-on-write paging ([`vm_object`], [`vm_amap`], [`vm_map`]),
//! - threads, run queues and the priority-inheriting scheduler ([`thread`],
//!   [`sched`], [`turnstile`]),
//! - blocking and spinning locks, condition variables and sleep queues
//!   ([`mutex`], [`spinlock`], [`rwlock`], [`condvar`], [`sleepq`]),
//! - the callout wheel driving the system clock ([`callout`], [`clock`]),
//! - signal delivery at the thread layer ([`signal`]).
//!
//! Architecture glue (assembly trampolines, TLB formats, boot firmware) lives
//! outside this crate; the seams are the context operations in [`context`],
//! the direct-map window in [`pmap`] and the interrupt masking in
//! [`interrupt`].

#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod allocator;
pub mod callout;
pub mod clock;
pub mod condvar;
pub mod config;
pub mod context;
pub mod errno;
pub mod interrupt;
pub mod kenv;
pub mod klog;
pub mod kmem;
pub mod mutex;
pub mod physmem;
pub mod pmap;
pub mod proc;
pub mod rwlock;
pub mod sched;
pub mod signal;
pub mod sleepq;
pub mod spinlock;
pub mod syscall;
pub mod thread;
pub mod trap;
pub mod turnstile;
pub mod vm;
pub mod vm_amap;
pub mod vm_map;
pub mod vm_object;
pub mod vmem;

/// Virtual address.
pub type Vaddr = usize;
/// Physical address.
pub type Paddr = usize;
/// Thread identifier. Cross-references between threads, locks and wait
/// queues are expressed with these instead of pointers.
pub type Tid = u32;
/// Process identifier.
pub type Pid = u32;
/// System time in clock ticks.
pub type Systime = u64;
/// Thread priority. 0 is the highest priority, 255 the lowest.
pub type Prio = u8;

pub use errno::{Errno, Result};

#[cfg(test)]
pub(crate) mod testutil {
    //! Shared bring-up for unit tests: boot the singletons exactly once and
    //! serialize tests that poke at the boot thread's state.

    use std::sync::{Mutex, MutexGuard, Once};

    static BOOT: Once = Once::new();

    pub fn boot() {
        BOOT.call_once(|| {
            crate::physmem::testmem::init();
            crate::kmem::bootstrap();
            crate::pmap::bootstrap();
            crate::vm_map::bootstrap();
            crate::sched::bootstrap();
            crate::proc::bootstrap();
        });
    }

    static TD0: Mutex<()> = Mutex::new(());

    /// Tests mutating the boot thread (its user context, onfault, masks)
    /// take this to keep each other honest.
    pub fn lock_thread0() -> MutexGuard<'static, ()> {
        TD0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Initialize the kernel core in dependency order.
///
/// `args` is the flattened boot command line (`key=value` tokens). The caller
/// is expected to have registered RAM with [`physmem`] beforehand (or to pass
/// `mem_start`/`mem_end` in `args`) and to start feeding clock ticks into
/// [`clock::clock_tick`] once this returns.
pub fn kernel_init(args: &[&str]) {
    kenv::init(args);
    klog::init();
    physmem::init_from_kenv();
    kmem::bootstrap();
    pmap::bootstrap();
    vm_map::bootstrap();
    sched::bootstrap();
    callout::bootstrap();
    proc::bootstrap();
    log::info!("kernel core initialized");
}
