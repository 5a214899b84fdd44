//! Interrupt masking and no-preemption sections.
//!
//! A no-preemption section is a nestable counter, not a lock: while it is
//! non-zero involuntary preemption is held back (the request is recorded on
//! the thread and honored when the outermost section ends), while interrupts
//! stay enabled and voluntary blocking still switches. Spin locks
//! additionally mask interrupts, which the machine layer exposes through
//! the `critical-section` crate.

use core::sync::atomic::{AtomicU32, Ordering};

use critical_section::RestoreState;

static PREEMPT_NEST: AtomicU32 = AtomicU32::new(0);

/// Enter a no-preemption section. Nestable.
pub fn preempt_disable() {
    PREEMPT_NEST.fetch_add(1, Ordering::Relaxed);
}

/// Leave a no-preemption section. When the outermost section is left and a
/// preemption request was recorded meanwhile, the switch is taken here.
pub fn preempt_enable() {
    let nest = PREEMPT_NEST.fetch_sub(1, Ordering::Relaxed);
    debug_assert!(nest > 0, "unbalanced preempt_enable");
    if nest == 1 {
        crate::sched::preempt_point();
    }
}

/// True while any no-preemption section is active.
pub fn preempt_disabled() -> bool {
    PREEMPT_NEST.load(Ordering::Relaxed) > 0
}

/// RAII no-preemption section.
pub struct NoPreemptGuard(());

impl NoPreemptGuard {
    pub fn new() -> Self {
        preempt_disable();
        NoPreemptGuard(())
    }
}

impl Drop for NoPreemptGuard {
    fn drop(&mut self) {
        preempt_enable();
    }
}

/// Run `f` with preemption inhibited.
pub fn with_no_preemption<R>(f: impl FnOnce() -> R) -> R {
    let _guard = NoPreemptGuard::new();
    f()
}

/// Mask interrupts. The returned token must be handed back to
/// [`intr_restore`] in LIFO order; spin lock guards own one token each.
pub fn intr_save() -> RestoreState {
    unsafe { critical_section::acquire() }
}

/// Restore the interrupt mask saved by the matching [`intr_save`].
pub fn intr_restore(state: RestoreState) {
    unsafe { critical_section::release(state) }
}

// ============================================================================
// critical-section implementation for hosted unit tests
// ============================================================================

// Re-entrant global interrupt-mask stand-in. The restore state records
// whether the acquire was the outermost one on this thread.

#[cfg(test)]
mod host_cs {
    use std::sync::atomic::{AtomicU64, Ordering};

    static OWNER: AtomicU64 = AtomicU64::new(0);

    fn self_token() -> u64 {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        thread_local! {
            static TOKEN: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
        }
        TOKEN.with(|t| *t)
    }

    struct HostCriticalSection;

    critical_section::set_impl!(HostCriticalSection);

    unsafe impl critical_section::Impl for HostCriticalSection {
        unsafe fn acquire() -> critical_section::RawRestoreState {
            let me = self_token();
            if OWNER.load(Ordering::Relaxed) == me {
                return false; // nested
            }
            while OWNER.compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed).is_err()
            {
                std::thread::yield_now();
            }
            true
        }

        unsafe fn release(outermost: critical_section::RawRestoreState) {
            if outermost {
                OWNER.store(0, Ordering::Release);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_preemption_sections_nest() {
        with_no_preemption(|| {
            assert!(preempt_disabled());
            with_no_preemption(|| assert!(preempt_disabled()));
            assert!(preempt_disabled());
        });
    }
}
