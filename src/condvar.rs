//! Condition variables.
//!
//! Built directly over the sleep queue: `wait` atomically releases the
//! associated lock and enqueues under a no-preemption section, so a wakeup
//! between the release and the sleep cannot be lost. Works over both the
//! sleep mutex and the spin lock.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::interrupt::NoPreemptGuard;
use crate::mutex::MutexGuard;
use crate::sleepq::{sleepq_broadcast, sleepq_signal, sleepq_wait, sleepq_wait_timed};
use crate::spinlock::SpinLockGuard;
use crate::thread::WakeReason;
use crate::{Errno, Result, Systime};

pub struct CondVar {
    name: &'static str,
    waiters: AtomicU32,
}

impl CondVar {
    pub const fn new(name: &'static str) -> CondVar {
        CondVar { name, waiters: AtomicU32::new(0) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn chan(&self) -> usize {
        self as *const _ as usize
    }

    pub fn waiters(&self) -> u32 {
        self.waiters.load(Ordering::Relaxed)
    }

    /// The wait consumed no signal (timeout, interruption): take the
    /// bookkeeping entry back out.
    fn uncount(&self) {
        let _ = self
            .waiters
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| w.checked_sub(1));
    }

    /// Release `guard`'s mutex, sleep until signalled, re-take the mutex.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mtx = MutexGuard::mutex(&guard);
        {
            let _np = NoPreemptGuard::new();
            self.waiters.fetch_add(1, Ordering::Relaxed);
            drop(guard);
            sleepq_wait(self.chan(), "cv_wait");
        }
        mtx.lock_at("cv_wait")
    }

    /// Like [`CondVar::wait`] with a tick timeout; `Err(ETIMEDOUT)` after
    /// the deadline, `Err(EINTR)` when interrupted. The mutex is held again
    /// in every case.
    pub fn wait_timed<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Systime,
    ) -> (MutexGuard<'a, T>, Result<()>) {
        let mtx = MutexGuard::mutex(&guard);
        let reason;
        {
            let _np = NoPreemptGuard::new();
            self.waiters.fetch_add(1, Ordering::Relaxed);
            drop(guard);
            reason = sleepq_wait_timed(self.chan(), "cv_wait_timed", timeout);
            if reason != WakeReason::Normal {
                self.uncount();
            }
        }
        let guard = mtx.lock_at("cv_wait_timed");
        (guard, wake_result(reason))
    }

    /// Spin-lock flavor of [`CondVar::wait`].
    pub fn wait_spin<'a, T>(&self, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        let lock = SpinLockGuard::spinlock(&guard);
        let _np = NoPreemptGuard::new();
        self.waiters.fetch_add(1, Ordering::Relaxed);
        drop(guard);
        sleepq_wait(self.chan(), "cv_wait");
        lock.lock()
    }

    /// Wake one waiter, if any.
    pub fn signal(&self) {
        let _np = NoPreemptGuard::new();
        if self
            .waiters
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| w.checked_sub(1))
            .is_ok()
        {
            sleepq_signal(self.chan());
        }
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        let _np = NoPreemptGuard::new();
        if self.waiters.swap(0, Ordering::Relaxed) > 0 {
            sleepq_broadcast(self.chan());
        }
    }
}

fn wake_result(reason: WakeReason) -> Result<()> {
    match reason {
        WakeReason::Normal => Ok(()),
        WakeReason::TimedOut => Err(Errno::TimedOut),
        WakeReason::Interrupted => Err(Errno::Intr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_without_waiters_has_no_side_effect() {
        crate::testutil::boot();
        let cv = CondVar::new("test-cv");
        assert_eq!(cv.waiters(), 0);
        cv.signal();
        cv.broadcast();
        assert_eq!(cv.waiters(), 0);
    }

    #[test]
    fn wake_reasons_map_to_errno() {
        assert_eq!(wake_result(WakeReason::Normal), Ok(()));
        assert_eq!(wake_result(WakeReason::TimedOut), Err(Errno::TimedOut));
        assert_eq!(wake_result(WakeReason::Interrupted), Err(Errno::Intr));
    }

    #[test]
    fn waiter_bookkeeping_balances() {
        crate::testutil::boot();
        let cv = CondVar::new("test-cv");
        cv.waiters.fetch_add(2, Ordering::Relaxed);
        cv.signal();
        assert_eq!(cv.waiters(), 1);
        cv.broadcast();
        assert_eq!(cv.waiters(), 0);
        // An unconsumed (timed-out) entry is uncounted exactly once.
        cv.waiters.fetch_add(1, Ordering::Relaxed);
        cv.uncount();
        cv.uncount();
        assert_eq!(cv.waiters(), 0);
    }
}
