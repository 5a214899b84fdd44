//! Spin locks.
//!
//! Acquisition masks interrupts (through the machine layer's
//! critical-section implementation) and records the owner, so that locking
//! against yourself panics instead of hanging the single CPU. A raw,
//! data-less variant supports recursion for code that genuinely re-enters;
//! the data-carrying [`SpinLock`] is strictly non-recursive.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use critical_section::RestoreState;

use crate::interrupt::{intr_restore, intr_save};

/// Identity of the acquiring context, never zero.
#[cfg(not(test))]
pub(crate) fn self_token() -> u32 {
    crate::sched::current_tid() + 1
}

#[cfg(test)]
pub(crate) fn self_token() -> u32 {
    // Unit tests run on host threads that all impersonate the "current
    // thread"; give each its own identity so ownership checks stay sound.
    // The base keeps tokens clear of real thread ids.
    use std::sync::atomic::AtomicU32 as StdAtomicU32;
    static NEXT: StdAtomicU32 = StdAtomicU32::new(0x1000);
    thread_local! {
        static TOKEN: u32 = NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
    TOKEN.with(|t| *t)
}

/// Data-less spin lock with optional recursion.
pub struct RawSpin {
    owner: AtomicU32,
    count: UnsafeCell<u32>,
    recursive: bool,
}

unsafe impl Sync for RawSpin {}
unsafe impl Send for RawSpin {}

impl RawSpin {
    pub const fn new() -> RawSpin {
        RawSpin { owner: AtomicU32::new(0), count: UnsafeCell::new(0), recursive: false }
    }

    pub const fn new_recursive() -> RawSpin {
        RawSpin { owner: AtomicU32::new(0), count: UnsafeCell::new(0), recursive: true }
    }

    /// True if the calling context holds the lock.
    pub fn owned(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == self_token()
    }

    pub fn acquire(&self) -> RestoreState {
        let state = intr_save();
        let me = self_token();
        if self.owner.load(Ordering::Relaxed) == me {
            if !self.recursive {
                panic!("spin lock deadlock: lock is not recursive");
            }
            unsafe { *self.count.get() += 1 };
            return state;
        }
        while self
            .owner
            .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        state
    }

    pub fn try_acquire(&self) -> Option<RestoreState> {
        let state = intr_save();
        let me = self_token();
        if self.owner.compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed).is_ok() {
            Some(state)
        } else {
            intr_restore(state);
            None
        }
    }

    pub fn release(&self, state: RestoreState) {
        debug_assert!(self.owned(), "releasing a spin lock we do not hold");
        let count = unsafe { &mut *self.count.get() };
        if *count > 0 {
            *count -= 1;
        } else {
            self.owner.store(0, Ordering::Release);
        }
        intr_restore(state);
    }
}

/// Interrupt-masking spin lock protecting `T`.
pub struct SpinLock<T> {
    raw: RawSpin,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> SpinLock<T> {
        SpinLock { raw: RawSpin::new(), data: UnsafeCell::new(data) }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let state = self.raw.acquire();
        SpinLockGuard { lock: self, state: Some(state) }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let state = self.raw.try_acquire()?;
        Some(SpinLockGuard { lock: self, state: Some(state) })
    }

    pub fn owned(&self) -> bool {
        self.raw.owned()
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    state: Option<RestoreState>,
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// The lock this guard holds; used by condition variables to drop and
    /// re-take it around a sleep.
    pub fn spinlock(this: &Self) -> &'a SpinLock<T> {
        this.lock
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            self.lock.raw.release(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_protects_data() {
        let lock = SpinLock::new(41);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let _guard = lock.lock();
        assert!(lock.owned());
        assert!(lock.try_lock().is_none());
    }

    #[test]
    fn recursive_raw_lock_nests() {
        let raw = RawSpin::new_recursive();
        let outer = raw.acquire();
        let inner = raw.acquire();
        assert!(raw.owned());
        raw.release(inner);
        assert!(raw.owned());
        raw.release(outer);
        assert!(!raw.owned());
    }

    #[test]
    #[should_panic(expected = "deadlock")]
    fn non_recursive_self_lock_panics() {
        let lock = SpinLock::new(());
        let _guard = lock.lock();
        let _second = lock.lock();
    }
}
