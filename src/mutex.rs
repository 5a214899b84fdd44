//! Blocking sleep mutex.
//!
//! The fast path is a single compare-and-swap of the owner word. Under
//! contention the acquirer takes the lock's turnstile, re-checks the owner
//! there, marks the lock contested and blocks with priority propagation.
//! Unlock of a contested lock broadcasts the turnstile rather than waking a
//! single thread; the woken threads mostly find an empty mutex and re-take
//! it cheaply.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::interrupt::with_no_preemption;
use crate::sched;
use crate::thread::LockId;

/// High bit of the owner word: somebody is (or was) blocked on the lock.
const CONTESTED: u32 = 1 << 31;

fn owner_token() -> u32 {
    crate::spinlock::self_token()
}

/// Sleep mutex protecting `T`. Not recursive: locking against yourself
/// panics.
pub struct Mutex<T> {
    /// 0 when free, otherwise the owner token, possibly with [`CONTESTED`].
    owner: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Mutex<T> {}
unsafe impl<T: Send> Send for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Mutex<T> {
        Mutex { owner: AtomicU32::new(0), data: UnsafeCell::new(data) }
    }

    /// Identity of this lock in the wait-for graph.
    pub fn lock_id(&self) -> LockId {
        self as *const _ as usize
    }

    /// True if the calling thread holds the mutex.
    pub fn owned(&self) -> bool {
        self.owner.load(Ordering::Relaxed) & !CONTESTED == owner_token()
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.lock_at("mtx_lock")
    }

    pub fn lock_at(&self, waitpt: &'static str) -> MutexGuard<'_, T> {
        let me = owner_token();
        if self.owner.load(Ordering::Relaxed) & !CONTESTED == me {
            panic!("sleep mutex deadlock: lock is not recursive");
        }
        loop {
            // Fast path: if the lock has no owner, take ownership.
            if self
                .owner
                .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            with_no_preemption(|| {
                let mut ks = sched::ksched().lock();
                // Between the CAS and taking the scheduler lock the owner
                // may have released; retry the fast path in that case.
                let word = self.owner.load(Ordering::Relaxed);
                if word == 0 {
                    return;
                }
                self.owner.fetch_or(CONTESTED, Ordering::Relaxed);
                let owner_tid = (word & !CONTESTED) - 1;
                let current = ks.current;
                crate::turnstile::block_locked(&mut ks, current, self.lock_id(), owner_tid, waitpt);
                sched::switch_locked(&mut ks);
            });
        }
        MutexGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let me = owner_token();
        self.owner
            .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| MutexGuard { lock: self })
    }

    fn unlock(&self) {
        let me = owner_token();
        // Fast path: not contested, drop ownership.
        if self
            .owner
            .compare_exchange(me, 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        with_no_preemption(|| {
            let word = self.owner.swap(0, Ordering::AcqRel);
            debug_assert_eq!(word & !CONTESTED, me, "unlock by non-owner");
            if word & CONTESTED != 0 {
                let mut ks = sched::ksched().lock();
                crate::turnstile::broadcast_locked(&mut ks, self.lock_id());
            }
        });
    }
}

pub struct MutexGuard<'a, T> {
    lock: &'a Mutex<T>,
}

impl<'a, T> MutexGuard<'a, T> {
    /// The mutex this guard locks; used by condition variables to drop and
    /// re-take the lock around a sleep.
    pub fn mutex(this: &Self) -> &'a Mutex<T> {
        this.lock
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontested_lock_roundtrip() {
        let m = Mutex::new(1);
        {
            let mut g = m.lock();
            *g += 1;
            assert!(m.owned());
        }
        assert!(!m.owned());
        assert_eq!(*m.lock(), 2);
    }

    #[test]
    fn try_lock_respects_ownership() {
        let m = Mutex::new(());
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn contested_unlock_broadcasts_the_turnstile() {
        crate::testutil::boot();
        let m = Mutex::new(());
        let g = m.lock();
        // A waiter marked the lock contested while we held it.
        m.owner.fetch_or(CONTESTED, Ordering::Relaxed);
        let waiter = {
            let mut ks = sched::ksched().lock();
            let tid = ks.threads.insert(crate::thread::Thread::new(0, "waiter", 100));
            let owner = ks.current;
            crate::turnstile::block_locked(&mut ks, tid, m.lock_id(), owner, "test");
            tid
        };
        drop(g);
        let ks = sched::ksched().lock();
        assert_eq!(ks.threads.get(waiter).unwrap().state, crate::thread::ThreadState::Ready);
        assert_eq!(ks.turnstiles.blocked_on(m.lock_id()), 0);
        drop(ks);
        // And the mutex is free again.
        assert!(m.try_lock().is_some());
    }

    #[test]
    #[should_panic(expected = "deadlock")]
    fn self_lock_panics() {
        let m = Mutex::new(());
        let _g = m.lock();
        let _second = m.lock();
    }
}
