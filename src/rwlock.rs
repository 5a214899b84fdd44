//! Read/write sleep lock with writer preference.
//!
//! Readers are admitted only while no writer holds the lock *and* no writer
//! is waiting, so a stream of readers cannot starve writers. Waiting uses
//! two distinct wait channels on the same lock (one for readers, one for
//! the writer side). The raw lock supports a recursive writer; the typed
//! wrapper exposes the borrow-sound subset plus downgrade and try-upgrade.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use spinning_top::Spinlock;

use crate::interrupt::NoPreemptGuard;
use crate::sleepq::{sleepq_broadcast, sleepq_signal, sleepq_wait};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwAccess {
    Reader,
    Writer,
}

#[derive(Default)]
struct RwState {
    readers: u32,
    writers_waiting: u32,
    /// Owner token of the writer, 0 when write-unlocked.
    writer: u32,
    recurse: u32,
}

/// Data-less read/write lock, recursion-capable on the writer side.
pub struct RawRwLock {
    state: Spinlock<RwState>,
    recursive: bool,
}

fn self_token() -> u32 {
    crate::spinlock::self_token()
}

impl RawRwLock {
    pub const fn new(recursive: bool) -> RawRwLock {
        RawRwLock {
            state: Spinlock::new(RwState { readers: 0, writers_waiting: 0, writer: 0, recurse: 0 }),
            recursive,
        }
    }

    fn reader_chan(&self) -> usize {
        self as *const _ as usize | 1
    }

    fn writer_chan(&self) -> usize {
        self as *const _ as usize
    }

    /// True if the calling thread is the writer.
    pub fn write_owned(&self) -> bool {
        self.state.lock().writer == self_token()
    }

    pub fn enter(&self, access: RwAccess) {
        match access {
            RwAccess::Reader => self.enter_read(),
            RwAccess::Writer => self.enter_write(),
        }
    }

    fn enter_read(&self) {
        let _np = NoPreemptGuard::new();
        loop {
            {
                let mut s = self.state.lock();
                if s.writer == 0 && s.writers_waiting == 0 {
                    s.readers += 1;
                    return;
                }
            }
            sleepq_wait(self.reader_chan(), "rw_enter(reader)");
        }
    }

    fn enter_write(&self) {
        let _np = NoPreemptGuard::new();
        let me = self_token();
        {
            let mut s = self.state.lock();
            if s.writer == me {
                if !self.recursive {
                    panic!("rwlock deadlock: writer is not recursive");
                }
                s.recurse += 1;
                return;
            }
            s.writers_waiting += 1;
        }
        loop {
            {
                let mut s = self.state.lock();
                if s.writer == 0 && s.readers == 0 {
                    s.writer = me;
                    s.writers_waiting -= 1;
                    return;
                }
            }
            sleepq_wait(self.writer_chan(), "rw_enter(writer)");
        }
    }

    pub fn leave(&self, access: RwAccess) {
        enum Wake {
            None,
            Writer,
            Readers,
        }
        let wake = {
            let mut s = self.state.lock();
            match access {
                RwAccess::Reader => {
                    debug_assert!(s.readers > 0);
                    s.readers -= 1;
                    if s.readers == 0 && s.writers_waiting > 0 {
                        Wake::Writer
                    } else {
                        Wake::None
                    }
                }
                RwAccess::Writer => {
                    debug_assert_eq!(s.writer, self_token(), "rw_leave by non-writer");
                    if s.recurse > 0 {
                        s.recurse -= 1;
                        Wake::None
                    } else {
                        s.writer = 0;
                        if s.writers_waiting > 0 {
                            Wake::Writer
                        } else {
                            Wake::Readers
                        }
                    }
                }
            }
        };
        match wake {
            Wake::Writer => {
                sleepq_signal(self.writer_chan());
            }
            Wake::Readers => {
                sleepq_broadcast(self.reader_chan());
            }
            Wake::None => {}
        }
    }

    /// Trade a read hold for the write hold. Succeeds only if the caller is
    /// the sole reader and no writer is waiting.
    pub fn try_upgrade(&self) -> bool {
        let mut s = self.state.lock();
        if s.writer == 0 && s.readers == 1 && s.writers_waiting == 0 {
            s.readers = 0;
            s.writer = self_token();
            s.recurse = 0;
            true
        } else {
            false
        }
    }

    /// Trade the write hold for a read hold and release other readers.
    pub fn downgrade(&self) {
        {
            let mut s = self.state.lock();
            debug_assert_eq!(s.writer, self_token());
            debug_assert_eq!(s.recurse, 0, "downgrade of a recursed writer");
            s.writer = 0;
            s.readers = 1;
        }
        sleepq_broadcast(self.reader_chan());
    }
}

/// Read/write lock protecting `T`.
pub struct RwLock<T> {
    raw: RawRwLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send + Sync> Sync for RwLock<T> {}
unsafe impl<T: Send> Send for RwLock<T> {}

impl<T> RwLock<T> {
    pub const fn new(data: T) -> RwLock<T> {
        RwLock { raw: RawRwLock::new(false), data: UnsafeCell::new(data) }
    }

    pub fn read(&self) -> RwReadGuard<'_, T> {
        self.raw.enter(RwAccess::Reader);
        RwReadGuard { lock: self }
    }

    pub fn write(&self) -> RwWriteGuard<'_, T> {
        self.raw.enter(RwAccess::Writer);
        RwWriteGuard { lock: self }
    }

    pub fn write_owned(&self) -> bool {
        self.raw.write_owned()
    }
}

pub struct RwReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<'a, T> RwReadGuard<'a, T> {
    /// Try to become the writer without releasing; gives the guard back on
    /// failure.
    pub fn try_upgrade(this: Self) -> core::result::Result<RwWriteGuard<'a, T>, RwReadGuard<'a, T>> {
        let lock = this.lock;
        if lock.raw.try_upgrade() {
            core::mem::forget(this);
            Ok(RwWriteGuard { lock })
        } else {
            Err(this)
        }
    }
}

impl<T> Deref for RwReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.leave(RwAccess::Reader);
    }
}

pub struct RwWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<'a, T> RwWriteGuard<'a, T> {
    /// Keep the data readable but let other readers in.
    pub fn downgrade(this: Self) -> RwReadGuard<'a, T> {
        let lock = this.lock;
        core::mem::forget(this);
        lock.raw.downgrade();
        RwReadGuard { lock }
    }
}

impl<T> Deref for RwWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.leave(RwAccess::Writer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_share_writers_exclude() {
        let rw = RwLock::new(5);
        let r1 = rw.read();
        let r2 = rw.read();
        assert_eq!(*r1 + *r2, 10);
        drop((r1, r2));
        let mut w = rw.write();
        *w = 6;
        assert!(rw.write_owned());
        drop(w);
        assert_eq!(*rw.read(), 6);
    }

    #[test]
    fn upgrade_only_as_the_sole_reader() {
        let rw = RwLock::new(0);
        let r1 = rw.read();
        let r2 = rw.read();
        let r1 = match RwReadGuard::try_upgrade(r1) {
            Ok(_) => panic!("upgrade with two readers succeeded"),
            Err(g) => g,
        };
        drop(r2);
        let mut w = RwReadGuard::try_upgrade(r1).ok().expect("sole reader upgrades");
        *w += 1;
    }

    #[test]
    fn downgrade_keeps_access() {
        let rw = RwLock::new(3);
        let mut w = rw.write();
        *w = 9;
        let r = RwWriteGuard::downgrade(w);
        assert_eq!(*r, 9);
        // Other readers are admitted alongside.
        let r2 = rw.read();
        assert_eq!(*r2, 9);
    }

    #[test]
    fn recursive_writer_on_the_raw_lock() {
        let raw = RawRwLock::new(true);
        raw.enter(RwAccess::Writer);
        raw.enter(RwAccess::Writer);
        assert!(raw.write_owned());
        raw.leave(RwAccess::Writer);
        assert!(raw.write_owned());
        raw.leave(RwAccess::Writer);
        assert!(!raw.write_owned());
    }

    #[test]
    fn waiting_writer_blocks_new_readers() {
        let raw = RawRwLock::new(false);
        raw.enter(RwAccess::Reader);
        // Simulate a writer in the queue.
        raw.state.lock().writers_waiting = 1;
        // A reader must not be admitted now; probe the admission predicate
        // directly to avoid blocking the test thread.
        {
            let s = raw.state.lock();
            assert!(!(s.writer == 0 && s.writers_waiting == 0));
        }
        raw.state.lock().writers_waiting = 0;
        raw.leave(RwAccess::Reader);
    }
}
