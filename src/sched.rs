//! Run queues and the scheduler.
//!
//! A single scheduler spin lock guards the thread table, the run queues,
//! the sleep queues and the turnstiles; every blocking primitive works on
//! that one state under the lock and releases it around the context switch.
//! The run queue is a bitmap-indexed array of FIFO lists, one per group of
//! `RQ_PPQ` adjacent priorities, with priority 0 the highest.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicU32, Ordering};

use once_cell::race::OnceBox;

use crate::config::{self, RQ_NQS, RQ_PPQ, SLICE};
use crate::context::ctx_switch;
use crate::spinlock::SpinLock;
use crate::thread::{Thread, ThreadState, ThreadTable, TdFlags};
use crate::{Prio, Tid};

/// Bitmap-indexed priority run queues.
pub struct RunQueue {
    queues: [VecDeque<Tid>; RQ_NQS],
    /// Bit `i` set iff `queues[i]` is non-empty.
    status: u64,
}

impl RunQueue {
    pub fn new() -> RunQueue {
        RunQueue { queues: [const { VecDeque::new() }; RQ_NQS], status: 0 }
    }

    fn bucket(prio: Prio) -> usize {
        prio as usize / RQ_PPQ
    }

    /// Insert at the tail of the thread's priority bucket.
    pub fn add(&mut self, prio: Prio, tid: Tid) {
        let q = Self::bucket(prio);
        self.queues[q].push_back(tid);
        self.status |= 1 << q;
    }

    /// Highest-priority candidate (head of the lowest-numbered non-empty
    /// bucket), without dequeuing it.
    pub fn choose(&self) -> Option<Tid> {
        if self.status == 0 {
            return None;
        }
        let q = self.status.trailing_zeros() as usize;
        self.queues[q].front().copied()
    }

    /// Unlink a specific thread; clears the bucket bit when it empties.
    pub fn remove(&mut self, prio: Prio, tid: Tid) -> bool {
        let q = Self::bucket(prio);
        let Some(pos) = self.queues[q].iter().position(|&t| t == tid) else {
            return false;
        };
        self.queues[q].remove(pos);
        if self.queues[q].is_empty() {
            self.status &= !(1 << q);
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.status == 0
    }
}

/// Scheduler-locked kernel state: every structure that cross-references
/// threads by id lives here so one lock order covers them all.
pub struct Ksched {
    pub threads: ThreadTable,
    pub runq: RunQueue,
    pub sleepq: crate::sleepq::SleepTable,
    pub turnstiles: crate::turnstile::TurnstileTable,
    pub current: Tid,
    /// Whether this instance drives the CPU-wide current-thread register.
    /// Only the boot singleton does; scratch instances in tests do not.
    global: bool,
}

impl Ksched {
    pub(crate) fn new() -> Ksched {
        let mut threads = ThreadTable::new();
        let mut td0 = Thread::new(0, "main", config::prio_kthread(128));
        td0.state = ThreadState::Running;
        let tid0 = threads.insert(td0);
        Ksched {
            threads,
            runq: RunQueue::new(),
            sleepq: crate::sleepq::SleepTable::new(),
            turnstiles: crate::turnstile::TurnstileTable::new(),
            current: tid0,
            global: false,
        }
    }

    fn new_global() -> Ksched {
        let mut ks = Ksched::new();
        ks.global = true;
        ks
    }

    pub(crate) fn current_prio(&self) -> Prio {
        self.threads.get(self.current).map(|td| td.prio).unwrap_or(255)
    }
}

static KSCHED: OnceBox<SpinLock<Ksched>> = OnceBox::new();
static CURRENT: AtomicU32 = AtomicU32::new(0);

pub(crate) fn ksched() -> &'static SpinLock<Ksched> {
    KSCHED.get_or_init(|| Box::new(SpinLock::new(Ksched::new_global())))
}

/// Bring up the scheduler singleton (thread 0 becomes the running thread).
pub fn bootstrap() {
    let _ = ksched();
}

/// Id of the thread owning the CPU.
pub fn current_tid() -> Tid {
    CURRENT.load(Ordering::Relaxed)
}

/// Make `tid` runnable with a fresh time slice; preempt the current thread
/// if the newcomer has higher priority.
pub fn sched_add(tid: Tid) {
    let mut ks = ksched().lock();
    sched_add_locked(&mut ks, tid);
}

pub(crate) fn sched_add_locked(ks: &mut Ksched, tid: Tid) {
    let current_prio = ks.current_prio();
    let current = ks.current;
    let Some(td) = ks.threads.get_mut(tid) else {
        return;
    };
    if td.state == ThreadState::Ready {
        return;
    }
    td.state = ThreadState::Ready;
    td.slice = SLICE;
    let prio = td.prio;
    ks.runq.add(prio, tid);
    if config::prio_gt(prio, current_prio)
        && let Some(cur) = ks.threads.get_mut(current)
    {
        cur.flags.insert(TdFlags::NEEDSWITCH);
    }
}

/// Clock-tick accounting: burn one tick of the running thread's slice and
/// request a switch when it runs out.
pub fn sched_clock() {
    let mut ks = ksched().lock();
    let current = ks.current;
    if let Some(td) = ks.threads.get_mut(current) {
        td.slice = td.slice.saturating_sub(1);
        if td.slice == 0 {
            td.flags.insert(TdFlags::SLICEEND | TdFlags::NEEDSWITCH);
        }
    }
}

/// Pick the next thread and switch to it. The current thread is re-queued
/// if it is still runnable.
pub fn sched_switch() {
    let mut ks = ksched().lock();
    switch_locked(&mut ks);
}

pub(crate) fn switch_locked(ks: &mut Ksched) {
    // Voluntary switches (blocking on a queue, yielding) are legal inside a
    // no-preemption section; only involuntary preemption is inhibited, at
    // preempt_point().
    let old = ks.current;
    if let Some(td) = ks.threads.get_mut(old) {
        td.flags.remove(TdFlags::NEEDSWITCH | TdFlags::SLICEEND);
        if td.state == ThreadState::Running {
            td.state = ThreadState::Ready;
            let prio = td.prio;
            ks.runq.add(prio, old);
        }
    }
    let next = match ks.runq.choose() {
        Some(next) => next,
        None => old, // nothing else runnable, keep running
    };
    {
        let td = ks.threads.get_mut(next).expect("chosen thread missing");
        ks.runq.remove(td.prio, next);
        td.state = ThreadState::Running;
        if td.slice == 0 {
            td.slice = SLICE;
        }
    }
    ks.current = next;
    if ks.global {
        CURRENT.store(next, Ordering::Relaxed);
    }
    if next != old {
        let next_ctx = ks.threads.get(next).map(|td| td.kctx.clone()).unwrap_or_default();
        if let Some(old_td) = ks.threads.get_mut(old) {
            ctx_switch(&mut old_td.kctx, &next_ctx);
        }
    }
}

/// Update a thread's effective priority, keeping whatever queue it sits on
/// sorted: ready threads move between run-queue buckets, threads blocked on
/// a turnstile are re-sorted there (with propagation).
pub fn sched_set_prio(tid: Tid, prio: Prio) {
    let mut ks = ksched().lock();
    set_prio_locked(&mut ks, tid, prio);
}

pub(crate) fn set_prio_locked(ks: &mut Ksched, tid: Tid, prio: Prio) {
    let Some(td) = ks.threads.get_mut(tid) else {
        return;
    };
    let oldprio = td.prio;
    if oldprio == prio {
        return;
    }
    let state = td.state;
    td.prio = prio;
    match state {
        ThreadState::Ready => {
            if ks.runq.remove(oldprio, tid) {
                ks.runq.add(prio, tid);
            }
        }
        ThreadState::Sleeping => {
            if ks.threads.get(tid).and_then(|td| td.blocked_on).is_some() {
                crate::turnstile::adjust_locked(ks, tid, oldprio);
            }
        }
        _ => {}
    }
}

/// Voluntarily give up the CPU.
pub fn thread_yield() {
    let mut ks = ksched().lock();
    let current = ks.current;
    if let Some(td) = ks.threads.get_mut(current) {
        td.flags.insert(TdFlags::NEEDSWITCH);
    }
    switch_locked(&mut ks);
}

/// Honour a pending preemption request; called when the outermost
/// no-preemption section is left.
pub(crate) fn preempt_point() {
    let Some(ks) = KSCHED.get() else {
        return;
    };
    // If the scheduler lock is taken we are inside scheduler code; the
    // request will be honored on the way out.
    let Some(mut ks) = ks.try_lock() else {
        return;
    };
    let current = ks.current;
    let wants = ks
        .threads
        .get(current)
        .map(|td| td.flags.contains(TdFlags::NEEDSWITCH))
        .unwrap_or(false);
    if wants {
        switch_locked(&mut ks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{prio_kthread, prio_uthread};

    fn mkthread(ks: &mut Ksched, name: &str, prio: Prio) -> Tid {
        let td = Thread::new(0, name, prio);
        ks.threads.insert(td)
    }

    #[test]
    fn runq_orders_by_priority_with_fifo_ties() {
        let mut rq = RunQueue::new();
        rq.add(prio_uthread(100), 10);
        rq.add(prio_kthread(10), 11);
        rq.add(prio_kthread(10), 12);
        assert_eq!(rq.choose(), Some(11));
        rq.remove(prio_kthread(10), 11);
        assert_eq!(rq.choose(), Some(12));
        rq.remove(prio_kthread(10), 12);
        assert_eq!(rq.choose(), Some(10));
        rq.remove(prio_uthread(100), 10);
        assert!(rq.is_empty());
    }

    #[test]
    fn runq_remove_clears_the_bitmap() {
        let mut rq = RunQueue::new();
        rq.add(40, 1);
        assert!(!rq.is_empty());
        assert!(rq.remove(40, 1));
        assert!(rq.is_empty());
        assert!(!rq.remove(40, 1));
    }

    #[test]
    fn sched_add_marks_preemption_for_higher_priority() {
        let mut ks = Ksched::new();
        let lofty = mkthread(&mut ks, "lofty", 1);
        let humble = mkthread(&mut ks, "humble", 250);
        sched_add_locked(&mut ks, humble);
        let cur_flags = ks.threads.get(ks.current).unwrap().flags;
        assert!(!cur_flags.contains(TdFlags::NEEDSWITCH));
        sched_add_locked(&mut ks, lofty);
        let cur_flags = ks.threads.get(ks.current).unwrap().flags;
        assert!(cur_flags.contains(TdFlags::NEEDSWITCH));
    }

    #[test]
    fn switch_prefers_the_highest_priority_ready_thread() {
        let mut ks = Ksched::new();
        let mid = mkthread(&mut ks, "mid", prio_kthread(64));
        let hi = mkthread(&mut ks, "hi", prio_kthread(0));
        sched_add_locked(&mut ks, mid);
        sched_add_locked(&mut ks, hi);
        switch_locked(&mut ks);
        assert_eq!(ks.current, hi);
        assert_eq!(ks.threads.get(hi).unwrap().state, ThreadState::Running);
        // The previous thread went back to the run queue.
        assert_eq!(ks.threads.get(mid).unwrap().state, ThreadState::Ready);
    }

    #[test]
    fn switch_with_empty_runq_keeps_running() {
        let mut ks = Ksched::new();
        let old = ks.current;
        switch_locked(&mut ks);
        assert_eq!(ks.current, old);
        assert_eq!(ks.threads.get(old).unwrap().state, ThreadState::Running);
    }

    #[test]
    fn set_prio_moves_ready_threads_between_buckets() {
        let mut ks = Ksched::new();
        let td = mkthread(&mut ks, "mover", 200);
        sched_add_locked(&mut ks, td);
        set_prio_locked(&mut ks, td, 8);
        assert_eq!(ks.runq.choose(), Some(td));
        assert_eq!(ks.threads.get(td).unwrap().prio, 8);
        // And the old bucket no longer lists it.
        assert!(!ks.runq.remove(200, td));
    }

    #[test]
    fn slice_expiry_requests_a_switch() {
        let mut ks = Ksched::new();
        let current = ks.current;
        ks.threads.get_mut(current).unwrap().slice = 1;
        // Burn the last tick.
        let td = ks.threads.get_mut(current).unwrap();
        td.slice = td.slice.saturating_sub(1);
        if td.slice == 0 {
            td.flags.insert(TdFlags::SLICEEND | TdFlags::NEEDSWITCH);
        }
        let flags = ks.threads.get(current).unwrap().flags;
        assert!(flags.contains(TdFlags::SLICEEND));
        assert!(flags.contains(TdFlags::NEEDSWITCH));
    }
}
