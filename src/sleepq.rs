//! Sleep queues.
//!
//! A sleep queue is a wait-channel-keyed list of blocked threads. Waking
//! picks the highest-priority waiter (FIFO among equals); broadcast wakes
//! everyone. Timed waits arm a callout that resumes the thread with
//! `TimedOut` if it is still asleep at the deadline, and interruptible
//! waits can be broken out of with [`sleepq_abort`]. Lost wakeups are
//! excluded by the acquire-lock / test-predicate / sleep protocol run under
//! a no-preemption section.

use alloc::collections::VecDeque;

use hashbrown::HashMap;

use crate::config::prio_gt;
use crate::sched::{self, Ksched};
use crate::thread::{TdFlags, ThreadState, WakeReason};
use crate::{Systime, Tid};

/// Wait channels and their blocked threads, in arrival order.
pub struct SleepTable {
    chans: HashMap<usize, VecDeque<Tid>>,
}

impl SleepTable {
    pub(crate) fn new() -> SleepTable {
        SleepTable { chans: HashMap::new() }
    }

    pub fn waiters(&self, wchan: usize) -> usize {
        self.chans.get(&wchan).map(|q| q.len()).unwrap_or(0)
    }
}

pub(crate) fn enqueue_locked(
    ks: &mut Ksched,
    tid: Tid,
    wchan: usize,
    waitpt: &'static str,
    interruptible: bool,
) {
    let td = ks.threads.get_mut(tid).expect("sleeping thread missing");
    debug_assert!(td.wchan.is_none(), "thread already on a sleep queue");
    td.state = ThreadState::Sleeping;
    td.wchan = Some(wchan);
    td.waitpt = Some(waitpt);
    td.wake_reason = WakeReason::Normal;
    if interruptible {
        td.flags.insert(TdFlags::SLPINTR);
    }
    ks.sleepq.chans.entry(wchan).or_default().push_back(tid);
}

pub(crate) fn resume_locked(ks: &mut Ksched, tid: Tid, reason: WakeReason) -> bool {
    let Some(td) = ks.threads.get_mut(tid) else {
        return false;
    };
    let Some(wchan) = td.wchan.take() else {
        return false;
    };
    td.waitpt = None;
    td.flags.remove(TdFlags::SLPINTR);
    td.wake_reason = reason;
    if let Some(q) = ks.sleepq.chans.get_mut(&wchan) {
        if let Some(pos) = q.iter().position(|&t| t == tid) {
            q.remove(pos);
        }
        if q.is_empty() {
            ks.sleepq.chans.remove(&wchan);
        }
    }
    sched::sched_add_locked(ks, tid);
    true
}

/// Highest-priority waiter on `wchan`, FIFO among equal priorities.
fn best_waiter(ks: &Ksched, wchan: usize) -> Option<Tid> {
    let q = ks.sleepq.chans.get(&wchan)?;
    let mut best: Option<(Tid, u8)> = None;
    for &tid in q {
        let prio = ks.threads.get(tid).map(|td| td.prio).unwrap_or(255);
        match best {
            Some((_, bp)) if !prio_gt(prio, bp) => {}
            _ => best = Some((tid, prio)),
        }
    }
    best.map(|(tid, _)| tid)
}

/// Block the current thread on `wchan` until signalled. Returns the wake
/// reason observed when the thread is switched back in.
pub fn sleepq_wait(wchan: usize, waitpt: &'static str) -> WakeReason {
    sleep_common(wchan, waitpt, false, 0)
}

/// Interruptible sleep with a timeout in ticks; `0` waits indefinitely.
/// The sleep never times out before the deadline, though it may wake later.
/// `Interrupted` dominates `TimedOut` when both are pending.
pub fn sleepq_wait_timed(wchan: usize, waitpt: &'static str, timeout: Systime) -> WakeReason {
    sleep_common(wchan, waitpt, true, timeout)
}

fn sleep_common(wchan: usize, waitpt: &'static str, interruptible: bool, timeout: Systime) -> WakeReason {
    let tid = sched::current_tid();
    // Arm the timeout before going to sleep; the wheel lock and the
    // scheduler lock are never held together.
    let co = if timeout > 0 {
        let co = crate::callout::thread_sleep_callout(tid);
        crate::callout::callout_schedule(co, timeout);
        Some(co)
    } else {
        None
    };
    {
        let mut ks = sched::ksched().lock();
        enqueue_locked(&mut ks, tid, wchan, waitpt, interruptible);
        sched::switch_locked(&mut ks);
    }
    // Back from sleep: disarm a timeout that has not fired.
    if let Some(co) = co {
        crate::callout::callout_stop(co);
    }
    sched::ksched()
        .lock()
        .threads
        .get(tid)
        .map(|td| td.wake_reason)
        .unwrap_or(WakeReason::Normal)
}

/// Wake the highest-priority thread blocked on `wchan`. True if one was
/// woken.
pub fn sleepq_signal(wchan: usize) -> bool {
    let mut ks = sched::ksched().lock();
    sleepq_signal_locked(&mut ks, wchan)
}

pub(crate) fn sleepq_signal_locked(ks: &mut Ksched, wchan: usize) -> bool {
    match best_waiter(ks, wchan) {
        Some(tid) => resume_locked(ks, tid, WakeReason::Normal),
        None => false,
    }
}

/// Wake every thread blocked on `wchan`. True if any was woken.
pub fn sleepq_broadcast(wchan: usize) -> bool {
    let mut ks = sched::ksched().lock();
    sleepq_broadcast_locked(&mut ks, wchan)
}

pub(crate) fn sleepq_broadcast_locked(ks: &mut Ksched, wchan: usize) -> bool {
    let mut woke = false;
    while let Some(tid) = ks.sleepq.chans.get(&wchan).and_then(|q| q.front().copied()) {
        woke |= resume_locked(ks, tid, WakeReason::Normal);
    }
    woke
}

/// Break a specific thread's sleep. False if it was not asleep.
pub fn sleepq_abort(tid: Tid) -> bool {
    let mut ks = sched::ksched().lock();
    sleepq_abort_locked(&mut ks, tid)
}

pub(crate) fn sleepq_abort_locked(ks: &mut Ksched, tid: Tid) -> bool {
    resume_locked(ks, tid, WakeReason::Interrupted)
}

/// Callout callback of a timed sleep: resume the thread with `TimedOut`
/// unless something else woke it first.
pub(crate) fn sleepq_timeout(arg: usize) {
    let tid = arg as Tid;
    let mut ks = sched::ksched().lock();
    let asleep = ks.threads.get(tid).map(|td| td.wchan.is_some()).unwrap_or(false);
    if asleep {
        resume_locked(&mut ks, tid, WakeReason::TimedOut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::Thread;

    const CHAN: usize = 0xc0ffee;

    fn sleeper(ks: &mut Ksched, prio: u8) -> Tid {
        let td = Thread::new(0, "sleeper", prio);
        let tid = ks.threads.insert(td);
        enqueue_locked(ks, tid, CHAN, "test", false);
        tid
    }

    #[test]
    fn signal_wakes_the_highest_priority_waiter() {
        let mut ks = Ksched::new();
        let low = sleeper(&mut ks, 200);
        let hi = sleeper(&mut ks, 10);
        let mid = sleeper(&mut ks, 100);
        assert!(sleepq_signal_locked(&mut ks, CHAN));
        assert_eq!(ks.threads.get(hi).unwrap().state, ThreadState::Ready);
        assert_eq!(ks.threads.get(low).unwrap().state, ThreadState::Sleeping);
        assert_eq!(ks.threads.get(mid).unwrap().state, ThreadState::Sleeping);
        assert_eq!(ks.sleepq.waiters(CHAN), 2);
    }

    #[test]
    fn signal_breaks_priority_ties_in_fifo_order() {
        let mut ks = Ksched::new();
        let first = sleeper(&mut ks, 50);
        let second = sleeper(&mut ks, 50);
        assert!(sleepq_signal_locked(&mut ks, CHAN));
        assert_eq!(ks.threads.get(first).unwrap().state, ThreadState::Ready);
        assert_eq!(ks.threads.get(second).unwrap().state, ThreadState::Sleeping);
    }

    #[test]
    fn broadcast_wakes_every_waiter() {
        let mut ks = Ksched::new();
        let a = sleeper(&mut ks, 90);
        let b = sleeper(&mut ks, 60);
        let c = sleeper(&mut ks, 120);
        assert!(sleepq_broadcast_locked(&mut ks, CHAN));
        for tid in [a, b, c] {
            assert_eq!(ks.threads.get(tid).unwrap().state, ThreadState::Ready);
            assert_eq!(ks.threads.get(tid).unwrap().wake_reason, WakeReason::Normal);
        }
        assert_eq!(ks.sleepq.waiters(CHAN), 0);
    }

    #[test]
    fn signal_on_empty_channel_is_a_no_op() {
        let mut ks = Ksched::new();
        assert!(!sleepq_signal_locked(&mut ks, CHAN));
        assert!(!sleepq_broadcast_locked(&mut ks, CHAN));
    }

    #[test]
    fn abort_reports_whether_the_thread_slept() {
        let mut ks = Ksched::new();
        let tid = sleeper(&mut ks, 80);
        assert!(sleepq_abort_locked(&mut ks, tid));
        assert_eq!(ks.threads.get(tid).unwrap().wake_reason, WakeReason::Interrupted);
        // Second abort: not asleep anymore.
        assert!(!sleepq_abort_locked(&mut ks, tid));
    }

    #[test]
    fn waking_clears_the_wait_diagnostics() {
        let mut ks = Ksched::new();
        let tid = sleeper(&mut ks, 80);
        {
            let td = ks.threads.get(tid).unwrap();
            assert_eq!(td.wchan, Some(CHAN));
            assert_eq!(td.waitpt, Some("test"));
        }
        sleepq_signal_locked(&mut ks, CHAN);
        let td = ks.threads.get(tid).unwrap();
        assert!(td.wchan.is_none() && td.waitpt.is_none());
    }
}
