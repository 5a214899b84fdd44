//! Callout wheel: timer events scheduled on future ticks.
//!
//! Pending callouts hash into `deadline mod CALLOUT_BUCKETS` wheel buckets.
//! The clock interrupt calls [`callout_process`], which walks the buckets
//! whose index advanced since the last call and moves expired callouts onto
//! a delegated queue; a dedicated kernel-priority callout thread drains that
//! queue and runs the callbacks with no wheel lock held.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use bitflags::bitflags;
use once_cell::race::OnceBox;
use spinning_top::Spinlock;

use crate::config::CALLOUT_BUCKETS;
use crate::interrupt::NoPreemptGuard;
use crate::sleepq::{sleepq_broadcast, sleepq_signal, sleepq_wait};
use crate::Systime;

/// Handle of a callout slot in the wheel.
pub type CalloutId = usize;

type CalloutFn = fn(usize);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CoFlags: u32 {
        /// Waiting on a wheel bucket for its deadline.
        const PENDING = 0x1;
        /// Delegated to the callout thread; executing or about to.
        const ACTIVE = 0x2;
        /// Rescheduling is disallowed until scheduled anew.
        const STOPPED = 0x4;
    }
}

struct Callout {
    func: CalloutFn,
    arg: usize,
    /// Absolute tick of the deadline.
    time: Systime,
    flags: CoFlags,
    bucket: usize,
}

pub struct CalloutWheel {
    slots: Vec<Option<Callout>>,
    free: Vec<CalloutId>,
    buckets: [Vec<CalloutId>; CALLOUT_BUCKETS],
    delegated: VecDeque<CalloutId>,
    /// Tick up to which buckets have been processed.
    last: Systime,
}

impl CalloutWheel {
    pub fn new() -> CalloutWheel {
        CalloutWheel {
            slots: Vec::new(),
            free: Vec::new(),
            buckets: [const { Vec::new() }; CALLOUT_BUCKETS],
            delegated: VecDeque::new(),
            last: 0,
        }
    }

    /// Set up a callout slot calling `func(arg)` when it fires.
    pub fn setup(&mut self, func: CalloutFn, arg: usize) -> CalloutId {
        let co = Callout { func, arg, time: 0, flags: CoFlags::empty(), bucket: 0 };
        match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(co);
                id
            }
            None => {
                self.slots.push(Some(co));
                self.slots.len() - 1
            }
        }
    }

    /// Release a slot. The callout must not be pending or in flight.
    pub fn teardown(&mut self, id: CalloutId) {
        let co = self.slots[id].take().expect("tearing down a free callout slot");
        assert!(
            !co.flags.intersects(CoFlags::PENDING | CoFlags::ACTIVE),
            "tearing down a live callout"
        );
        self.free.push(id);
    }

    fn unlink(&mut self, id: CalloutId) {
        let bucket = self.slots[id].as_ref().expect("free slot on a bucket").bucket;
        if let Some(pos) = self.buckets[bucket].iter().position(|&c| c == id) {
            self.buckets[bucket].remove(pos);
        }
    }

    /// Place the callout at absolute tick `tm`. Re-arms a stopped callout.
    pub fn schedule_abs(&mut self, id: CalloutId, tm: Systime) {
        let co = self.slots[id].as_ref().expect("scheduling a free callout slot");
        if co.flags.contains(CoFlags::PENDING) {
            self.unlink(id);
        }
        let bucket = (tm % CALLOUT_BUCKETS as Systime) as usize;
        let co = self.slots[id].as_mut().expect("slot vanished");
        co.time = tm;
        co.bucket = bucket;
        co.flags.insert(CoFlags::PENDING);
        co.flags.remove(CoFlags::STOPPED);
        self.buckets[bucket].push(id);
    }

    /// Reschedule from within the callout's own callback; refused once the
    /// callout has been stopped.
    pub fn reschedule(&mut self, id: CalloutId, tm: Systime) -> bool {
        let co = self.slots[id].as_ref().expect("rescheduling a free callout slot");
        if co.flags.contains(CoFlags::STOPPED) {
            return false;
        }
        self.schedule_abs(id, tm);
        true
    }

    /// Cancel a pending callout. True iff it was still pending, i.e. the
    /// callback has not run and will not run for this scheduling.
    pub fn stop(&mut self, id: CalloutId) -> bool {
        let Some(co) = self.slots[id].as_ref() else {
            return false;
        };
        let was_pending = co.flags.contains(CoFlags::PENDING);
        if was_pending {
            self.unlink(id);
        }
        let co = self.slots[id].as_mut().expect("slot vanished");
        co.flags.remove(CoFlags::PENDING);
        co.flags.insert(CoFlags::STOPPED);
        was_pending
    }

    /// Move every callout expired by `now` onto the delegated queue. Walks
    /// only the buckets whose index advanced since the previous call.
    pub fn process(&mut self, now: Systime) {
        if now <= self.last {
            return;
        }
        let span = now - self.last;
        let nbuckets = CALLOUT_BUCKETS as Systime;
        let walk: Vec<usize> = if span >= nbuckets {
            (0..CALLOUT_BUCKETS).collect()
        } else {
            (1..=span).map(|i| ((self.last + i) % nbuckets) as usize).collect()
        };
        self.last = now;
        for bucket in walk {
            let due: Vec<CalloutId> = self.buckets[bucket]
                .iter()
                .copied()
                .filter(|&id| {
                    self.slots[id].as_ref().map(|co| co.time <= now).unwrap_or(false)
                })
                .collect();
            for id in due {
                self.buckets[bucket].retain(|&c| c != id);
                let co = self.slots[id].as_mut().expect("slot vanished");
                co.flags.remove(CoFlags::PENDING);
                co.flags.insert(CoFlags::ACTIVE);
                self.delegated.push_back(id);
            }
        }
    }

    fn pop_delegated(&mut self) -> Option<(CalloutId, CalloutFn, usize)> {
        let id = self.delegated.pop_front()?;
        let co = self.slots[id].as_ref().expect("free slot delegated");
        Some((id, co.func, co.arg))
    }

    pub fn flags(&self, id: CalloutId) -> CoFlags {
        self.slots[id].as_ref().map(|co| co.flags).unwrap_or(CoFlags::empty())
    }

    pub fn pending(&self, id: CalloutId) -> bool {
        self.flags(id).contains(CoFlags::PENDING)
    }
}

static WHEEL: OnceBox<Spinlock<CalloutWheel>> = OnceBox::new();

fn wheel() -> &'static Spinlock<CalloutWheel> {
    WHEEL.get_or_init(|| Box::new(Spinlock::new(CalloutWheel::new())))
}

/// Wait channel of the callout thread.
const DELEGATED_CHAN: usize = 0x7e7f_0000_0000;

fn drain_chan(id: CalloutId) -> usize {
    0x7e00_0000_0000 | id
}

/// Set up a callout calling `func(arg)`.
pub fn callout_setup(func: CalloutFn, arg: usize) -> CalloutId {
    wheel().lock().setup(func, arg)
}

/// Release a callout slot. Stop and drain it first.
pub fn callout_teardown(id: CalloutId) {
    wheel().lock().teardown(id);
}

/// Schedule `ticks` from now.
pub fn callout_schedule(id: CalloutId, ticks: Systime) {
    let now = crate::clock::getsystime();
    wheel().lock().schedule_abs(id, now + ticks.max(1));
}

/// Schedule at the absolute tick `tm` (not in the past).
pub fn callout_schedule_abs(id: CalloutId, tm: Systime) {
    wheel().lock().schedule_abs(id, tm);
}

/// Cancel if still pending; see [`CalloutWheel::stop`].
pub fn callout_stop(id: CalloutId) -> bool {
    wheel().lock().stop(id)
}

/// Reschedule from inside the callback; false once stopped.
pub fn callout_reschedule(id: CalloutId, tm: Systime) -> bool {
    wheel().lock().reschedule(id, tm)
}

/// Delegate expired callouts and kick the callout thread. Called from the
/// system clock interrupt.
pub fn callout_process(now: Systime) {
    let any = {
        let mut wh = wheel().lock();
        wh.process(now);
        !wh.delegated.is_empty()
    };
    if any {
        sleepq_signal(DELEGATED_CHAN);
    }
}

/// Run one delegated callback, with the wheel unlocked during the call.
/// True if a callback ran.
pub fn run_delegated_once() -> bool {
    let Some((id, func, arg)) = wheel().lock().pop_delegated() else {
        return false;
    };
    func(arg);
    {
        let mut wh = wheel().lock();
        if let Some(co) = wh.slots[id].as_mut() {
            co.flags.remove(CoFlags::ACTIVE);
        }
    }
    sleepq_broadcast(drain_chan(id));
    true
}

/// Wait out any in-flight execution and forbid future ones. On return the
/// callback is neither running nor scheduled, so the callout's memory may
/// be reused. True if the call had to block.
pub fn callout_drain(id: CalloutId) -> bool {
    let mut blocked = false;
    loop {
        let _np = NoPreemptGuard::new();
        {
            let mut wh = wheel().lock();
            if wh.pending(id) {
                wh.stop(id);
            }
            if !wh.flags(id).contains(CoFlags::ACTIVE) {
                return blocked;
            }
        }
        // The no-preemption section makes check-then-sleep atomic with
        // respect to the callout thread's completion broadcast.
        blocked = true;
        sleepq_wait(drain_chan(id), "callout_drain");
    }
}

extern "C" fn callout_thread(_arg: usize) {
    loop {
        while run_delegated_once() {}
        let _np = NoPreemptGuard::new();
        let empty = wheel().lock().delegated.is_empty();
        if empty {
            sleepq_wait(DELEGATED_CHAN, "callout_idle");
        }
    }
}

/// Create the callout wheel and its service thread.
pub fn bootstrap() {
    let _ = wheel();
    if let Ok(tid) = crate::thread::thread_create(
        "callout",
        callout_thread,
        0,
        crate::config::prio_kthread(0),
    ) {
        crate::sched::sched_add(tid);
    }
}

/// Lazily created per-thread callout used for timed sleeps.
pub(crate) fn thread_sleep_callout(tid: crate::Tid) -> CalloutId {
    {
        let ks = crate::sched::ksched().lock();
        if let Some(id) = ks.threads.get(tid).and_then(|td| td.sleep_callout) {
            return id;
        }
    }
    let id = callout_setup(crate::sleepq::sleepq_timeout, tid as usize);
    let mut ks = crate::sched::ksched().lock();
    match ks.threads.get_mut(tid) {
        Some(td) if td.sleep_callout.is_none() => {
            td.sleep_callout = Some(id);
            id
        }
        Some(td) => {
            // Raced with ourselves; keep the first slot.
            let keep = td.sleep_callout.expect("checked above");
            drop(ks);
            callout_teardown(id);
            keep
        }
        None => id,
    }
}
