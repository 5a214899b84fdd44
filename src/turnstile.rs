//! Turnstiles: priority-sorted wait queues attached to blocking locks, and
//! the vehicle of priority inheritance.
//!
//! The wait-for graph is kept as thread ids and lock ids, never pointers, so
//! threads and locks can outlive each other. A lock owner's effective
//! priority is the maximum of its base priority and the top priority blocked
//! on any turnstile it owns; raising it propagates along the owner's own
//! wait-for edge. The walk terminates because the graph is a forest of
//! chains rooted at a running thread; cycles between sleep mutexes are
//! caller bugs and are not detected here.

use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::config::prio_gt;
use crate::sched::{self, Ksched};
use crate::thread::{LockId, TdFlags, ThreadState};
use crate::{Prio, Tid};

pub struct Turnstile {
    pub owner: Tid,
    /// Blocked threads, highest priority first, FIFO among equals.
    pub blocked: Vec<Tid>,
}

pub struct TurnstileTable {
    ts: HashMap<LockId, Turnstile>,
}

impl TurnstileTable {
    pub(crate) fn new() -> TurnstileTable {
        TurnstileTable { ts: HashMap::new() }
    }

    pub fn blocked_on(&self, lock: LockId) -> usize {
        self.ts.get(&lock).map(|t| t.blocked.len()).unwrap_or(0)
    }
}

fn sorted_insert(ks: &mut Ksched, lock: LockId, tid: Tid) {
    let Ksched { threads, turnstiles, .. } = ks;
    let prio = threads.get(tid).map(|td| td.prio).unwrap_or(255);
    let ts = turnstiles.ts.get_mut(&lock).expect("turnstile vanished");
    let pos = ts
        .blocked
        .iter()
        .position(|&other| {
            let op = threads.get(other).map(|td| td.prio).unwrap_or(255);
            prio_gt(prio, op)
        })
        .unwrap_or(ts.blocked.len());
    ts.blocked.insert(pos, tid);
}

/// Top blocked priority across every turnstile owned by `owner`.
fn lent_prio(ks: &Ksched, owner: Tid) -> Option<Prio> {
    let mut top: Option<Prio> = None;
    for ts in ks.turnstiles.ts.values() {
        if ts.owner != owner {
            continue;
        }
        for &tid in &ts.blocked {
            let prio = ks.threads.get(tid).map(|td| td.prio).unwrap_or(255);
            if top.map(|t| prio_gt(prio, t)).unwrap_or(true) {
                top = Some(prio);
            }
        }
    }
    top
}

/// Recompute `owner`'s effective priority from its base priority and
/// everything lent through its turnstiles, then apply it. Applying it may
/// re-sort the owner in a run queue or, if the owner is itself blocked,
/// recurse along the wait-for chain via [`adjust_locked`].
fn apply_lend(ks: &mut Ksched, owner: Tid) {
    let Some(td) = ks.threads.get(owner) else {
        return;
    };
    let base = td.base_prio;
    let eff = match lent_prio(ks, owner) {
        Some(top) if prio_gt(top, base) => top,
        _ => base,
    };
    let td = ks.threads.get_mut(owner).expect("owner vanished");
    if prio_gt(eff, base) {
        td.flags.insert(TdFlags::BORROWING);
    } else {
        td.flags.remove(TdFlags::BORROWING);
    }
    let old = td.prio;
    if eff != old {
        sched::set_prio_locked(ks, owner, eff);
    }
}

/// Block the thread `tid` on the turnstile of `lock`, whose current owner
/// is `owner`, and propagate priority. The caller performs the context
/// switch afterwards.
pub(crate) fn block_locked(ks: &mut Ksched, tid: Tid, lock: LockId, owner: Tid, waitpt: &'static str) {
    debug_assert_ne!(tid, owner, "thread blocking on its own lock");
    {
        let td = ks.threads.get_mut(tid).expect("blocking thread missing");
        td.state = ThreadState::Sleeping;
        td.blocked_on = Some(lock);
        td.wchan = Some(lock);
        td.waitpt = Some(waitpt);
    }
    let ts = ks.turnstiles.ts.entry(lock).or_insert_with(|| Turnstile { owner, blocked: Vec::new() });
    ts.owner = owner;
    if !ts.blocked.contains(&tid) {
        sorted_insert(ks, lock, tid);
    }
    apply_lend(ks, owner);
}

/// Wake every thread blocked on `lock` and let the releasing owner's
/// priority fall back. The woken threads re-contend for the lock.
pub(crate) fn broadcast_locked(ks: &mut Ksched, lock: LockId) -> bool {
    let Some(ts) = ks.turnstiles.ts.remove(&lock) else {
        return false;
    };
    for tid in ts.blocked {
        if let Some(td) = ks.threads.get_mut(tid) {
            td.blocked_on = None;
            td.wchan = None;
            td.waitpt = None;
        }
        sched::sched_add_locked(ks, tid);
    }
    apply_lend(ks, ts.owner);
    true
}

/// The scheduler changed the priority of `tid`, which is blocked on some
/// turnstile: re-sort it there and propagate a raise to the lock owner.
pub(crate) fn adjust_locked(ks: &mut Ksched, tid: Tid, oldprio: Prio) {
    let Some(lock) = ks.threads.get(tid).and_then(|td| td.blocked_on) else {
        return;
    };
    let Some(ts) = ks.turnstiles.ts.get_mut(&lock) else {
        return;
    };
    if let Some(pos) = ts.blocked.iter().position(|&t| t == tid) {
        ts.blocked.remove(pos);
        sorted_insert(ks, lock, tid);
    }
    let newprio = ks.threads.get(tid).map(|td| td.prio).unwrap_or(255);
    // A decrease does not take lent priority back; the borrower finishes
    // soon anyway.
    if prio_gt(newprio, oldprio) {
        let owner = ks.turnstiles.ts.get(&lock).map(|ts| ts.owner);
        if let Some(owner) = owner {
            apply_lend(ks, owner);
        }
    }
}
