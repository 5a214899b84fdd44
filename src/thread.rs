//! Thread control blocks and thread lifecycle.
//!
//! Threads reference each other (and locks, and wait queues) by identifier,
//! never by pointer: the wait-for graph of priority propagation and the
//! reaper can then tear a thread down while a lock or queue outlives it.
//! All thread state lives in the scheduler-locked table owned by
//! [`crate::sched`].

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::config::{self, SLICE};
use crate::context::{Context, UserCtx};
use crate::kmem::KStack;
use crate::sched;
use crate::signal::{SigPend, SigSet};
use crate::{Errno, Pid, Result, Tid};

/// Identifies a lock in the wait-for graph (its address serves as the id).
pub type LockId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created but never scheduled.
    Inactive,
    /// On a run queue.
    Ready,
    /// Owns the CPU.
    Running,
    /// Blocked on a sleep queue or turnstile.
    Sleeping,
    /// Suspended by job control.
    Stopped,
    /// Exited, waiting for the reaper.
    Dead,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TdFlags: u32 {
        /// A context switch should be taken at the next preemption point.
        const NEEDSWITCH = 0x1;
        /// The time slice ran out.
        const SLICEEND = 0x2;
        /// Running on priority lent through a turnstile.
        const BORROWING = 0x4;
        /// The current sleep may be aborted by a signal.
        const SLPINTR = 0x8;
    }
}

/// Why a sleeping thread woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Normal,
    TimedOut,
    Interrupted,
}

/// Thread control block.
pub struct Thread {
    pub tid: Tid,
    pub name: String,
    /// Owning process, if this is not a bare kernel thread.
    pub proc: Option<Pid>,
    pub state: ThreadState,
    /// Priority the thread was created with.
    pub base_prio: u8,
    /// Effective priority; may be raised above `base_prio` while lending
    /// through a turnstile.
    pub prio: u8,
    pub flags: TdFlags,
    /// Remaining ticks of the current time slice.
    pub slice: u32,
    /// Wait channel the thread sleeps on, for diagnostics and wakeup.
    pub wchan: Option<usize>,
    /// Human-readable wait point (caller description).
    pub waitpt: Option<&'static str>,
    pub wake_reason: WakeReason,
    /// Lock the thread is blocked on, as an edge of the wait-for graph.
    pub blocked_on: Option<LockId>,
    /// Callout driving a timed sleep, lazily set up.
    pub sleep_callout: Option<crate::callout::CalloutId>,
    pub kstack: Option<KStack>,
    pub kctx: Context,
    pub uctx: UserCtx,
    pub sigmask: SigSet,
    pub sigpend: SigPend,
    /// Resume address for kernel-mode faults on user memory; 0 when unset.
    pub onfault: usize,
    /// Set once someone has joined (a thread is waitable exactly once).
    pub joined: bool,
}

impl Thread {
    pub(crate) fn new(tid: Tid, name: &str, prio: u8) -> Thread {
        Thread {
            tid,
            name: String::from(name),
            proc: None,
            state: ThreadState::Inactive,
            base_prio: prio,
            prio,
            flags: TdFlags::empty(),
            slice: SLICE,
            wchan: None,
            waitpt: None,
            wake_reason: WakeReason::Normal,
            blocked_on: None,
            sleep_callout: None,
            kstack: None,
            kctx: Context::zero(),
            uctx: UserCtx::zero(),
            sigmask: SigSet::empty(),
            sigpend: SigPend::new(),
            onfault: 0,
            joined: false,
        }
    }
}

/// All-threads index plus the reaper's queue of dead threads.
pub struct ThreadTable {
    map: BTreeMap<Tid, Thread>,
    next_tid: Tid,
    zombies: Vec<Tid>,
}

impl ThreadTable {
    pub(crate) fn new() -> ThreadTable {
        ThreadTable { map: BTreeMap::new(), next_tid: 0, zombies: Vec::new() }
    }

    pub(crate) fn insert(&mut self, mut td: Thread) -> Tid {
        let tid = self.next_tid;
        self.next_tid += 1;
        td.tid = tid;
        self.map.insert(tid, td);
        tid
    }

    pub fn get(&self, tid: Tid) -> Option<&Thread> {
        self.map.get(&tid)
    }

    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.map.get_mut(&tid)
    }

    pub fn contains(&self, tid: Tid) -> bool {
        self.map.contains_key(&tid)
    }

    pub(crate) fn push_zombie(&mut self, tid: Tid) {
        self.zombies.push(tid);
    }

    pub(crate) fn take_zombies(&mut self) -> Vec<Tid> {
        core::mem::take(&mut self.zombies)
    }

    pub(crate) fn remove(&mut self, tid: Tid) -> Option<Thread> {
        self.map.remove(&tid)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

/// Wait channel used to join thread `tid`.
pub(crate) fn join_wchan(tid: Tid) -> usize {
    // Synthetic channel: tids never collide with heap addresses.
    0x7f00_0000_0000 | tid as usize
}

/// Create a kernel thread that will run `entry(arg)` when first scheduled,
/// and fall through into [`thread_exit`] should `entry` ever return.
/// The thread starts Inactive; hand it to [`sched::sched_add`] to run it.
pub fn thread_create(name: &str, entry: extern "C" fn(usize), arg: usize, prio: u8) -> Result<Tid> {
    let stack = KStack::alloc()?;
    let mut td = Thread::new(0, name, prio);
    td.kctx.init(entry as usize, stack.top());
    td.kctx.setup_call(thread_exit_trampoline as usize, arg);
    td.kstack = Some(stack);
    let mut ks = sched::ksched().lock();
    let tid = ks.threads.insert(td);
    log::trace!(target: "thread", "created thread {} ({})", tid, name);
    Ok(tid)
}

extern "C" fn thread_exit_trampoline() {
    thread_exit();
}

/// Terminate the calling thread: mark it dead, queue it for the reaper and
/// switch away for good.
pub fn thread_exit() -> ! {
    {
        let mut ks = sched::ksched().lock();
        let current = ks.current;
        let td = ks.threads.get_mut(current).expect("current thread missing");
        td.state = ThreadState::Dead;
        ks.threads.push_zombie(current);
        crate::sleepq::sleepq_broadcast_locked(&mut ks, join_wchan(current));
        sched::switch_locked(&mut ks);
    }
    unreachable!("dead thread resumed");
}

/// Block until `td` has exited, then reap it. Each thread may be joined at
/// most once; later attempts report `ESRCH`.
pub fn thread_join(tid: Tid) -> Result<()> {
    loop {
        {
            let mut ks = sched::ksched().lock();
            let Some(td) = ks.threads.get_mut(tid) else {
                return Err(Errno::Srch);
            };
            if td.joined {
                return Err(Errno::Srch);
            }
            if td.state == ThreadState::Dead {
                td.joined = true;
                drop(ks);
                thread_reap();
                return Ok(());
            }
        }
        crate::sleepq::sleepq_wait(join_wchan(tid), "thread_join");
    }
}

/// Free the control blocks and kernel stacks of dead threads.
pub fn thread_reap() {
    let dead: Vec<Thread> = {
        let mut ks = sched::ksched().lock();
        let tids = ks.threads.take_zombies();
        tids.into_iter().filter_map(|tid| ks.threads.remove(tid)).collect()
    };
    // Stacks and TCBs are dropped outside the scheduler lock.
    for td in &dead {
        log::trace!(target: "thread", "reaped thread {} ({})", td.tid, td.name);
    }
    drop(dead);
}

/// Look up a thread by id. O(log n) in the all-threads index.
pub fn thread_find<R>(tid: Tid, f: impl FnOnce(&Thread) -> R) -> Option<R> {
    let ks = sched::ksched().lock();
    ks.threads.get(tid).map(f)
}

/// The calling thread's id.
pub fn thread_self() -> Tid {
    sched::current_tid()
}

/// Install an `onfault` resume address for the current thread; kernel-mode
/// faults on user memory resume there instead of panicking. Returns the
/// previous value.
pub fn set_onfault(addr: usize) -> usize {
    let mut ks = sched::ksched().lock();
    let current = ks.current;
    let td = ks.threads.get_mut(current).expect("current thread missing");
    core::mem::replace(&mut td.onfault, addr)
}

/// Priority for a kernel service thread, band-mapped.
pub fn kthread_prio(n: usize) -> u8 {
    config::prio_kthread(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn noop(_arg: usize) {}

    #[test]
    fn created_threads_are_inactive_and_findable() {
        crate::testutil::boot();
        let tid = thread_create("td-test-create", noop, 7, config::prio_kthread(10)).unwrap();
        let (state, prio, arg) =
            thread_find(tid, |td| (td.state, td.prio, td.kctx.arg)).unwrap();
        assert_eq!(state, ThreadState::Inactive);
        assert_eq!(prio, config::prio_kthread(10));
        assert_eq!(arg, 7);
    }

    #[test]
    fn join_of_unknown_thread_is_esrch() {
        crate::testutil::boot();
        assert_eq!(thread_join(0xdead_beef), Err(Errno::Srch));
    }

    #[test]
    fn dead_threads_are_reaped_and_joinable_once() {
        crate::testutil::boot();
        // Serialized with other tests that drive the global reaper.
        let _td0 = crate::testutil::lock_thread0();
        let tid = thread_create("td-test-reap", noop, 0, config::prio_kthread(10)).unwrap();
        {
            let mut ks = sched::ksched().lock();
            let td = ks.threads.get_mut(tid).unwrap();
            td.state = ThreadState::Dead;
            ks.threads.push_zombie(tid);
        }
        assert_eq!(thread_join(tid), Ok(()));
        // Fully reaped: the tid no longer resolves.
        assert_eq!(thread_join(tid), Err(Errno::Srch));
        assert!(thread_find(tid, |_| ()).is_none());
    }

    #[test]
    fn trampoline_lands_in_entry_then_exit() {
        crate::testutil::boot();
        let tid = thread_create("td-test-tramp", noop, 0, config::prio_kthread(10)).unwrap();
        thread_find(tid, |td| {
            assert_eq!(td.kctx.pc, noop as usize);
            assert_eq!(td.kctx.ra, thread_exit_trampoline as usize);
            assert_eq!(td.kctx.sp % 16, 0);
        })
        .unwrap();
    }
}
