//! Processes: containers of threads with an address space, signal
//! dispositions and wait/exit plumbing.
//!
//! The core treats a process as the unit that owns a VM map and a signal
//! disposition table; each process carries a lock (`p_lock` in the
//! interface of old) serializing signal posting and process-group changes.
//! Everything else the full system hangs off a process (descriptor tables,
//! credentials beyond a uid, working directory) lives outside the core.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::{PAGE_SIZE, SBRK_START};
use crate::mutex::Mutex;
use crate::sched;
use crate::signal::{self, SigActionTable, SigInfo, SigPend, SIGCHLD};
use crate::sleepq;
use crate::spinlock::SpinLock;
use crate::thread::{self, WakeReason};
use crate::vm::{Prot, VmFlags};
use crate::vm_map::VmMap;
use crate::{Errno, Pid, Result, Tid, Vaddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Alive,
    Stopped,
    Zombie,
}

pub struct Proc {
    pub name: String,
    pub parent: Option<Pid>,
    pub children: Vec<Pid>,
    pub threads: Vec<Tid>,
    pub vmspace: Option<Arc<VmMap>>,
    pub sigactions: SigActionTable,
    /// Process-wide pending signals.
    pub sigpend: SigPend,
    pub pgrp: Pid,
    pub session: Pid,
    pub state: ProcState,
    /// `wait4` status, valid once `state` is `Zombie`.
    pub exit_status: i32,
    /// Start of the brk segment; attached on first `sbrk` use.
    pub sbrk_start: Option<Vaddr>,
    /// Byte-granular program break inside the brk segment.
    pub sbrk_end: Vaddr,
    pub uid: u32,
}

/// A process and its lock, shared through the process table.
pub struct ProcCell {
    pub pid: Pid,
    pub lock: Mutex<Proc>,
}

static PROCS: SpinLock<BTreeMap<Pid, Arc<ProcCell>>> = SpinLock::new(BTreeMap::new());
static NEXT_PID: AtomicU32 = AtomicU32::new(0);

fn wait_wchan(pid: Pid) -> usize {
    0x7c00_0000_0000 | pid as usize
}

fn register(name: &str, parent: Option<Pid>, vmspace: Option<Arc<VmMap>>, tid: Tid) -> Arc<ProcCell> {
    let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
    let (pgrp, session) = parent
        .and_then(proc_find)
        .map(|p| {
            let p = p.lock.lock();
            (p.pgrp, p.session)
        })
        .unwrap_or((pid, pid));
    let proc = Proc {
        name: String::from(name),
        parent,
        children: Vec::new(),
        threads: alloc::vec![tid],
        vmspace,
        sigactions: SigActionTable::new(),
        sigpend: SigPend::new(),
        pgrp,
        session,
        state: ProcState::Alive,
        exit_status: 0,
        sbrk_start: None,
        sbrk_end: 0,
        uid: 0,
    };
    let cell = Arc::new(ProcCell { pid, lock: Mutex::new(proc) });
    PROCS.lock().insert(pid, cell.clone());
    if let Some(ppid) = parent
        && let Some(pcell) = proc_find(ppid)
    {
        pcell.lock.lock().children.push(pid);
    }
    {
        let mut ks = sched::ksched().lock();
        if let Some(td) = ks.threads.get_mut(tid) {
            td.proc = Some(pid);
        }
    }
    cell
}

/// Process 0 adopts the boot thread.
pub fn bootstrap() {
    let boot_tid = sched::current_tid();
    let _ = register("proc0", None, None, boot_tid);
}

pub fn proc_find(pid: Pid) -> Option<Arc<ProcCell>> {
    PROCS.lock().get(&pid).cloned()
}

/// The current thread's process.
pub fn proc_self() -> Option<Arc<ProcCell>> {
    let tid = sched::current_tid();
    let pid = {
        let ks = sched::ksched().lock();
        ks.threads.get(tid).and_then(|td| td.proc)
    };
    pid.and_then(proc_find)
}

/// Fork the current process: clone the address space copy-on-write, clone
/// the calling thread's user context with a zero return value, inherit
/// signal dispositions and process group. Returns the child pid.
pub fn do_fork() -> Result<Pid> {
    let parent_cell = proc_self().ok_or(Errno::Srch)?;
    let parent_tid = sched::current_tid();

    let (name, vmspace, sigactions, sbrk_start, sbrk_end, uid) = {
        let p = parent_cell.lock.lock_at("fork");
        let vmspace = p.vmspace.as_ref().ok_or(Errno::Srch)?.clone_map()?;
        (p.name.clone(), vmspace, p.sigactions.clone(), p.sbrk_start, p.sbrk_end, p.uid)
    };

    // The child gets a fresh kernel stack and context; it continues
    // execution on the user-mode exit path, as if returning from the very
    // trap that forked it.
    let (base_prio, uctx) = {
        let ks = sched::ksched().lock();
        let td = ks.threads.get(parent_tid).ok_or(Errno::Srch)?;
        (td.base_prio, td.uctx)
    };
    let child_tid = thread::thread_create(&name, crate::trap::fork_return, 0, base_prio)?;
    {
        let mut ks = sched::ksched().lock();
        let td = ks.threads.get_mut(child_tid).expect("fresh thread vanished");
        td.uctx = uctx;
        td.uctx.set_retval(0, false);
    }

    let child = register(&name, Some(parent_cell.pid), Some(vmspace), child_tid);
    {
        let mut c = child.lock.lock();
        c.sigactions = sigactions;
        c.sbrk_start = sbrk_start;
        c.sbrk_end = sbrk_end;
        c.uid = uid;
    }

    sched::sched_add(child_tid);
    log::debug!(target: "proc", "forked pid {} from {}", child.pid, parent_cell.pid);
    Ok(child.pid)
}

/// Terminate the current process with an already-encoded wait status: drop
/// the address space, hand children to process 0, notify the parent, then
/// exit the calling thread for good.
pub fn proc_exit(status: i32) -> ! {
    if let Some(cell) = proc_self() {
        let (parent, orphans) = {
            let mut p = cell.lock.lock_at("exit");
            p.state = ProcState::Zombie;
            p.exit_status = status;
            p.vmspace = None;
            (p.parent, core::mem::take(&mut p.children))
        };
        for orphan in orphans {
            if let Some(ocell) = proc_find(orphan) {
                ocell.lock.lock().parent = Some(0);
                if let Some(reaper) = proc_find(0) {
                    reaper.lock.lock().children.push(orphan);
                }
            }
        }
        if let Some(ppid) = parent {
            if let Some(pcell) = proc_find(ppid) {
                signal::sig_kill(&pcell, SigInfo::raw(SIGCHLD));
            }
            sleepq::sleepq_broadcast(wait_wchan(ppid));
        }
    }
    thread::thread_exit();
}

/// Options understood by [`do_waitpid`].
pub const WNOHANG: u32 = 1;

/// Reap a zombie child. `pid` selects a specific child when positive, any
/// child when negative. Blocks unless `WNOHANG`; `Ok(None)` means "nothing
/// yet" under `WNOHANG`.
pub fn do_waitpid(pid: i32, options: u32) -> Result<Option<(Pid, i32)>> {
    let cell = proc_self().ok_or(Errno::Srch)?;
    loop {
        let mut have_candidates = false;
        let mut reaped: Option<(Pid, i32)> = None;
        {
            let mut p = cell.lock.lock_at("waitpid");
            for &child in &p.children {
                if pid > 0 && child != pid as Pid {
                    continue;
                }
                have_candidates = true;
                let Some(ccell) = proc_find(child) else {
                    continue;
                };
                let c = ccell.lock.lock();
                if c.state == ProcState::Zombie {
                    reaped = Some((child, c.exit_status));
                    break;
                }
            }
            if let Some((child, _)) = reaped {
                p.children.retain(|&c| c != child);
            }
        }
        if let Some((child, status)) = reaped {
            // Drop the zombie's last reference: table removal frees the
            // process once nobody holds it.
            PROCS.lock().remove(&child);
            reap_threads(child);
            return Ok(Some((child, status)));
        }
        if !have_candidates {
            return Err(Errno::Child);
        }
        if options & WNOHANG != 0 {
            return Ok(None);
        }
        match sleepq::sleepq_wait_timed(wait_wchan(cell.pid), "waitpid", 0) {
            WakeReason::Interrupted => return Err(Errno::Intr),
            _ => continue,
        }
    }
}

/// Release whatever dead threads the reaped process left behind.
fn reap_threads(_pid: Pid) {
    thread::thread_reap();
}

/// Send `sig` to the process identified by `pid`.
pub fn do_kill(pid: Pid, sig: signal::Signo) -> Result<()> {
    let cell = proc_find(pid).ok_or(Errno::Srch)?;
    let (sender_pid, sender_uid) = match proc_self() {
        Some(me) => (me.pid as i32, me.lock.lock().uid),
        None => (0, 0),
    };
    if sig == 0 {
        // Existence probe only.
        return Ok(());
    }
    if sig as usize >= signal::NSIG {
        return Err(Errno::Inval);
    }
    signal::sig_kill(&cell, SigInfo::user(sig, sender_pid, sender_uid));
    Ok(())
}

/// Grow or shrink the program break. The brk segment is created lazily at
/// the first gap at or above `SBRK_START`; shrinking below its start is
/// EINVAL, and the byte-granular break may sit anywhere inside the
/// page-granular segment.
pub fn do_sbrk(increment: isize) -> Result<Vaddr> {
    let cell = proc_self().ok_or(Errno::Srch)?;
    let mut p = cell.lock.lock_at("sbrk");
    let map = p.vmspace.as_ref().ok_or(Errno::Srch)?.clone();

    if p.sbrk_start.is_none() {
        // Attach a one-page brk segment on first use.
        let start = map.alloc_segment(
            SBRK_START,
            PAGE_SIZE,
            Prot::READ | Prot::WRITE,
            VmFlags::ANON | VmFlags::PRIVATE,
        )?;
        p.sbrk_start = Some(start);
        p.sbrk_end = start;
    }
    let start = p.sbrk_start.expect("attached above");
    let old_end = p.sbrk_end;
    let new_end = old_end
        .checked_add_signed(increment)
        .filter(|&e| e >= start)
        .ok_or(Errno::Inval)?;

    // The segment always spans at least one page.
    let new_seg_end = crate::vm::page_align_up(new_end).max(start + PAGE_SIZE);
    map.resize(start, new_seg_end)?;
    p.sbrk_end = new_end;
    Ok(old_end)
}
