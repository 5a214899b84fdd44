//! Signal machinery at the thread layer: queued siginfo, dispositions,
//! masking and the handler trampoline on the user stack.
//!
//! Delivery runs when a thread is about to return to user mode:
//! [`sig_check`] picks the lowest-numbered deliverable signal, default
//! actions are applied in the kernel, and [`sig_send`] marshals the
//! trampoline code, the signal info and the interrupted context onto the
//! user stack so the handler returns through `sigreturn`.

use alloc::collections::VecDeque;

use crate::proc::{self, ProcCell};
use crate::sched;
use crate::thread::{TdFlags, ThreadState};
use crate::vm_map::VmMap;
use crate::{Errno, Result, Tid, Vaddr};

pub const NSIG: usize = 32;

pub type Signo = u8;

pub const SIGINT: Signo = 1;
pub const SIGILL: Signo = 2;
pub const SIGABRT: Signo = 3;
pub const SIGFPE: Signo = 4;
pub const SIGSEGV: Signo = 5;
pub const SIGKILL: Signo = 6;
pub const SIGTERM: Signo = 7;
pub const SIGCHLD: Signo = 8;
pub const SIGUSR1: Signo = 9;
pub const SIGUSR2: Signo = 10;
pub const SIGBUS: Signo = 11;
pub const SIGSTOP: Signo = 12;
pub const SIGCONT: Signo = 13;

/// Set of signal numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct SigSet(u32);

impl SigSet {
    pub const fn empty() -> SigSet {
        SigSet(0)
    }

    pub const fn full() -> SigSet {
        SigSet(!0)
    }

    pub const fn from_bits(bits: u32) -> SigSet {
        SigSet(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub fn add(&mut self, sig: Signo) {
        self.0 |= 1 << sig;
    }

    pub fn del(&mut self, sig: Signo) {
        self.0 &= !(1 << sig);
    }

    pub fn has(&self, sig: Signo) -> bool {
        self.0 & (1 << sig) != 0
    }

    pub fn union(&mut self, other: SigSet) {
        self.0 |= other.0;
    }

    pub fn subtract(&mut self, other: SigSet) {
        self.0 &= !other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// What generated a signal, as reported in `siginfo`.
pub const SI_NOINFO: i32 = 32767;
pub const SI_USER: i32 = 0;
pub const TRAP_FAULT: i32 = 1;

/// Signal information carried with every queued signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SigInfo {
    pub signo: i32,
    pub code: i32,
    pub errno: i32,
    /// Faulting address for trap signals.
    pub addr: usize,
    /// Sender for user signals.
    pub pid: i32,
    pub uid: u32,
}

impl SigInfo {
    /// A signal raised by a hardware trap at `addr`.
    pub fn trap(sig: Signo, addr: usize) -> SigInfo {
        SigInfo { signo: sig as i32, code: TRAP_FAULT, errno: 0, addr, pid: 0, uid: 0 }
    }

    /// A signal with no additional information.
    pub fn raw(sig: Signo) -> SigInfo {
        SigInfo { signo: sig as i32, code: SI_NOINFO, errno: 0, addr: 0, pid: 0, uid: 0 }
    }

    /// A signal sent by `kill` from another process.
    pub fn user(sig: Signo, pid: i32, uid: u32) -> SigInfo {
        SigInfo { signo: sig as i32, code: SI_USER, errno: 0, addr: 0, pid, uid }
    }
}

/// Queue of pending signals plus the summary set.
#[derive(Debug, Default)]
pub struct SigPend {
    queue: VecDeque<SigInfo>,
    set: SigSet,
}

impl SigPend {
    pub fn new() -> SigPend {
        SigPend { queue: VecDeque::new(), set: SigSet::empty() }
    }

    pub fn post(&mut self, ksi: SigInfo) {
        self.set.add(ksi.signo as Signo);
        self.queue.push_back(ksi);
    }

    pub fn pending(&self) -> SigSet {
        self.set
    }

    /// Take the lowest-numbered pending signal not blocked by `mask`.
    pub fn take(&mut self, mask: SigSet) -> Option<SigInfo> {
        let mut pick: Option<(usize, SigInfo)> = None;
        for (i, ksi) in self.queue.iter().enumerate() {
            let sig = ksi.signo as Signo;
            if mask.has(sig) {
                continue;
            }
            match pick {
                Some((_, best)) if best.signo <= ksi.signo => {}
                _ => pick = Some((i, *ksi)),
            }
        }
        let (i, ksi) = pick?;
        self.queue.remove(i);
        let sig = ksi.signo as Signo;
        if !self.queue.iter().any(|other| other.signo == ksi.signo) {
            self.set.del(sig);
        }
        Some(ksi)
    }

    pub fn discard(&mut self, sig: Signo) {
        self.queue.retain(|ksi| ksi.signo != sig as i32);
        self.set.del(sig);
    }
}

/// Disposition of one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigDisp {
    #[default]
    Default,
    Ignore,
    Handler {
        handler: Vaddr,
        mask: SigSet,
    },
}

/// Per-process disposition table.
#[derive(Debug, Clone)]
pub struct SigActionTable([SigDisp; NSIG]);

impl SigActionTable {
    pub fn new() -> SigActionTable {
        SigActionTable([SigDisp::Default; NSIG])
    }

    pub fn get(&self, sig: Signo) -> SigDisp {
        self.0.get(sig as usize).copied().unwrap_or(SigDisp::Default)
    }

    pub fn set(&mut self, sig: Signo, disp: SigDisp) -> Result<SigDisp> {
        if sig as usize >= NSIG || sig == 0 {
            return Err(Errno::Inval);
        }
        // The disposition of SIGKILL and SIGSTOP cannot be changed.
        if sig == SIGKILL || sig == SIGSTOP {
            return Err(Errno::Inval);
        }
        Ok(core::mem::replace(&mut self.0[sig as usize], disp))
    }
}

/// Default action of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Term,
    Core,
    Stop,
    Cont,
    Ign,
}

pub fn default_action(sig: Signo) -> DefaultAction {
    match sig {
        SIGILL | SIGABRT | SIGFPE | SIGSEGV | SIGBUS => DefaultAction::Core,
        SIGCHLD => DefaultAction::Ign,
        SIGSTOP => DefaultAction::Stop,
        SIGCONT => DefaultAction::Cont,
        _ => DefaultAction::Term,
    }
}

/// Post `ksi` to a process and make sure at least one of its threads will
/// notice. Ignored signals are dropped at posting time; SIGKILL always gets
/// through. Caller must not hold the scheduler lock.
pub fn sig_kill(cell: &ProcCell, ksi: SigInfo) {
    let sig = ksi.signo as Signo;
    let wake: alloc::vec::Vec<Tid> = {
        let mut p = cell.lock.lock_at("sig_kill");
        if sig != SIGKILL {
            let ignored = match p.sigactions.get(sig) {
                SigDisp::Ignore => true,
                SigDisp::Default => default_action(sig) == DefaultAction::Ign,
                SigDisp::Handler { .. } => false,
            };
            if ignored {
                return;
            }
        }
        p.sigpend.post(ksi);
        p.threads.clone()
    };
    // Wake a thread whose mask admits the signal so it runs sig_check on
    // its way back to user mode.
    let mut ks = sched::ksched().lock();
    for tid in wake {
        let Some(td) = ks.threads.get(tid) else {
            continue;
        };
        if td.sigmask.has(sig) && sig != SIGKILL {
            continue;
        }
        let interruptible = td.flags.contains(TdFlags::SLPINTR);
        match td.state {
            ThreadState::Sleeping if interruptible => {
                crate::sleepq::sleepq_abort_locked(&mut ks, tid);
            }
            ThreadState::Stopped if sig == SIGKILL || sig == SIGCONT => {
                sched::sched_add_locked(&mut ks, tid);
            }
            _ => {}
        }
        break;
    }
}

/// What `sig_check` decided for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigVerdict {
    /// Nothing deliverable.
    None,
    /// Run the registered handler for this signal.
    Post(SigInfo, Vaddr, SigSet),
    /// The process must die with this signal (default term/core action).
    Exit(Signo),
    /// The thread stops (job control).
    Stop(Signo),
}

/// Pick the next deliverable signal for the current thread, consuming it
/// from the pending queues. Called on the way back to user mode.
pub fn sig_check() -> SigVerdict {
    let Some(cell) = proc::proc_self() else {
        return SigVerdict::None;
    };
    let tid = sched::current_tid();
    let mask = crate::thread::thread_find(tid, |td| td.sigmask).unwrap_or(SigSet::empty());
    loop {
        // Process-wide queue first, then the thread-private one.
        let picked = {
            let mut p = cell.lock.lock_at("sig_check");
            p.sigpend.take(mask)
        }
        .or_else(|| {
            let mut ks = sched::ksched().lock();
            ks.threads.get_mut(tid).and_then(|td| td.sigpend.take(mask))
        });
        let Some(ksi) = picked else {
            return SigVerdict::None;
        };
        match classify(&cell, ksi) {
            SigVerdict::None => continue,
            verdict => return verdict,
        }
    }
}

fn classify(cell: &ProcCell, ksi: SigInfo) -> SigVerdict {
    let sig = ksi.signo as Signo;
    let disp = cell.lock.lock_at("sig_check").sigactions.get(sig);
    match disp {
        SigDisp::Ignore => SigVerdict::None,
        SigDisp::Handler { handler, mask } => SigVerdict::Post(ksi, handler, mask),
        SigDisp::Default => match default_action(sig) {
            DefaultAction::Ign | DefaultAction::Cont => SigVerdict::None,
            DefaultAction::Term | DefaultAction::Core => SigVerdict::Exit(sig),
            DefaultAction::Stop => SigVerdict::Stop(sig),
        },
    }
}

/// Machine trampoline copied to the user stack; it performs the `sigreturn`
/// syscall when the handler returns. The byte sequence is supplied by the
/// architecture glue.
pub static SIGCODE: [u8; 16] = [
    0x13, 0x05, 0x00, 0x00, // placeholder encoding of "load sigreturn nr"
    0x73, 0x00, 0x00, 0x00, // placeholder encoding of "syscall"
    0, 0, 0, 0, 0, 0, 0, 0,
];

/// Saved user context as restored by `sigreturn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct UContext {
    pub mcontext: crate::context::UserCtx,
    pub sigmask: SigSet,
}

/// The frame constructed on the user stack for a handler invocation.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct SigFrame {
    uc: UContext,
    info: SigInfo,
}

fn as_bytes<T>(value: &T) -> &[u8] {
    unsafe { core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>()) }
}

const STACK_ALIGN: usize = 16;

fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

/// Arrange for the current thread to enter `handler` on return to user
/// mode: push the sigreturn trampoline and a `(ucontext, siginfo)` frame
/// onto the user stack, then patch the user registers so the handler runs
/// with `(signo, &info, &ucontext)` and returns into the trampoline.
///
/// A stack so corrupted that the frame cannot be written leaves the thread
/// unable to take any signal; it is terminated with an uncatchable SIGILL.
pub fn sig_send(ksi: SigInfo, handler: Vaddr, handler_mask: SigSet, map: &VmMap) -> Result<()> {
    let tid = sched::current_tid();
    let (mut uctx, oldmask) = {
        let ks = sched::ksched().lock();
        let td = ks.threads.get(tid).ok_or(Errno::Srch)?;
        (td.uctx, td.sigmask)
    };

    // Trampoline goes on top, below the interrupted stack pointer.
    let mut sp = align_down(uctx.sp, STACK_ALIGN);
    sp -= SIGCODE.len().next_multiple_of(STACK_ALIGN);
    let sigcode_uva = sp;
    map.copyout(&SIGCODE, sigcode_uva).map_err(|_| Errno::Fault)?;

    // Then the signal frame.
    let frame = SigFrame { uc: UContext { mcontext: uctx, sigmask: oldmask }, info: ksi };
    sp -= core::mem::size_of::<SigFrame>().next_multiple_of(STACK_ALIGN);
    let frame_uva = sp;
    map.copyout(as_bytes(&frame), frame_uva).map_err(|_| Errno::Fault)?;

    // Patch the user registers: resume in the handler with the frame
    // pointers as arguments, return address at the trampoline. The callee
    // may store one word below its stack pointer before pushing a frame.
    uctx.pc = handler;
    uctx.a0 = ksi.signo as usize;
    uctx.a1 = frame_uva + core::mem::offset_of!(SigFrame, info);
    uctx.a2 = frame_uva + core::mem::offset_of!(SigFrame, uc);
    uctx.sp = frame_uva - core::mem::size_of::<usize>();
    uctx.ra = sigcode_uva;

    {
        let mut ks = sched::ksched().lock();
        let td = ks.threads.get_mut(tid).ok_or(Errno::Srch)?;
        td.uctx = uctx;
        // The handler runs with its declared mask plus the signal itself.
        let mut mask = td.sigmask;
        mask.union(handler_mask);
        mask.add(ksi.signo as Signo);
        td.sigmask = mask;
    }
    Ok(())
}

/// Restore the context saved by [`sig_send`]. The distinguished
/// `EJUSTRETURN` tells the syscall trampoline to leave the restored
/// registers alone.
pub fn do_sigreturn(ucp: Vaddr, map: &VmMap) -> Result<usize> {
    let mut bytes = [0u8; core::mem::size_of::<UContext>()];
    map.copyin(ucp, &mut bytes)?;
    let uc: UContext = unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const UContext) };
    let tid = sched::current_tid();
    let mut ks = sched::ksched().lock();
    let td = ks.threads.get_mut(tid).ok_or(Errno::Srch)?;
    td.uctx = uc.mcontext;
    td.sigmask = uc.sigmask;
    Err(Errno::JustReturn)
}

/// Synchronous fault delivery (SIGSEGV, SIGBUS, SIGILL, SIGFPE) from the
/// CPU exception handler.
pub fn sig_trap(sig: Signo, addr: usize) {
    if let Some(cell) = proc::proc_self() {
        sig_kill(&cell, SigInfo::trap(sig, addr));
    }
}

/// Terminate the process because of `sig` (default term/core action, or an
/// undeliverable handler).
pub fn sig_exit(sig: Signo) -> ! {
    log::debug!(target: "signal", "process killed by signal {}", sig);
    proc::proc_exit(status_killed(sig));
}

/// Wait-status encodings: exit code in the high byte, termination signal in
/// the low bits.
pub fn status_exited(code: i32) -> i32 {
    (code & 0xff) << 8
}

pub fn status_killed(sig: Signo) -> i32 {
    sig as i32 & 0x7f
}

pub const SIG_BLOCK: u32 = 1;
pub const SIG_UNBLOCK: u32 = 2;
pub const SIG_SETMASK: u32 = 3;

/// Adjust the current thread's signal mask; SIGKILL and SIGSTOP are never
/// blockable.
pub fn do_sigprocmask(how: u32, set: Option<SigSet>, oset: Option<&mut SigSet>) -> Result<()> {
    let tid = sched::current_tid();
    let mut ks = sched::ksched().lock();
    let td = ks.threads.get_mut(tid).ok_or(Errno::Srch)?;
    if let Some(oset) = oset {
        *oset = td.sigmask;
    }
    let Some(mut set) = set else {
        return Ok(());
    };
    set.del(SIGKILL);
    set.del(SIGSTOP);
    match how {
        SIG_BLOCK => td.sigmask.union(set),
        SIG_UNBLOCK => td.sigmask.subtract(set),
        SIG_SETMASK => td.sigmask = set,
        _ => return Err(Errno::Inval),
    }
    Ok(())
}

/// Install a new disposition; the old one is written to `old` when asked.
pub fn do_sigaction(sig: Signo, disp: Option<SigDisp>, old: Option<&mut SigDisp>) -> Result<()> {
    let cell = proc::proc_self().ok_or(Errno::Srch)?;
    let mut p = cell.lock.lock_at("sigaction");
    if let Some(old) = old {
        *old = p.sigactions.get(sig);
    }
    if let Some(disp) = disp {
        p.sigactions.set(sig, disp)?;
    }
    Ok(())
}

/// Replace the mask and sleep until a signal is delivered. Always "fails"
/// with EINTR, after restoring the original mask.
pub fn do_sigsuspend(mask: SigSet) -> Result<()> {
    let tid = sched::current_tid();
    let old = {
        let mut ks = sched::ksched().lock();
        let td = ks.threads.get_mut(tid).ok_or(Errno::Srch)?;
        let old = td.sigmask;
        let mut mask = mask;
        mask.del(SIGKILL);
        mask.del(SIGSTOP);
        td.sigmask = mask;
        old
    };
    while crate::sleepq::sleepq_wait_timed(sigsuspend_chan(tid), "sigsuspend", 0)
        != crate::thread::WakeReason::Interrupted
    {}
    let mut ks = sched::ksched().lock();
    if let Some(td) = ks.threads.get_mut(tid) {
        td.sigmask = old;
    }
    Err(Errno::Intr)
}

fn sigsuspend_chan(tid: Tid) -> usize {
    0x7b00_0000_0000 | tid as usize
}
