//! Trap entry points: page faults, the syscall trampoline and the
//! return-to-user path.
//!
//! The architecture glue decodes its exception frame and funnels into the
//! handlers here. The page-fault flow is: software referenced/modified
//! emulation in the pmap first, then the VM map's fault handler, and only
//! if both refuse does the fault become a SIGSEGV (user mode) or engage
//! the thread's `onfault` resume point (kernel mode).

use crate::pmap::pmap_lookup;
use crate::sched;
use crate::signal::{self, SigVerdict, SIGSEGV};
use crate::thread::{self, ThreadState};
use crate::vm::Prot;
use crate::vm_map::vm_map_lookup;
use crate::{Errno, Result, Vaddr};

/// Where a fault came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapMode {
    User,
    Kernel,
}

/// Handle a translation or permission fault at `va`.
///
/// Returns `Ok(())` when the fault was resolved and the access should be
/// retried. A user fault that cannot be resolved posts SIGSEGV to the
/// current process and still reports `Ok(())` so the trap returns to
/// user mode and delivers it. An unresolvable kernel fault is returned to
/// the architecture glue, which resumes at the thread's `onfault` address
/// (that is how `copyin`/`copyout` fail with EFAULT) or panics.
pub fn page_fault_handler(mode: TrapMode, va: Vaddr, access: Prot) -> Result<()> {
    // Fast case: the mapping exists and only needs its software
    // referenced/modified bits primed.
    if let Some(pmap) = pmap_lookup(va) {
        match pmap.emulate_bits(va, access) {
            Ok(()) => return Ok(()),
            // EACCES: the access exceeds the installed protection, which
            // may still be a COW write; EINVAL: no mapping materialized
            // yet. Both continue into the VM fault path.
            Err(Errno::Acces) | Err(Errno::Inval) => {}
            Err(e) => return Err(e),
        }
    }
    let resolved = match vm_map_lookup(va) {
        Some(map) => map.page_fault(va, access),
        None => Err(Errno::Fault),
    };
    match resolved {
        Ok(()) => {
            // Prime the freshly entered mapping so the retried access does
            // not bounce straight back.
            if let Some(pmap) = pmap_lookup(va) {
                let _ = pmap.emulate_bits(va, access);
            }
            Ok(())
        }
        Err(err) => match mode {
            TrapMode::User => {
                log::debug!(target: "trap", "user fault at {:#x} ({:?}): SIGSEGV", va, err);
                signal::sig_trap(SIGSEGV, va);
                Ok(())
            }
            TrapMode::Kernel => {
                let onfault = thread::thread_find(sched::current_tid(), |td| td.onfault)
                    .unwrap_or(0);
                if onfault == 0 {
                    panic!("kernel fault at {:#x} with no onfault handler", va);
                }
                Err(Errno::Fault)
            }
        },
    }
}

/// The syscall trampoline: dispatch, then encode the result into the
/// user context. `EJUSTRETURN` leaves the register file exactly as the
/// handler (e.g. `sigreturn`) rewrote it.
pub fn syscall_handler(code: usize, args: &[usize; 6]) {
    let result = crate::syscall::syscall_dispatch(code, args);
    let tid = sched::current_tid();
    let mut ks = sched::ksched().lock();
    let Some(td) = ks.threads.get_mut(tid) else {
        return;
    };
    match result {
        Ok(value) => td.uctx.set_retval(value, false),
        Err(Errno::JustReturn) => {}
        Err(err) => td.uctx.set_retval(err.code() as usize, true),
    }
}

/// Entry of a freshly forked thread: it has no syscall to finish, only the
/// return-to-user path to walk. The zero return value was planted in its
/// user context by `fork`.
pub extern "C" fn fork_return(_arg: usize) {
    user_exc_leave();
}

/// Return-to-user processing: deliver pending signals, honour stop
/// requests, take a pending context switch. The architecture glue calls
/// this last, then restores the user register file.
pub fn user_exc_leave() {
    loop {
        match signal::sig_check() {
            SigVerdict::None => break,
            SigVerdict::Exit(sig) => signal::sig_exit(sig),
            SigVerdict::Stop(_sig) => {
                let mut ks = sched::ksched().lock();
                let current = ks.current;
                if let Some(td) = ks.threads.get_mut(current) {
                    td.state = ThreadState::Stopped;
                }
                sched::switch_locked(&mut ks);
            }
            SigVerdict::Post(ksi, handler, mask) => {
                let map = match crate::proc::proc_self()
                    .and_then(|cell| cell.lock.lock_at("sig_post").vmspace.clone())
                {
                    Some(map) => map,
                    None => break,
                };
                if signal::sig_send(ksi, handler, mask, &map).is_err() {
                    // The user stack cannot even hold the signal frame:
                    // the process dies with an uncatchable SIGILL.
                    signal::sig_exit(signal::SIGILL);
                }
            }
        }
    }
    maybe_preempt();
}

fn maybe_preempt() {
    let mut ks = sched::ksched().lock();
    let current = ks.current;
    let wants = ks
        .threads
        .get(current)
        .map(|td| td.flags.contains(crate::thread::TdFlags::NEEDSWITCH))
        .unwrap_or(false);
    if wants {
        sched::switch_locked(&mut ks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::physmem::testmem;
    use crate::vm::VmFlags;
    use crate::vm_map::{VmMap, vm_map_activate};

    const RW: Prot = Prot::READ.union(Prot::WRITE);

    #[test]
    fn fault_resolves_and_primes_the_mapping() {
        testmem::init();
        crate::testutil::boot();
        let _td0 = crate::testutil::lock_thread0();
        let map = VmMap::new().unwrap();
        let va = map
            .alloc_segment(0, PAGE_SIZE, RW, VmFlags::ANON | VmFlags::PRIVATE)
            .unwrap();
        vm_map_activate(Some(map.clone()));
        page_fault_handler(TrapMode::User, va, Prot::WRITE).unwrap();
        // The access can proceed without re-faulting.
        assert!(!map.pmap().would_fault(va, Prot::WRITE));
        vm_map_activate(None);
    }

    #[test]
    fn cow_write_fault_goes_through_emulation_then_vm() {
        testmem::init();
        crate::testutil::boot();
        let parent = VmMap::new().unwrap();
        let va = parent
            .alloc_segment(0, PAGE_SIZE, RW, VmFlags::ANON | VmFlags::PRIVATE)
            .unwrap();
        // Materialize and dirty the page, then fork.
        parent.page_fault(va, Prot::WRITE).unwrap();
        let child = parent.clone_map().unwrap();
        let _td0 = crate::testutil::lock_thread0();
        vm_map_activate(Some(child.clone()));
        // The child's write first faults as a missing mapping, then the
        // read-only COW mapping upgrades on the second round.
        page_fault_handler(TrapMode::User, va, Prot::WRITE).unwrap();
        assert!(!child.pmap().would_fault(va, Prot::WRITE));
        vm_map_activate(None);
    }

    #[test]
    #[should_panic(expected = "onfault")]
    fn unresolved_kernel_fault_without_onfault_panics() {
        testmem::init();
        crate::testutil::boot();
        let guard = crate::testutil::lock_thread0();
        // No active user map, kernel range unmapped at this address.
        let result = std::panic::catch_unwind(|| {
            page_fault_handler(TrapMode::Kernel, 0xffff_0000_dead_0000, Prot::READ)
        });
        drop(guard);
        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }
    }

    #[test]
    fn kernel_fault_with_onfault_reports_efault() {
        testmem::init();
        crate::testutil::boot();
        let _td0 = crate::testutil::lock_thread0();
        let old = thread::set_onfault(0x1234);
        let res = page_fault_handler(TrapMode::Kernel, 0xffff_0000_dead_0000, Prot::READ);
        assert_eq!(res, Err(Errno::Fault));
        thread::set_onfault(old);
    }

    #[test]
    fn syscall_results_land_in_the_user_context() {
        crate::testutil::boot();
        let _td0 = crate::testutil::lock_thread0();
        syscall_handler(9999, &[0; 6]);
        let tid = sched::current_tid();
        let (a0, a1) = thread::thread_find(tid, |td| (td.uctx.a0, td.uctx.a1)).unwrap();
        assert_eq!(a0, Errno::NoSys.code() as usize);
        assert_eq!(a1, 1);
    }
}
