//! System call dispatch.
//!
//! The architecture header assigns the externally visible numbers; the
//! table here is the machine-independent one the trampoline indexes after
//! decoding the trap. Results follow the kernel-wide convention: `Ok(v)`
//! lands in the result register, `Err(e)` surfaces as the positive errno
//! with `-1` handed to userland, and `EJUSTRETURN` leaves the register
//! file untouched.

use alloc::sync::Arc;

use crate::clock::{Timespec, do_clock_nanosleep};
use crate::proc::{self, WNOHANG};
use crate::signal::{self, SigDisp, SigSet, Signo};
use crate::vm::{Prot, VmFlags};
use crate::vm_map::VmMap;
use crate::{Errno, Result, Vaddr};

/// Machine-independent syscall numbers.
pub mod nr {
    pub const EXIT: usize = 1;
    pub const FORK: usize = 2;
    pub const WAIT4: usize = 3;
    pub const KILL: usize = 4;
    pub const MMAP: usize = 5;
    pub const MUNMAP: usize = 6;
    pub const MPROTECT: usize = 7;
    pub const MADVISE: usize = 8;
    pub const SBRK: usize = 9;
    pub const SIGACTION: usize = 10;
    pub const SIGPROCMASK: usize = 11;
    pub const SIGSUSPEND: usize = 12;
    pub const SIGRETURN: usize = 13;
    pub const SETCONTEXT: usize = 14;
    pub const CLOCK_NANOSLEEP: usize = 15;
    pub const EXECVE: usize = 16;
}

/// `mmap` prot bits as userland passes them.
pub mod prot {
    pub const READ: usize = 1;
    pub const WRITE: usize = 2;
    pub const EXEC: usize = 4;
}

/// `mmap` flags as userland passes them.
pub mod map {
    pub const SHARED: usize = 1;
    pub const PRIVATE: usize = 2;
    pub const FIXED: usize = 4;
    pub const ANON: usize = 8;
    pub const STACK: usize = 16;
}

/// `madvise` advice values understood (and ignored) by the core.
pub mod madv {
    pub const NORMAL: usize = 0;
    pub const RANDOM: usize = 1;
    pub const SEQUENTIAL: usize = 2;
    pub const WILLNEED: usize = 3;
    pub const DONTNEED: usize = 4;
    pub const FREE: usize = 6;
}

fn current_map() -> Result<Arc<VmMap>> {
    let cell = proc::proc_self().ok_or(Errno::Srch)?;
    let p = cell.lock.lock_at("syscall");
    p.vmspace.clone().ok_or(Errno::Srch)
}

fn decode_prot(bits: usize) -> Result<Prot> {
    if bits & !(prot::READ | prot::WRITE | prot::EXEC) != 0 {
        return Err(Errno::Inval);
    }
    Prot::from_bits(bits as u8).ok_or(Errno::Inval)
}

fn decode_flags(bits: usize) -> Result<VmFlags> {
    let known = map::SHARED | map::PRIVATE | map::FIXED | map::ANON | map::STACK;
    if bits & !known != 0 {
        return Err(Errno::Inval);
    }
    let mut flags = VmFlags::empty();
    if bits & map::SHARED != 0 {
        flags |= VmFlags::SHARED;
    }
    if bits & map::PRIVATE != 0 {
        flags |= VmFlags::PRIVATE;
    }
    if bits & map::FIXED != 0 {
        flags |= VmFlags::FIXED;
    }
    if bits & map::ANON != 0 {
        flags |= VmFlags::ANON;
    }
    if bits & map::STACK != 0 {
        flags |= VmFlags::STACK;
    }
    // Exactly one sharing mode.
    if flags.contains(VmFlags::SHARED) == flags.contains(VmFlags::PRIVATE) {
        return Err(Errno::Inval);
    }
    Ok(flags)
}

/// Dispatch a decoded system call. `args` are the raw argument registers.
pub fn syscall_dispatch(code: usize, args: &[usize; 6]) -> Result<usize> {
    match code {
        nr::EXIT => sys_exit(args[0] as i32),
        nr::FORK => proc::do_fork().map(|pid| pid as usize),
        nr::WAIT4 => sys_wait4(args[0] as i32, args[1], args[2] as u32),
        nr::KILL => proc::do_kill(args[0] as u32, args[1] as Signo).map(|_| 0),
        nr::MMAP => sys_mmap(args[0], args[1], args[2], args[3]),
        nr::MUNMAP => sys_munmap(args[0], args[1]),
        nr::MPROTECT => sys_mprotect(args[0], args[1], args[2]),
        nr::MADVISE => sys_madvise(args[0], args[1], args[2]),
        nr::SBRK => proc::do_sbrk(args[0] as isize),
        nr::SIGACTION => sys_sigaction(args[0] as Signo, args[1], args[2]),
        nr::SIGPROCMASK => sys_sigprocmask(args[0] as u32, args[1], args[2]),
        nr::SIGSUSPEND => sys_sigsuspend(args[0]),
        nr::SIGRETURN => sys_sigreturn(args[0]),
        nr::SETCONTEXT => sys_setcontext(args[0]),
        nr::CLOCK_NANOSLEEP => sys_clock_nanosleep(args[0] as u32, args[1] as u32, args[2], args[3]),
        nr::EXECVE => Err(Errno::NotSup),
        _ => {
            log::debug!(target: "syscall", "unknown syscall {}", code);
            Err(Errno::NoSys)
        }
    }
}

fn sys_exit(code: i32) -> Result<usize> {
    proc::proc_exit(signal::status_exited(code));
}

fn sys_wait4(pid: i32, status_uva: Vaddr, options: u32) -> Result<usize> {
    let reaped = proc::do_waitpid(pid, options)?;
    match reaped {
        Some((child, status)) => {
            if status_uva != 0 {
                let map = current_map()?;
                map.copyout(&status.to_ne_bytes(), status_uva)?;
            }
            Ok(child as usize)
        }
        None => {
            debug_assert!(options & WNOHANG != 0);
            Ok(0)
        }
    }
}

/// `mmap` with the surface of the core: anonymous mappings only, offsets
/// page-aligned, length rounded up to whole pages.
fn sys_mmap(addr: usize, length: usize, prot_bits: usize, flag_bits: usize) -> Result<usize> {
    if length == 0 {
        return Err(Errno::Inval);
    }
    let prot = decode_prot(prot_bits)?;
    let flags = decode_flags(flag_bits)?;
    if !flags.contains(VmFlags::ANON) {
        // File-backed mappings belong to the VFS layer.
        return Err(Errno::NotSup);
    }
    let map = current_map()?;
    map.alloc_segment(addr, length, prot, flags)
}

fn sys_munmap(addr: usize, length: usize) -> Result<usize> {
    if length == 0 || !crate::vm::page_aligned(addr) {
        return Err(Errno::Inval);
    }
    let map = current_map()?;
    map.remove_segment(addr, length)?;
    Ok(0)
}

fn sys_mprotect(addr: usize, length: usize, prot_bits: usize) -> Result<usize> {
    let prot = decode_prot(prot_bits)?;
    let map = current_map()?;
    map.protect(addr, addr.checked_add(length).ok_or(Errno::Inval)?, prot)?;
    Ok(0)
}

fn sys_madvise(addr: usize, length: usize, advice: usize) -> Result<usize> {
    if !crate::vm::page_aligned(addr) || length == 0 {
        return Err(Errno::Inval);
    }
    match advice {
        madv::NORMAL | madv::RANDOM | madv::SEQUENTIAL | madv::WILLNEED | madv::DONTNEED
        | madv::FREE => Ok(0),
        _ => Err(Errno::Inval),
    }
}

/// ABI of `struct sigaction` as exchanged with userland.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
struct SigActionAbi {
    /// 0 = default, 1 = ignore, otherwise the handler address.
    handler: usize,
    mask: u32,
    flags: u32,
}

const SIG_DFL: usize = 0;
const SIG_IGN: usize = 1;

fn read_abi<T: Copy>(map: &VmMap, uva: Vaddr) -> Result<T> {
    let mut bytes = alloc::vec![0u8; core::mem::size_of::<T>()];
    map.copyin(uva, &mut bytes)?;
    Ok(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

fn write_abi<T: Copy>(map: &VmMap, uva: Vaddr, value: &T) -> Result<()> {
    let bytes = unsafe {
        core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
    };
    map.copyout(bytes, uva)
}

fn sys_sigaction(sig: Signo, act_uva: Vaddr, oldact_uva: Vaddr) -> Result<usize> {
    let map = current_map()?;
    let disp = if act_uva != 0 {
        let abi: SigActionAbi = read_abi(&map, act_uva)?;
        Some(match abi.handler {
            SIG_DFL => SigDisp::Default,
            SIG_IGN => SigDisp::Ignore,
            handler => SigDisp::Handler { handler, mask: SigSet::from_bits(abi.mask) },
        })
    } else {
        None
    };
    let mut old = SigDisp::Default;
    signal::do_sigaction(sig, disp, Some(&mut old))?;
    if oldact_uva != 0 {
        let abi = match old {
            SigDisp::Default => SigActionAbi { handler: SIG_DFL, ..Default::default() },
            SigDisp::Ignore => SigActionAbi { handler: SIG_IGN, ..Default::default() },
            SigDisp::Handler { handler, mask } => {
                SigActionAbi { handler, mask: mask.bits(), flags: 0 }
            }
        };
        write_abi(&map, oldact_uva, &abi)?;
    }
    Ok(0)
}

fn sys_sigprocmask(how: u32, set_uva: Vaddr, oset_uva: Vaddr) -> Result<usize> {
    let map = current_map()?;
    let set = if set_uva != 0 {
        Some(SigSet::from_bits(read_abi::<u32>(&map, set_uva)?))
    } else {
        None
    };
    let mut old = SigSet::empty();
    signal::do_sigprocmask(how, set, Some(&mut old))?;
    if oset_uva != 0 {
        write_abi(&map, oset_uva, &old.bits())?;
    }
    Ok(0)
}

fn sys_sigsuspend(mask_uva: Vaddr) -> Result<usize> {
    let map = current_map()?;
    let mask = SigSet::from_bits(read_abi::<u32>(&map, mask_uva)?);
    signal::do_sigsuspend(mask).map(|_| 0)
}

fn sys_sigreturn(ucp: Vaddr) -> Result<usize> {
    let map = current_map()?;
    signal::do_sigreturn(ucp, &map)
}

/// `setcontext` restores a full user context the same way `sigreturn`
/// does, and likewise must not have its result register overwritten.
fn sys_setcontext(ucp: Vaddr) -> Result<usize> {
    let map = current_map()?;
    signal::do_sigreturn(ucp, &map)
}

fn sys_clock_nanosleep(clock_id: u32, flags: u32, rqt_uva: Vaddr, rmt_uva: Vaddr) -> Result<usize> {
    let map = current_map()?;
    let rqt: Timespec = read_abi(&map, rqt_uva)?;
    let mut rmt = Timespec::default();
    let result = do_clock_nanosleep(clock_id, flags, &rqt, Some(&mut rmt));
    match result {
        Ok(()) => Ok(0),
        Err(Errno::Intr) => {
            if rmt_uva != 0 {
                write_abi(&map, rmt_uva, &rmt)?;
            }
            Err(Errno::Intr)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prot_and_flag_decoding() {
        assert_eq!(decode_prot(prot::READ | prot::WRITE), Ok(Prot::READ | Prot::WRITE));
        assert_eq!(decode_prot(0x80), Err(Errno::Inval));
        let flags = decode_flags(map::PRIVATE | map::ANON).unwrap();
        assert!(flags.contains(VmFlags::PRIVATE) && flags.contains(VmFlags::ANON));
        // Exactly one of SHARED/PRIVATE.
        assert_eq!(decode_flags(map::ANON), Err(Errno::Inval));
        assert_eq!(decode_flags(map::ANON | map::SHARED | map::PRIVATE), Err(Errno::Inval));
        assert_eq!(decode_flags(0x100), Err(Errno::Inval));
    }

    #[test]
    fn unknown_syscalls_are_enosys() {
        crate::testutil::boot();
        assert_eq!(syscall_dispatch(9999, &[0; 6]), Err(Errno::NoSys));
    }

    #[test]
    fn execve_is_delegated_out_of_the_core() {
        crate::testutil::boot();
        assert_eq!(syscall_dispatch(nr::EXECVE, &[0; 6]), Err(Errno::NotSup));
    }

    #[test]
    fn madvise_validates_its_advice() {
        crate::testutil::boot();
        assert_eq!(sys_madvise(0x1000, crate::config::PAGE_SIZE, madv::WILLNEED), Ok(0));
        assert_eq!(sys_madvise(0x1000, crate::config::PAGE_SIZE, 99), Err(Errno::Inval));
        assert_eq!(sys_madvise(0x1001, crate::config::PAGE_SIZE, madv::NORMAL), Err(Errno::Inval));
    }

    #[test]
    fn mmap_rejects_file_mappings_and_zero_length() {
        crate::testutil::boot();
        assert_eq!(sys_mmap(0, 0, prot::READ, map::PRIVATE | map::ANON), Err(Errno::Inval));
        assert_eq!(sys_mmap(0, 4096, prot::READ, map::PRIVATE), Err(Errno::NotSup));
    }
}
