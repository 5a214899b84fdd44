//! CPU context abstraction.
//!
//! Context save and restore is inherently architecture-specific; the core
//! only manipulates contexts through the operations below. The kernel
//! context is what [`ctx_switch`] suspends and resumes; the user context is
//! the register snapshot taken at the user/kernel boundary, and is what
//! signal delivery and `fork` rewrite.
//!
//! This machine-independent rendition models the register file with named
//! fields (program counter, stack pointer, one argument, return value, link)
//! so every contract of the arch layer is expressible and testable; an
//! architecture port replaces the bodies of [`ctx_switch`] and the exception
//! trampolines with real register traffic.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::Vaddr;

/// Saved kernel (callee-saved) context of a suspended thread.
#[derive(Debug, Clone, Default)]
#[repr(C)]
pub struct Context {
    pub pc: usize,
    pub sp: usize,
    /// First argument register at resume.
    pub arg: usize,
    /// Return address the resumed frame unwinds to.
    pub ra: usize,
}

impl Context {
    pub const fn zero() -> Self {
        Context { pc: 0, sp: 0, arg: 0, ra: 0 }
    }

    /// Prepare a fresh context so that the first switch-in starts executing
    /// `entry` on `stack_top`.
    pub fn init(&mut self, entry: usize, stack_top: Vaddr) {
        // Keep the stack 16-byte aligned, the strictest ABI we serve.
        self.sp = stack_top & !0xf;
        self.pc = entry;
        self.arg = 0;
        self.ra = 0;
    }

    /// Arrange for the context to resume at `retaddr` with `arg` in the
    /// first argument register.
    pub fn setup_call(&mut self, retaddr: usize, arg: usize) {
        self.ra = retaddr;
        self.arg = arg;
    }
}

/// User-mode register snapshot taken at the kernel boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct UserCtx {
    pub pc: usize,
    pub sp: usize,
    /// Argument / return-value registers, a0..a2.
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    /// Return address register.
    pub ra: usize,
}

impl UserCtx {
    pub const fn zero() -> Self {
        UserCtx { pc: 0, sp: 0, a0: 0, a1: 0, a2: 0, ra: 0 }
    }

    /// Set the syscall return value; `error` mirrors the carry-flag style
    /// error indication of the syscall ABI.
    pub fn set_retval(&mut self, value: usize, error: bool) {
        self.a0 = value;
        self.a1 = error as usize;
    }
}

static SWITCH_COUNT: AtomicU64 = AtomicU64::new(0);

/// Switch from `from` to `to`.
///
/// On real hardware this does not return until `from` is switched back in.
/// The machine-independent build records the hand-off and returns, which is
/// sufficient for the data-structure contracts the core is written against.
pub fn ctx_switch(from: &mut Context, to: &Context) {
    let _ = (&from, &to);
    SWITCH_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Number of context switches since boot.
pub fn switch_count() -> u64 {
    SWITCH_COUNT.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_aligns_the_stack() {
        let mut ctx = Context::zero();
        ctx.init(0x8000_1234, 0xffff_0000_0010_0f08);
        assert_eq!(ctx.sp % 16, 0);
        assert_eq!(ctx.pc, 0x8000_1234);
    }

    #[test]
    fn setup_call_routes_arg_and_return() {
        let mut ctx = Context::zero();
        ctx.init(0x1000, 0x2000);
        ctx.setup_call(0xdead, 42);
        assert_eq!(ctx.ra, 0xdead);
        assert_eq!(ctx.arg, 42);
    }

    #[test]
    fn user_retval_encodes_error_flag() {
        let mut uctx = UserCtx::zero();
        uctx.set_retval(7, false);
        assert_eq!((uctx.a0, uctx.a1), (7, 0));
        uctx.set_retval(22, true);
        assert_eq!((uctx.a0, uctx.a1), (22, 1));
    }
}
