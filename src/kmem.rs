//! Page-granular kernel memory.
//!
//! To serve N bytes, the kernel virtual range is reserved first, then
//! physical pages are allocated in maximal power-of-two runs to cover it and
//! entered into the kernel pmap. Thread stacks come from here too, with an
//! unmapped guard page left below the mapped stack so overflow faults
//! instead of corrupting neighbours.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use hashbrown::HashMap;
use once_cell::race::OnceBox;
use spinning_top::Spinlock;

use crate::config::{KERNEL_SPACE_END, KERNEL_SPACE_START, KSTACK_PAGES, PAGE_SIZE};
use crate::pmap::{pmap_kenter, pmap_kremove};
use crate::physmem::{pm_alloc, pm_free};
use crate::vm::{Prot, page_align_up};
use crate::vmem::{vmem_add, vmem_alloc, vmem_free};
use crate::{Errno, Paddr, Result, Vaddr};

/// Physical runs backing each live kmem allocation, keyed by its KVA.
static RUNS: OnceBox<Spinlock<HashMap<Vaddr, Vec<(Paddr, usize)>>>> = OnceBox::new();

fn runs() -> &'static Spinlock<HashMap<Vaddr, Vec<(Paddr, usize)>>> {
    RUNS.get_or_init(|| alloc::boxed::Box::new(Spinlock::new(HashMap::new())))
}

static BOOTSTRAPPED: AtomicBool = AtomicBool::new(false);

/// Donate the kernel virtual range to the KVA arena. Must run exactly once.
pub fn bootstrap() {
    if BOOTSTRAPPED.swap(true, Ordering::AcqRel) {
        panic!("kmem bootstrapped twice");
    }
    vmem_add(KERNEL_SPACE_START, KERNEL_SPACE_END - KERNEL_SPACE_START);
}

fn cover(va: Vaddr, npages: usize) -> core::result::Result<Vec<(Paddr, usize)>, Vec<(Paddr, usize)>> {
    let mut acquired: Vec<(Paddr, usize)> = Vec::new();
    let mut cursor = va;
    let mut left = npages;
    while left > 0 {
        let mut chunk = 1usize << (usize::BITS - 1 - left.leading_zeros());
        let pa = loop {
            match pm_alloc(chunk) {
                Some(pa) => break Some(pa),
                None if chunk > 1 => chunk /= 2,
                None => break None,
            }
        };
        let Some(pa) = pa else {
            return Err(acquired);
        };
        for i in 0..chunk {
            pmap_kenter(cursor + i * PAGE_SIZE, pa + i * PAGE_SIZE, Prot::READ | Prot::WRITE);
        }
        acquired.push((pa, chunk));
        cursor += chunk * PAGE_SIZE;
        left -= chunk;
    }
    Ok(acquired)
}

fn uncover(va: Vaddr, acquired: &[(Paddr, usize)]) {
    let npages: usize = acquired.iter().map(|&(_, n)| n).sum();
    pmap_kremove(va, npages);
    for &(pa, _) in acquired {
        pm_free(pa);
    }
}

/// Allocate `size` bytes (rounded up to whole pages) of mapped kernel
/// memory.
pub fn kmem_alloc(size: usize) -> Result<Vaddr> {
    let size = page_align_up(size);
    let mut va = 0;
    vmem_alloc(size, &mut va)?;
    match cover(va, size / PAGE_SIZE) {
        Ok(acquired) => {
            runs().lock().insert(va, acquired);
            Ok(va)
        }
        Err(partial) => {
            uncover(va, &partial);
            vmem_free(va, size);
            Err(Errno::NoMem)
        }
    }
}

/// Free memory obtained from [`kmem_alloc`].
pub fn kmem_free(va: Vaddr, size: usize) {
    let size = page_align_up(size);
    let acquired = runs().lock().remove(&va).expect("freeing unknown kmem allocation");
    uncover(va, &acquired);
    vmem_free(va, size);
}

/// A kernel thread stack: `KSTACK_PAGES` mapped pages above an unmapped
/// guard page. The stack grows down towards the guard.
#[derive(Debug)]
pub struct KStack {
    /// Base of the whole reservation (the guard page).
    reservation: Vaddr,
    backing: Vec<(Paddr, usize)>,
}

impl KStack {
    pub fn alloc() -> Result<KStack> {
        let total = (KSTACK_PAGES + 1) * PAGE_SIZE;
        let mut reservation = 0;
        vmem_alloc(total, &mut reservation)?;
        let base = reservation + PAGE_SIZE;
        match cover(base, KSTACK_PAGES) {
            Ok(backing) => Ok(KStack { reservation, backing }),
            Err(partial) => {
                uncover(base, &partial);
                vmem_free(reservation, total);
                Err(Errno::NoMem)
            }
        }
    }

    /// Lowest mapped address. Anything below (the guard page) faults.
    pub fn base(&self) -> Vaddr {
        self.reservation + PAGE_SIZE
    }

    /// Initial stack pointer: one past the highest mapped byte, aligned.
    pub fn top(&self) -> Vaddr {
        self.base() + KSTACK_PAGES * PAGE_SIZE
    }

    /// True if `va` hit the guard page, i.e. the stack overflowed.
    pub fn guard_hit(&self, va: Vaddr) -> bool {
        va >= self.reservation && va < self.base()
    }
}

impl Drop for KStack {
    fn drop(&mut self) {
        uncover(self.base(), &self.backing);
        vmem_free(self.reservation, (KSTACK_PAGES + 1) * PAGE_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmap::pmap_kernel;

    fn boot() {
        crate::testutil::boot();
    }

    #[test]
    fn kmem_alloc_maps_every_page() {
        boot();
        let va = kmem_alloc(5 * PAGE_SIZE).unwrap();
        for i in 0..5 {
            assert!(pmap_kernel().extract(va + i * PAGE_SIZE).is_ok());
        }
        kmem_free(va, 5 * PAGE_SIZE);
        assert!(pmap_kernel().extract(va).is_err());
    }

    #[test]
    fn kstack_leaves_the_guard_unmapped() {
        boot();
        let stack = KStack::alloc().unwrap();
        assert_eq!(stack.top() - stack.base(), KSTACK_PAGES * PAGE_SIZE);
        assert!(pmap_kernel().extract(stack.base()).is_ok());
        assert!(pmap_kernel().extract(stack.top() - 1).is_ok());
        assert!(pmap_kernel().extract(stack.base() - 1).is_err());
        assert!(stack.guard_hit(stack.base() - 8));
        assert!(!stack.guard_hit(stack.base()));
    }
}
