//! Kernel virtual address allocator.
//!
//! A boundary-tag interval allocator: free spans are kept coalesced and
//! indexed by start address, allocations are tracked so that a free can be
//! validated against its original span. Allocation policy is best-fit and
//! the quantum is PAGESIZE.

use alloc::collections::BTreeMap;

use spinning_top::Spinlock;

use crate::config::PAGE_SIZE;
use crate::{Errno, Result, Vaddr};

pub struct Vmem {
    name: &'static str,
    quantum: usize,
    /// Coalesced free spans, start -> length.
    free: BTreeMap<usize, usize>,
    /// Live allocations, start -> length.
    busy: BTreeMap<usize, usize>,
}

impl Vmem {
    pub const fn new(name: &'static str, quantum: usize) -> Self {
        Vmem { name, quantum, free: BTreeMap::new(), busy: BTreeMap::new() }
    }

    fn roundup(&self, size: usize) -> usize {
        (size + self.quantum - 1) & !(self.quantum - 1)
    }

    /// Donate the span `[addr, addr + size)` to the arena.
    pub fn add(&mut self, addr: Vaddr, size: usize) {
        assert!(size > 0 && addr % self.quantum == 0 && size % self.quantum == 0);
        self.insert_free(addr, size);
    }

    /// Allocate `size` bytes (rounded up to the quantum) from the smallest
    /// free span that fits.
    pub fn alloc(&mut self, size: usize) -> Result<Vaddr> {
        let size = self.roundup(size);
        if size == 0 {
            return Err(Errno::Inval);
        }
        let (&start, &len) = self
            .free
            .iter()
            .filter(|&(_, &len)| len >= size)
            .min_by_key(|&(_, &len)| len)
            .ok_or(Errno::NoMem)?;
        self.free.remove(&start);
        if len > size {
            self.free.insert(start + size, len - size);
        }
        self.busy.insert(start, size);
        Ok(start)
    }

    /// Return `[addr, addr + size)` to the arena. The span must exactly match
    /// a previous allocation.
    pub fn free(&mut self, addr: Vaddr, size: usize) {
        let size = self.roundup(size);
        match self.busy.remove(&addr) {
            Some(len) if len == size => self.insert_free(addr, size),
            Some(len) => panic!("vmem {}: freeing {:#x} with size {} != {}", self.name, addr, size, len),
            None => panic!("vmem {}: freeing unallocated span {:#x}", self.name, addr),
        }
    }

    fn insert_free(&mut self, mut addr: Vaddr, mut size: usize) {
        // Merge with the preceding span if adjacent.
        if let Some((&prev, &prev_len)) = self.free.range(..addr).next_back()
            && prev + prev_len == addr
        {
            self.free.remove(&prev);
            addr = prev;
            size += prev_len;
        }
        // Merge with the following span if adjacent.
        if let Some((&next, &next_len)) = self.free.range(addr + size..).next()
            && addr + size == next
        {
            self.free.remove(&next);
            size += next_len;
        }
        self.free.insert(addr, size);
    }

    /// Total bytes currently free.
    pub fn free_bytes(&self) -> usize {
        self.free.values().sum()
    }
}

static KVSPACE: Spinlock<Vmem> = Spinlock::new(Vmem::new("kvspace", PAGE_SIZE));

/// Donate a span of kernel virtual addresses to the global arena.
pub fn vmem_add(addr: Vaddr, size: usize) {
    KVSPACE.lock().add(addr, size);
}

/// Allocate kernel virtual addresses; `*addrp` receives the start.
pub fn vmem_alloc(size: usize, addrp: &mut Vaddr) -> Result<()> {
    *addrp = KVSPACE.lock().alloc(size)?;
    Ok(())
}

/// Return a kernel virtual address span.
pub fn vmem_free(addr: Vaddr, size: usize) {
    KVSPACE.lock().free(addr, size);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_fit_prefers_the_tightest_span() {
        let mut vm = Vmem::new("test", PAGE_SIZE);
        vm.add(0x10000, 8 * PAGE_SIZE);
        vm.add(0x40000, 2 * PAGE_SIZE);
        // The 2-page span is the tightest fit for a 2-page request.
        assert_eq!(vm.alloc(2 * PAGE_SIZE).unwrap(), 0x40000);
        assert_eq!(vm.alloc(2 * PAGE_SIZE).unwrap(), 0x10000);
    }

    #[test]
    fn sizes_round_up_to_the_quantum() {
        let mut vm = Vmem::new("test", PAGE_SIZE);
        vm.add(0x10000, 4 * PAGE_SIZE);
        let a = vm.alloc(1).unwrap();
        let b = vm.alloc(PAGE_SIZE + 1).unwrap();
        assert_eq!(b - a, PAGE_SIZE);
        vm.free(a, 1);
        vm.free(b, PAGE_SIZE + 1);
        assert_eq!(vm.free_bytes(), 4 * PAGE_SIZE);
    }

    #[test]
    fn freed_neighbours_coalesce() {
        let mut vm = Vmem::new("test", PAGE_SIZE);
        vm.add(0x10000, 4 * PAGE_SIZE);
        let a = vm.alloc(PAGE_SIZE).unwrap();
        let b = vm.alloc(PAGE_SIZE).unwrap();
        let c = vm.alloc(2 * PAGE_SIZE).unwrap();
        vm.free(a, PAGE_SIZE);
        vm.free(c, 2 * PAGE_SIZE);
        vm.free(b, PAGE_SIZE);
        // Everything merged back: a single span serves the full arena.
        assert_eq!(vm.alloc(4 * PAGE_SIZE).unwrap(), 0x10000);
    }

    #[test]
    fn exhaustion_reports_enomem() {
        let mut vm = Vmem::new("test", PAGE_SIZE);
        vm.add(0x10000, PAGE_SIZE);
        assert_eq!(vm.alloc(2 * PAGE_SIZE), Err(Errno::NoMem));
    }
}
