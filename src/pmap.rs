//! Physical map: per-address-space mapping of virtual pages onto physical
//! frames with protection bits.
//!
//! This is the machine-independent model of the pmap contract. Mappings live
//! in an ordered per-pmap table; the referenced/modified state of a frame is
//! tracked in software on its page descriptor, the way MMUs without hardware
//! ref/mod bits are handled: a fresh mapping is installed "invalid" (not yet
//! referenced) and read-only (not yet modified), and [`pmap_emulate_bits`]
//! upgrades it from the permission-fault path. Page contents are reached
//! through the direct-map window ([`phys_to_virt`]).

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use once_cell::race::OnceBox;
use spinning_top::Spinlock;

use crate::config::{PAGE_SIZE, KERNEL_SPACE_END, KERNEL_SPACE_START, USER_SPACE_END, USER_SPACE_START};
use crate::physmem::{self, PageFlags};
use crate::vm::{Prot, page_aligned};
use crate::{Errno, Paddr, Result, Vaddr};

/// Offset of the direct map: `phys_to_virt(pa) = pa + DMAP_OFFSET`. The
/// boot glue configures it; zero means identity (physical addresses are
/// directly dereferenceable, as on an identity-mapped kernel).
static DMAP_OFFSET: AtomicUsize = AtomicUsize::new(0);

/// Configure the direct-map window. Must happen before any page content is
/// touched through the pmap.
pub fn set_dmap_offset(offset: usize) {
    DMAP_OFFSET.store(offset, Ordering::Release);
}

/// Kernel-virtual alias of the frame at `pa`.
pub fn phys_to_virt(pa: Paddr) -> *mut u8 {
    (pa + DMAP_OFFSET.load(Ordering::Acquire)) as *mut u8
}

const ASID_MAX: u16 = 256;

/// ASID 0 is reserved for the kernel pmap.
struct AsidAllocator {
    next: u16,
    used: [u64; ASID_MAX as usize / 64],
}

impl AsidAllocator {
    const fn new() -> Self {
        AsidAllocator { next: 1, used: [0; ASID_MAX as usize / 64] }
    }

    fn alloc(&mut self) -> Option<u16> {
        let start = self.next;
        let mut asid = start;
        loop {
            let (word, bit) = (asid as usize / 64, asid % 64);
            if self.used[word] & (1 << bit) == 0 {
                self.used[word] |= 1 << bit;
                self.next = if asid + 1 >= ASID_MAX { 1 } else { asid + 1 };
                return Some(asid);
            }
            asid = if asid + 1 >= ASID_MAX { 1 } else { asid + 1 };
            if asid == start {
                return None;
            }
        }
    }

    fn free(&mut self, asid: u16) {
        if asid > 0 && asid < ASID_MAX {
            self.used[asid as usize / 64] &= !(1 << (asid % 64));
        }
    }
}

static ASIDS: Spinlock<AsidAllocator> = Spinlock::new(AsidAllocator::new());

#[derive(Debug, Clone, Copy)]
struct Pte {
    pa: Paddr,
    prot: Prot,
    /// Kernel mappings are wired: always valid, never subject to ref/mod
    /// emulation.
    wired: bool,
}

struct PmapInner {
    pte: BTreeMap<Vaddr, Pte>,
}

/// One address space's mappings.
pub struct Pmap {
    user: bool,
    asid: u16,
    inner: Spinlock<PmapInner>,
}

impl Pmap {
    /// Create a fresh user pmap with no mappings and a newly allocated ASID.
    pub fn new() -> Result<Arc<Pmap>> {
        let asid = ASIDS.lock().alloc().ok_or(Errno::NoMem)?;
        Ok(Arc::new(Pmap { user: true, asid, inner: Spinlock::new(PmapInner { pte: BTreeMap::new() }) }))
    }

    pub fn asid(&self) -> u16 {
        self.asid
    }

    /// Address range served by this pmap.
    pub fn range(&self) -> (Vaddr, Vaddr) {
        if self.user {
            (USER_SPACE_START, USER_SPACE_END)
        } else {
            (KERNEL_SPACE_START, KERNEL_SPACE_END)
        }
    }

    pub fn contains(&self, va: Vaddr) -> bool {
        let (start, end) = self.range();
        va >= start && va < end
    }

    fn insert(&self, va: Vaddr, pa: Paddr, prot: Prot, wired: bool) {
        assert!(page_aligned(va) && page_aligned(pa));
        assert!(self.contains(va), "address {:#x} outside pmap range", va);
        self.inner.lock().pte.insert(va, Pte { pa, prot, wired });
    }

    /// Associate `va` with the frame at `pa`. The mapping starts out not
    /// referenced and not modified; the first access upgrades it through
    /// [`pmap_emulate_bits`].
    pub fn enter(&self, va: Vaddr, pa: Paddr, prot: Prot) {
        self.insert(va, pa, prot, false);
    }

    /// Remove all mappings within `[start, end)`.
    pub fn remove(&self, start: Vaddr, end: Vaddr) {
        let mut inner = self.inner.lock();
        let doomed: alloc::vec::Vec<Vaddr> = inner.pte.range(start..end).map(|(&va, _)| va).collect();
        for va in doomed {
            inner.pte.remove(&va);
        }
    }

    /// Change the protection of every mapping within `[start, end)`.
    pub fn protect(&self, start: Vaddr, end: Vaddr, prot: Prot) {
        let mut inner = self.inner.lock();
        for (_, pte) in inner.pte.range_mut(start..end) {
            pte.prot = prot;
        }
    }

    /// Look up the frame backing `va`. Returns the page-aligned physical
    /// address.
    pub fn extract(&self, va: Vaddr) -> Result<Paddr> {
        let inner = self.inner.lock();
        inner
            .pte
            .get(&crate::vm::page_align_down(va))
            .map(|pte| pte.pa)
            .ok_or(Errno::Inval)
    }

    /// The protection bits the mapping at `va` was entered with.
    pub fn prot_of(&self, va: Vaddr) -> Option<Prot> {
        self.inner.lock().pte.get(&crate::vm::page_align_down(va)).map(|p| p.prot)
    }

    /// The hardware view of an access: would `access` at `va` trap?
    ///
    /// True when the mapping is absent, the access exceeds its protection,
    /// or the software ref/mod bits have not been primed yet.
    pub fn would_fault(&self, va: Vaddr, access: Prot) -> bool {
        let inner = self.inner.lock();
        let Some(pte) = inner.pte.get(&crate::vm::page_align_down(va)) else {
            return true;
        };
        if !pte.prot.contains(access) {
            return true;
        }
        if pte.wired {
            return false;
        }
        let (referenced, modified) = physmem::with_page(pte.pa, |pg| {
            (pg.flags.contains(PageFlags::REFERENCED), pg.flags.contains(PageFlags::MODIFIED))
        })
        .unwrap_or((true, true));
        !referenced || (access.contains(Prot::WRITE) && !modified)
    }

    /// Update software referenced/modified bits from a permission fault.
    ///
    /// Returns `Ok(())` when the access was legal and the bits are now
    /// primed, `Errno::Acces` when the mapping forbids the access, and
    /// `Errno::Inval` when `va` has no mapping at all.
    pub fn emulate_bits(&self, va: Vaddr, access: Prot) -> Result<()> {
        let inner = self.inner.lock();
        let pte = inner.pte.get(&crate::vm::page_align_down(va)).ok_or(Errno::Inval)?;
        if !pte.prot.contains(access) {
            return Err(Errno::Acces);
        }
        physmem::with_page(pte.pa, |pg| {
            pg.flags.insert(PageFlags::REFERENCED);
            if access.contains(Prot::WRITE) {
                pg.flags.insert(PageFlags::MODIFIED);
            }
        });
        Ok(())
    }
}

impl Drop for Pmap {
    fn drop(&mut self) {
        if self.user {
            ASIDS.lock().free(self.asid);
        }
    }
}

static PMAP_KERNEL: OnceBox<Arc<Pmap>> = OnceBox::new();
static ACTIVE_USER: Spinlock<Option<Arc<Pmap>>> = Spinlock::new(None);

/// The singleton kernel pmap.
pub fn pmap_kernel() -> &'static Arc<Pmap> {
    PMAP_KERNEL.get_or_init(|| {
        Box::new(Arc::new(Pmap {
            user: false,
            asid: 0,
            inner: Spinlock::new(PmapInner { pte: BTreeMap::new() }),
        }))
    })
}

/// Set up the kernel pmap. Idempotent beyond the first call.
pub fn bootstrap() {
    let _ = pmap_kernel();
}

/// Install `pmap` as the active user pmap on the CPU.
pub fn pmap_activate(pmap: Option<Arc<Pmap>>) {
    *ACTIVE_USER.lock() = pmap;
}

/// The pmap serving `va`: the kernel pmap for kernel addresses, otherwise
/// the active user pmap iff `va` lies in its range.
pub fn pmap_lookup(va: Vaddr) -> Option<Arc<Pmap>> {
    if pmap_kernel().contains(va) {
        return Some(pmap_kernel().clone());
    }
    let active = ACTIVE_USER.lock();
    active.as_ref().filter(|pm| pm.contains(va)).cloned()
}

/// Enter a permanent, globally visible kernel mapping.
pub fn pmap_kenter(va: Vaddr, pa: Paddr, prot: Prot) {
    pmap_kernel().insert(va, pa, prot, true);
}

/// Remove `n` pages of kernel mappings starting at `va`.
pub fn pmap_kremove(va: Vaddr, n: usize) {
    pmap_kernel().remove(va, va + n * PAGE_SIZE);
}

/// Zero the frame at `pa` through its kernel alias.
pub fn pmap_zero_page(pa: Paddr) {
    unsafe { core::ptr::write_bytes(phys_to_virt(pa), 0, PAGE_SIZE) };
}

/// Copy the frame at `src` onto the frame at `dst` through kernel aliases.
pub fn pmap_copy_page(src: Paddr, dst: Paddr) {
    unsafe { core::ptr::copy_nonoverlapping(phys_to_virt(src), phys_to_virt(dst), PAGE_SIZE) };
}

pub fn pmap_is_referenced(pa: Paddr) -> bool {
    physmem::with_page(pa, |pg| pg.flags.contains(PageFlags::REFERENCED)).unwrap_or(false)
}

pub fn pmap_is_modified(pa: Paddr) -> bool {
    physmem::with_page(pa, |pg| pg.flags.contains(PageFlags::MODIFIED)).unwrap_or(false)
}

pub fn pmap_set_referenced(pa: Paddr) {
    physmem::with_page(pa, |pg| pg.flags.insert(PageFlags::REFERENCED));
}

pub fn pmap_set_modified(pa: Paddr) {
    physmem::with_page(pa, |pg| pg.flags.insert(PageFlags::MODIFIED));
}

/// Clear the referenced bit; the next access will fault back into
/// [`Pmap::emulate_bits`]. Returns the previous state.
pub fn pmap_clear_referenced(pa: Paddr) -> bool {
    physmem::with_page(pa, |pg| {
        let was = pg.flags.contains(PageFlags::REFERENCED);
        pg.flags.remove(PageFlags::REFERENCED);
        was
    })
    .unwrap_or(false)
}

/// Clear the modified bit; the next write will fault back into
/// [`Pmap::emulate_bits`]. Returns the previous state.
pub fn pmap_clear_modified(pa: Paddr) -> bool {
    physmem::with_page(pa, |pg| {
        let was = pg.flags.contains(PageFlags::MODIFIED);
        pg.flags.remove(PageFlags::MODIFIED);
        was
    })
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physmem::pm_alloc;

    #[test]
    fn enter_then_extract_roundtrips() {
        crate::physmem::testmem::init();
        let pm = Pmap::new().unwrap();
        let pa = pm_alloc(1).unwrap();
        let va = 0x1000_0000;
        pm.enter(va, pa, Prot::READ | Prot::WRITE);
        assert_eq!(pm.extract(va).unwrap(), pa);
        assert_eq!(pm.extract(va + 123).unwrap(), pa);
        assert!(pm.extract(va + PAGE_SIZE).is_err());
    }

    #[test]
    fn ref_mod_emulation_primes_access() {
        crate::physmem::testmem::init();
        let pm = Pmap::new().unwrap();
        let pa = pm_alloc(1).unwrap();
        let va = 0x1200_0000;
        pm.enter(va, pa, Prot::READ | Prot::WRITE);

        // Fresh mapping: reads and writes both trap until emulated.
        assert!(pm.would_fault(va, Prot::READ));
        pm.emulate_bits(va, Prot::READ).unwrap();
        assert!(!pm.would_fault(va, Prot::READ));
        assert!(pm.would_fault(va, Prot::WRITE));
        pm.emulate_bits(va, Prot::WRITE).unwrap();
        assert!(!pm.would_fault(va, Prot::WRITE));
        assert!(pmap_is_referenced(pa) && pmap_is_modified(pa));

        // Clearing the modified bit re-arms the write fault.
        assert!(pmap_clear_modified(pa));
        assert!(pm.would_fault(va, Prot::WRITE));
        assert!(!pm.would_fault(va, Prot::READ));
    }

    #[test]
    fn emulate_bits_reports_errors() {
        crate::physmem::testmem::init();
        let pm = Pmap::new().unwrap();
        let pa = pm_alloc(1).unwrap();
        let va = 0x1300_0000;
        pm.enter(va, pa, Prot::READ);
        assert_eq!(pm.emulate_bits(va, Prot::WRITE), Err(Errno::Acces));
        assert_eq!(pm.emulate_bits(va + PAGE_SIZE, Prot::READ), Err(Errno::Inval));
    }

    #[test]
    fn protect_narrows_existing_mappings() {
        crate::physmem::testmem::init();
        let pm = Pmap::new().unwrap();
        let pa = pm_alloc(1).unwrap();
        let va = 0x1400_0000;
        pm.enter(va, pa, Prot::READ | Prot::WRITE);
        pm.protect(va, va + PAGE_SIZE, Prot::READ);
        assert_eq!(pm.prot_of(va), Some(Prot::READ));
        assert!(pm.would_fault(va, Prot::WRITE));
    }

    #[test]
    fn zero_and_copy_go_through_the_direct_map() {
        crate::physmem::testmem::init();
        let src = pm_alloc(1).unwrap();
        let dst = pm_alloc(1).unwrap();
        unsafe {
            core::ptr::write_bytes(phys_to_virt(src), 0x5a, PAGE_SIZE);
        }
        pmap_copy_page(src, dst);
        let byte = unsafe { *phys_to_virt(dst).add(17) };
        assert_eq!(byte, 0x5a);
        pmap_zero_page(dst);
        let byte = unsafe { *phys_to_virt(dst).add(17) };
        assert_eq!(byte, 0);
    }

    #[test]
    fn asids_are_unique_and_recycled() {
        let mut asids = AsidAllocator::new();
        let a = asids.alloc().unwrap();
        let b = asids.alloc().unwrap();
        assert_ne!(a, b);
        assert_ne!(a, 0);
        asids.free(a);
        // The freed ASID comes around again once the space wraps.
        let mut seen = false;
        for _ in 0..ASID_MAX {
            if asids.alloc() == Some(a) {
                seen = true;
                break;
            }
        }
        assert!(seen);
    }
}
