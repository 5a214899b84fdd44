//! VM objects: page-indexed containers of resident pages.
//!
//! An object owns at most one page per page-aligned offset. Anonymous and
//! dummy pagers materialize zero-filled pages on demand; device and file
//! backed paging is produced outside the core and only referenced through
//! this interface.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spinning_top::Spinlock;

use crate::physmem::{self, pm_alloc, pm_free};
use crate::pmap::{pmap_copy_page, pmap_zero_page};
use crate::vm::page_aligned;
use crate::{Errno, Paddr, Result};

/// What produces pages for an object when they are not resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerKind {
    /// Zero-filled pages owned by the object.
    Anonymous,
    /// Placeholder pager, also zero-fill; used where a backing store is
    /// required but no real one exists.
    Dummy,
    /// Pages come from device memory; the core cannot produce them.
    Device,
}

struct ObjectInner {
    /// Resident pages ordered by offset.
    pages: BTreeMap<usize, Paddr>,
}

/// Reference-counted collection of resident pages. Dropping the last
/// reference frees every page it owns.
pub struct VmObject {
    kind: PagerKind,
    inner: Spinlock<ObjectInner>,
}

impl VmObject {
    pub fn alloc(kind: PagerKind) -> Arc<VmObject> {
        Arc::new(VmObject { kind, inner: Spinlock::new(ObjectInner { pages: BTreeMap::new() }) })
    }

    pub fn kind(&self) -> PagerKind {
        self.kind
    }

    pub fn npages(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Insert a single page at `offset`. The offset must be page-aligned and
    /// unoccupied.
    pub fn add_page(&self, offset: usize, pa: Paddr) {
        assert!(page_aligned(offset));
        physmem::with_page(pa, |pg| {
            assert_eq!(pg.size, 1, "objects hold single-page runs only");
            assert!(!pg.owned, "page {:#x} already owned by an object", pa);
            pg.owned = true;
            pg.offset = offset;
        });
        let old = self.inner.lock().pages.insert(offset, pa);
        assert!(old.is_none(), "two pages at one object offset");
    }

    /// Resident page at `offset`, if any.
    pub fn find_page(&self, offset: usize) -> Option<Paddr> {
        self.inner.lock().pages.get(&offset).copied()
    }

    /// Drop every resident page whose offset falls in
    /// `[offset, offset + length)`.
    pub fn remove_range(&self, offset: usize, length: usize) {
        let doomed: Vec<(usize, Paddr)> = {
            let inner = self.inner.lock();
            inner.pages.range(offset..offset + length).map(|(&o, &pa)| (o, pa)).collect()
        };
        let mut inner = self.inner.lock();
        for (off, pa) in doomed {
            inner.pages.remove(&off);
            physmem::with_page(pa, |pg| pg.owned = false);
            pm_free(pa);
        }
    }

    /// Materialize the page at `offset` according to the pager kind.
    /// Anonymous and dummy pagers hand out zero-filled pages; device-backed
    /// objects cannot produce pages inside the core.
    pub fn page_in(&self, offset: usize) -> Result<Paddr> {
        match self.kind {
            PagerKind::Anonymous | PagerKind::Dummy => {
                let pa = pm_alloc(1).ok_or(Errno::NoMem)?;
                pmap_zero_page(pa);
                self.add_page(offset, pa);
                Ok(pa)
            }
            PagerKind::Device => Err(Errno::Fault),
        }
    }

    /// Produce a new object holding copies of all resident pages.
    pub fn clone_object(&self) -> Result<Arc<VmObject>> {
        let new = VmObject::alloc(self.kind);
        let pages: Vec<(usize, Paddr)> =
            self.inner.lock().pages.iter().map(|(&o, &pa)| (o, pa)).collect();
        for (offset, src) in pages {
            let dst = pm_alloc(1).ok_or(Errno::NoMem)?;
            pmap_copy_page(src, dst);
            new.add_page(offset, dst);
        }
        Ok(new)
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for (_, pa) in core::mem::take(&mut inner.pages) {
            physmem::with_page(pa, |pg| pg.owned = false);
            pm_free(pa);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::physmem::testmem;

    #[test]
    fn one_page_per_offset() {
        testmem::init();
        let obj = VmObject::alloc(PagerKind::Anonymous);
        let pa = obj.page_in(0).unwrap();
        assert_eq!(obj.find_page(0), Some(pa));
        assert_eq!(obj.find_page(PAGE_SIZE), None);
        assert_eq!(obj.npages(), 1);
    }

    #[test]
    fn anonymous_pager_zero_fills() {
        testmem::init();
        let obj = VmObject::alloc(PagerKind::Anonymous);
        let pa = obj.page_in(3 * PAGE_SIZE).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(crate::pmap::phys_to_virt(pa), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn device_pager_cannot_produce_pages() {
        testmem::init();
        let obj = VmObject::alloc(PagerKind::Device);
        assert_eq!(obj.page_in(0).unwrap_err(), Errno::Fault);
    }

    #[test]
    fn clone_copies_page_contents() {
        testmem::init();
        let obj = VmObject::alloc(PagerKind::Anonymous);
        let pa = obj.page_in(PAGE_SIZE).unwrap();
        unsafe { *crate::pmap::phys_to_virt(pa) = 0x77 };
        let copy = obj.clone_object().unwrap();
        let pa2 = copy.find_page(PAGE_SIZE).unwrap();
        assert_ne!(pa, pa2);
        assert_eq!(unsafe { *crate::pmap::phys_to_virt(pa2) }, 0x77);
        // Writing the copy leaves the original untouched.
        unsafe { *crate::pmap::phys_to_virt(pa2) = 0x11 };
        assert_eq!(unsafe { *crate::pmap::phys_to_virt(pa) }, 0x77);
    }

    #[test]
    fn remove_range_frees_only_the_span() {
        testmem::init();
        let obj = VmObject::alloc(PagerKind::Anonymous);
        obj.page_in(0).unwrap();
        obj.page_in(PAGE_SIZE).unwrap();
        obj.page_in(4 * PAGE_SIZE).unwrap();
        obj.remove_range(0, 2 * PAGE_SIZE);
        assert_eq!(obj.npages(), 1);
        assert!(obj.find_page(4 * PAGE_SIZE).is_some());
    }
}
