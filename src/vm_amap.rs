//! Anonymous memory: anons and amaps.
//!
//! An anon holds exactly one physical page and is the unit of copy-on-write:
//! while more than one reference to it exists, every mapping of its page must
//! be read-only, and a write fault replaces the reference with a copy. An
//! amap is the upper layer: a slot array covering a segment's range, where
//! slot `i` corresponds to the PAGESIZE-aligned offset `i * PAGESIZE`.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spinning_top::Spinlock;

use crate::config::PAGE_SIZE;
use crate::physmem::{pm_alloc, pm_free};
use crate::pmap::{pmap_copy_page, pmap_zero_page};
use crate::{Errno, Paddr, Result};

/// Holder of exactly one physical page. Shared anons (strong count > 1) are
/// the copy-on-write state; the page itself never changes identity during
/// the anon's lifetime.
#[derive(Debug)]
pub struct Anon {
    page: Paddr,
}

impl Anon {
    /// Allocate an anon with a zero-filled page. First touch of anonymous
    /// memory always observes zeroes.
    pub fn alloc() -> Result<Arc<Anon>> {
        let page = pm_alloc(1).ok_or(Errno::NoMem)?;
        pmap_zero_page(page);
        Ok(Arc::new(Anon { page }))
    }

    /// Allocate a fresh anon whose page is a copy of this one's.
    pub fn copy(self: &Arc<Anon>) -> Result<Arc<Anon>> {
        Anon::copy_page(self.page)
    }

    /// Allocate an anon holding a copy of an arbitrary frame; used to
    /// promote an object page into anonymous memory on a private write.
    pub fn copy_page(src: Paddr) -> Result<Arc<Anon>> {
        let page = pm_alloc(1).ok_or(Errno::NoMem)?;
        pmap_copy_page(src, page);
        Ok(Arc::new(Anon { page }))
    }

    pub fn page(&self) -> Paddr {
        self.page
    }

    /// Number of references; more than one means writers must copy first.
    pub fn refcnt(self: &Arc<Anon>) -> usize {
        Arc::strong_count(self)
    }
}

impl Drop for Anon {
    fn drop(&mut self) {
        pm_free(self.page);
    }
}

struct AmapInner {
    /// Per-slot anon reference (`am_anon`).
    anon: Vec<Option<Arc<Anon>>>,
    /// Per-slot back-pointer into the dense used-list (`am_bckptr`).
    bckptr: Vec<usize>,
    /// Dense list of used slot numbers (`am_slot`).
    used: Vec<u32>,
}

/// Slot array of anons covering an anonymous mapping.
///
/// Invariant: `anon[i]` is occupied ⇔ `i` appears in `used` ⇔
/// `used[bckptr[i]] == i`.
pub struct Amap {
    inner: Spinlock<AmapInner>,
}

/// Reference of a segment into an amap: the amap plus the slot offset at
/// which the segment's range begins.
#[derive(Clone)]
pub struct ARef {
    pub amap: Arc<Amap>,
    pub pageoff: usize,
}

impl ARef {
    pub fn new(amap: Arc<Amap>, pageoff: usize) -> Self {
        ARef { amap, pageoff }
    }

    fn slot_of(&self, offset: usize) -> usize {
        self.pageoff + offset / PAGE_SIZE
    }

    /// Anon at byte `offset` within the referenced range.
    pub fn lookup(&self, offset: usize) -> Option<Arc<Anon>> {
        self.amap.get(self.slot_of(offset))
    }

    /// Install `anon` at byte `offset`. Replaces any previous anon there.
    pub fn add(&self, anon: Arc<Anon>, offset: usize) {
        self.amap.set(self.slot_of(offset), anon);
    }

    /// Drop the anon reference at byte `offset`.
    pub fn remove(&self, offset: usize) {
        self.amap.clear(self.slot_of(offset));
    }

    /// Drop `n` consecutive slots starting at byte `offset`.
    pub fn remove_pages(&self, offset: usize, n: usize) {
        for i in 0..n {
            self.amap.clear(self.slot_of(offset) + i);
        }
    }
}

impl Amap {
    /// Allocate an empty amap with capacity for `slots` pages.
    pub fn alloc(slots: usize) -> Arc<Amap> {
        Arc::new(Amap {
            inner: Spinlock::new(AmapInner {
                anon: vec![None; slots],
                bckptr: vec![0; slots],
                used: Vec::new(),
            }),
        })
    }

    /// New amap holding references to the same anons as `aref`, covering
    /// `slots` slots from its start. This is the sharing step of COW: every
    /// anon ends up held twice and therefore write-protected.
    pub fn clone_from(aref: &ARef, slots: usize) -> Arc<Amap> {
        let new = Amap::alloc(slots);
        let inner = aref.amap.inner.lock();
        let mut new_inner = new.inner.lock();
        for i in 0..slots {
            let src = aref.pageoff + i;
            if let Some(anon) = inner.anon.get(src).and_then(|a| a.clone()) {
                new_inner.bckptr[i] = new_inner.used.len();
                new_inner.used.push(i as u32);
                new_inner.anon[i] = Some(anon);
            }
        }
        drop(new_inner);
        new
    }

    pub fn slots(&self) -> usize {
        self.inner.lock().anon.len()
    }

    /// Extend the slot array; segments growing in place (sbrk) rely on it.
    /// Shrinking is done by dropping slot contents, never the array.
    pub fn grow(&self, slots: usize) {
        let mut inner = self.inner.lock();
        if slots > inner.anon.len() {
            inner.anon.resize(slots, None);
            inner.bckptr.resize(slots, 0);
        }
    }

    /// Number of occupied slots.
    pub fn nused(&self) -> usize {
        self.inner.lock().used.len()
    }

    fn get(&self, slot: usize) -> Option<Arc<Anon>> {
        self.inner.lock().anon.get(slot)?.clone()
    }

    fn set(&self, slot: usize, anon: Arc<Anon>) {
        let mut inner = self.inner.lock();
        assert!(slot < inner.anon.len(), "amap slot {} out of range", slot);
        if inner.anon[slot].is_none() {
            inner.bckptr[slot] = inner.used.len();
            inner.used.push(slot as u32);
        }
        inner.anon[slot] = Some(anon);
    }

    fn clear(&self, slot: usize) {
        let mut inner = self.inner.lock();
        if slot >= inner.anon.len() || inner.anon[slot].is_none() {
            return;
        }
        inner.anon[slot] = None;
        let idx = inner.bckptr[slot];
        let last = inner.used.pop().expect("used-list empty with occupied slot");
        if last as usize != slot {
            inner.used[idx] = last;
            inner.bckptr[last as usize] = idx;
        }
    }

    #[cfg(test)]
    fn check_invariant(&self) {
        let inner = self.inner.lock();
        for (i, a) in inner.anon.iter().enumerate() {
            match a {
                Some(_) => assert_eq!(inner.used[inner.bckptr[i]] as usize, i),
                None => assert!(!inner.used.contains(&(i as u32))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physmem::testmem;
    use crate::pmap::phys_to_virt;

    #[test]
    fn anon_zero_filled_and_freed_once() {
        testmem::init();
        let anon = Anon::alloc().unwrap();
        let bytes =
            unsafe { core::slice::from_raw_parts(phys_to_virt(anon.page()), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(anon.refcnt(), 1);
        let shared = anon.clone();
        assert_eq!(anon.refcnt(), 2);
        drop(shared);
        assert_eq!(anon.refcnt(), 1);
    }

    #[test]
    fn anon_copy_duplicates_the_page() {
        testmem::init();
        let anon = Anon::alloc().unwrap();
        unsafe { *phys_to_virt(anon.page()) = 0xaa };
        let copy = anon.copy().unwrap();
        assert_ne!(anon.page(), copy.page());
        assert_eq!(unsafe { *phys_to_virt(copy.page()) }, 0xaa);
        unsafe { *phys_to_virt(copy.page()) = 0xbb };
        assert_eq!(unsafe { *phys_to_virt(anon.page()) }, 0xaa);
    }

    #[test]
    fn amap_slots_track_the_used_list() {
        testmem::init();
        let amap = Amap::alloc(8);
        let aref = ARef::new(amap.clone(), 0);
        for off in [0, 2, 5] {
            aref.add(Anon::alloc().unwrap(), off * PAGE_SIZE);
        }
        amap.check_invariant();
        assert_eq!(amap.nused(), 3);
        assert!(aref.lookup(2 * PAGE_SIZE).is_some());
        aref.remove(2 * PAGE_SIZE);
        amap.check_invariant();
        assert_eq!(amap.nused(), 2);
        assert!(aref.lookup(2 * PAGE_SIZE).is_none());
        assert!(aref.lookup(5 * PAGE_SIZE).is_some());
    }

    #[test]
    fn aref_pageoff_shifts_the_window() {
        testmem::init();
        let amap = Amap::alloc(8);
        let base = ARef::new(amap.clone(), 0);
        let shifted = ARef::new(amap.clone(), 3);
        base.add(Anon::alloc().unwrap(), 3 * PAGE_SIZE);
        assert!(shifted.lookup(0).is_some());
        assert!(base.lookup(3 * PAGE_SIZE).is_some());
    }

    #[test]
    fn clone_shares_anons_for_cow() {
        testmem::init();
        let amap = Amap::alloc(4);
        let aref = ARef::new(amap.clone(), 0);
        let anon = Anon::alloc().unwrap();
        aref.add(anon.clone(), PAGE_SIZE);
        let cloned = Amap::clone_from(&aref, 4);
        cloned.check_invariant();
        let other = ARef::new(cloned, 0).lookup(PAGE_SIZE).unwrap();
        assert_eq!(other.page(), anon.page());
        // Original anon + our handle + the clone's reference.
        assert_eq!(anon.refcnt(), 3);
    }
}
