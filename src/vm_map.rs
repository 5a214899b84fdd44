//! VM maps: per-address-space ordered sets of disjoint segments, fault
//! handling and copy-on-write cloning.
//!
//! A segment is backed either by an amap of anons (anonymous memory) or by
//! a VM object, optionally with an amap overlay holding privately written
//! pages in front of the read-only object. A mapping is writable in the
//! pmap only when the segment allows writes and the backing anon is not
//! shared; everything else is entered read-only and upgraded by the write
//! fault that copies the anon.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use once_cell::race::OnceBox;
use spinning_top::Spinlock;

use crate::config::{PAGE_SIZE, KERNEL_SPACE_END, KERNEL_SPACE_START, USER_SPACE_END, USER_SPACE_START};
use crate::pmap::{Pmap, phys_to_virt, pmap_kernel};
use crate::rwlock::RwLock;
use crate::vm::{Prot, VmFlags, page_align_down, page_align_up, page_aligned};
use crate::vm_amap::{Amap, Anon, ARef};
use crate::vm_object::{PagerKind, VmObject};
use crate::{Errno, Result, Vaddr};

/// Backing store of a segment.
pub enum Backing {
    /// Anonymous memory: an amap window of anons.
    Anon(ARef),
    /// Pager-backed, with an optional amap overlay holding the privately
    /// copied pages of a PRIVATE mapping.
    Object { object: Arc<VmObject>, offset: usize, copy: Option<ARef> },
}

/// A mapped range `[start, end)` with its protection and backing.
pub struct VmSegment {
    pub start: Vaddr,
    pub end: Vaddr,
    pub prot: Prot,
    pub flags: VmFlags,
    backing: Backing,
}

impl VmSegment {
    fn slots(&self) -> usize {
        (self.end - self.start) / PAGE_SIZE
    }
}

struct MapInner {
    segments: BTreeMap<Vaddr, VmSegment>,
}

/// One address space: a pmap plus the ordered segment set, guarded by a
/// sleepable reader/writer lock.
pub struct VmMap {
    pmap: Arc<Pmap>,
    start: Vaddr,
    end: Vaddr,
    inner: RwLock<MapInner>,
}

/// An anon referenced by more than the amap and the caller's own handle is
/// shared between address spaces, so writers must copy first.
fn anon_shared(anon: &Arc<Anon>) -> bool {
    Arc::strong_count(anon) > 2
}

impl VmMap {
    /// Fresh user map over a new pmap.
    pub fn new() -> Result<Arc<VmMap>> {
        let pmap = Pmap::new()?;
        Ok(Arc::new(VmMap {
            pmap,
            start: USER_SPACE_START,
            end: USER_SPACE_END,
            inner: RwLock::new(MapInner { segments: BTreeMap::new() }),
        }))
    }

    pub fn pmap(&self) -> &Arc<Pmap> {
        &self.pmap
    }

    pub fn bounds(&self) -> (Vaddr, Vaddr) {
        (self.start, self.end)
    }

    pub fn nsegments(&self) -> usize {
        self.inner.read().segments.len()
    }

    /// Range of the segment containing `va`.
    pub fn segment_span(&self, va: Vaddr) -> Option<(Vaddr, Vaddr)> {
        let inner = self.inner.read();
        locate(&inner, va).map(|seg| (seg.start, seg.end))
    }

    /// Protection of the segment containing `va`.
    pub fn segment_prot(&self, va: Vaddr) -> Option<Prot> {
        let inner = self.inner.read();
        locate(&inner, va).map(|seg| seg.prot)
    }

    /// Find a gap of `length` bytes at or above `hint`, falling back to the
    /// lowest sufficient gap.
    pub fn findspace(&self, hint: Vaddr, length: usize) -> Result<Vaddr> {
        let inner = self.inner.read();
        self.findspace_locked(&inner, hint, length)
    }

    fn findspace_locked(&self, inner: &MapInner, hint: Vaddr, length: usize) -> Result<Vaddr> {
        let length = page_align_up(length);
        if length == 0 {
            return Err(Errno::Inval);
        }
        let hint = page_align_up(hint).max(self.start);
        if let Some(addr) = findspace_from(inner, hint, length, self.end) {
            return Ok(addr);
        }
        if hint > self.start
            && let Some(addr) = findspace_from(inner, self.start, length, self.end)
        {
            return Ok(addr);
        }
        Err(Errno::NoMem)
    }

    /// Carve out a new segment. With `FIXED` the range is exactly
    /// `[hint, hint + length)` and any overlap fails with `ENOMEM`;
    /// otherwise the hint only directs the gap search.
    pub fn alloc_segment(
        &self,
        hint: Vaddr,
        length: usize,
        prot: Prot,
        flags: VmFlags,
    ) -> Result<Vaddr> {
        let length = page_align_up(length);
        if length == 0 || !exactly_one_sharing(flags) {
            return Err(Errno::Inval);
        }
        let backing = if flags.contains(VmFlags::ANON) {
            Backing::Anon(ARef::new(Amap::alloc(length / PAGE_SIZE), 0))
        } else {
            Backing::Object { object: VmObject::alloc(PagerKind::Anonymous), offset: 0, copy: None }
        };
        self.insert_segment(hint, length, prot, flags, backing)
    }

    /// Map `object` starting at byte `offset`; used by layers that bring
    /// their own pager (devices, files).
    pub fn alloc_segment_object(
        &self,
        hint: Vaddr,
        length: usize,
        prot: Prot,
        flags: VmFlags,
        object: Arc<VmObject>,
        offset: usize,
    ) -> Result<Vaddr> {
        let length = page_align_up(length);
        if length == 0 || !exactly_one_sharing(flags) || !page_aligned(offset) {
            return Err(Errno::Inval);
        }
        self.insert_segment(hint, length, prot, flags, Backing::Object { object, offset, copy: None })
    }

    fn insert_segment(
        &self,
        hint: Vaddr,
        length: usize,
        prot: Prot,
        flags: VmFlags,
        backing: Backing,
    ) -> Result<Vaddr> {
        let mut inner = self.inner.write();
        let start = if flags.contains(VmFlags::FIXED) {
            if !page_aligned(hint) {
                return Err(Errno::Inval);
            }
            if hint < self.start || hint.checked_add(length).is_none_or(|end| end > self.end) {
                return Err(Errno::NoMem);
            }
            if overlaps(&inner, hint, hint + length) {
                return Err(Errno::NoMem);
            }
            hint
        } else {
            self.findspace_locked(&inner, hint, length)?
        };
        let seg = VmSegment { start, end: start + length, prot, flags, backing };
        inner.segments.insert(start, seg);
        log::debug!(target: "vm", "mapped segment {:#x}..{:#x} prot={:?}", start, start + length, prot);
        Ok(start)
    }

    /// Change the protection of whole segments inside `[start, end)`.
    /// Existing mappings are dropped and re-entered lazily so the COW
    /// write-protection rule is re-derived on the next fault.
    pub fn protect(&self, start: Vaddr, end: Vaddr, prot: Prot) -> Result<()> {
        if !page_aligned(start) || !page_aligned(end) || start >= end {
            return Err(Errno::Inval);
        }
        let mut inner = self.inner.write();
        let affected: Vec<Vaddr> = inner
            .segments
            .values()
            .filter(|seg| seg.start < end && start < seg.end)
            .map(|seg| {
                if start <= seg.start && seg.end <= end {
                    Ok(seg.start)
                } else {
                    // Splitting segments on a partial protect is not
                    // supported.
                    Err(Errno::NotSup)
                }
            })
            .collect::<Result<_>>()?;
        if affected.is_empty() {
            return Err(Errno::NoMem);
        }
        for key in affected {
            if let Some(seg) = inner.segments.get_mut(&key) {
                seg.prot = prot;
            }
        }
        self.pmap.remove(start, end);
        Ok(())
    }

    /// Move the end of the segment starting at `seg_start`. Growth fails
    /// with `ENOMEM` when it would run into the next segment or out of the
    /// map; shrinking drops the no-longer-covered pages.
    pub fn resize(&self, seg_start: Vaddr, new_end: Vaddr) -> Result<()> {
        if !page_aligned(new_end) {
            return Err(Errno::Inval);
        }
        let mut inner = self.inner.write();
        let next_start = inner.segments.range(seg_start + 1..).next().map(|(&s, _)| s);
        let seg = inner.segments.get_mut(&seg_start).ok_or(Errno::Inval)?;
        if new_end <= seg.start {
            return Err(Errno::Inval);
        }
        let old_end = seg.end;
        if new_end > old_end {
            if next_start.is_some_and(|next| new_end > next) || new_end > self.end {
                return Err(Errno::NoMem);
            }
            if let Backing::Anon(aref) = &seg.backing {
                aref.amap.grow(aref.pageoff + (new_end - seg.start) / PAGE_SIZE);
            }
            seg.end = new_end;
            return Ok(());
        }
        if new_end < old_end {
            let span_off = new_end - seg.start;
            let npages = (old_end - new_end) / PAGE_SIZE;
            match &mut seg.backing {
                Backing::Anon(aref) => aref.remove_pages(span_off, npages),
                Backing::Object { object, offset, copy } => {
                    object.remove_range(*offset + span_off, old_end - new_end);
                    if let Some(aref) = copy {
                        aref.remove_pages(span_off, npages);
                    }
                }
            }
            seg.end = new_end;
            self.pmap.remove(new_end, old_end);
        }
        Ok(())
    }

    /// Unmap the segment whose range is exactly `[start, start + length)`.
    pub fn remove_segment(&self, start: Vaddr, length: usize) -> Result<()> {
        let mut inner = self.inner.write();
        let seg = locate(&inner, start).ok_or(Errno::Inval)?;
        if seg.start != start || seg.end != start + page_align_up(length) {
            // Partial unmaps would require splitting; whole segments only.
            return Err(Errno::NotSup);
        }
        let (seg_start, seg_end) = (seg.start, seg.end);
        inner.segments.remove(&seg_start);
        self.pmap.remove(seg_start, seg_end);
        Ok(())
    }

    /// Deep-clone the address space for `fork`.
    ///
    /// Shared segments reference the same backing. Private anonymous
    /// segments share the source amap (held twice afterwards), which is
    /// what makes later writes on either side copy the touched anon; the
    /// parent's materialized mappings are dropped so the next access
    /// re-derives its write protection.
    pub fn clone_map(&self) -> Result<Arc<VmMap>> {
        let new = VmMap::new()?;
        let inner = self.inner.write();
        let mut new_inner = new.inner.write();
        for seg in inner.segments.values() {
            let shared = seg.flags.contains(VmFlags::SHARED);
            let backing = match &seg.backing {
                Backing::Anon(aref) => Backing::Anon(aref.clone()),
                Backing::Object { object, offset, copy } => Backing::Object {
                    object: object.clone(),
                    offset: *offset,
                    copy: copy.clone(),
                },
            };
            if !shared {
                self.pmap.remove(seg.start, seg.end);
            }
            new_inner.segments.insert(
                seg.start,
                VmSegment { start: seg.start, end: seg.end, prot: seg.prot, flags: seg.flags, backing },
            );
        }
        drop(new_inner);
        Ok(new)
    }

    /// Handle a page fault at `va` with the given access. On success the
    /// pmap has a mapping that satisfies the access; errors surface as
    /// SIGSEGV in the trap layer.
    pub fn page_fault(&self, va: Vaddr, access: Prot) -> Result<()> {
        if va < self.start || va >= self.end {
            return Err(Errno::Fault);
        }
        let mut inner = self.inner.write();
        let MapInner { segments } = &mut *inner;
        let seg = locate_mut(segments, va).ok_or(Errno::Fault)?;
        if !seg.prot.contains(access) {
            return Err(Errno::Acces);
        }
        let vap = page_align_down(va);
        let off = vap - seg.start;
        let private = seg.flags.contains(VmFlags::PRIVATE);
        let write = access.contains(Prot::WRITE);
        let slots = seg.slots();
        match &mut seg.backing {
            Backing::Anon(aref) => {
                self.fault_anon(aref, slots, off, vap, seg.prot, private, write)?;
            }
            Backing::Object { object, offset, copy } => {
                // A private segment serves faults from its overlay first.
                if private
                    && let Some(aref) = copy.as_mut()
                    && aref.lookup(off).is_some()
                {
                    self.fault_anon(aref, slots, off, vap, seg.prot, private, write)?;
                    return Ok(());
                }
                let obj_off = *offset + off;
                let page = match object.find_page(obj_off) {
                    Some(page) => page,
                    None => object.page_in(obj_off)?,
                };
                if private && write {
                    // Promote the object page into an anon copy; the object
                    // itself stays untouched.
                    let anon = Anon::copy_page(page)?;
                    let aref =
                        copy.get_or_insert_with(|| ARef::new(Amap::alloc(slots), 0));
                    aref.add(anon.clone(), off);
                    self.pmap.enter(vap, anon.page(), seg.prot);
                } else {
                    let prot =
                        if private { seg.prot.without_write() } else { seg.prot };
                    self.pmap.enter(vap, page, prot);
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn fault_anon(
        &self,
        aref: &mut ARef,
        slots: usize,
        off: usize,
        vap: Vaddr,
        seg_prot: Prot,
        private: bool,
        write: bool,
    ) -> Result<()> {
        // A private mapping whose amap is shared with another address space
        // first gets its own amap referencing the same anons.
        if private && Arc::strong_count(&aref.amap) > 1 {
            *aref = ARef::new(Amap::clone_from(aref, slots), 0);
        }
        let mut anon = match aref.lookup(off) {
            Some(anon) => anon,
            None => {
                let anon = Anon::alloc()?;
                aref.add(anon.clone(), off);
                anon
            }
        };
        if write && anon_shared(&anon) {
            let copy = anon.copy()?;
            aref.add(copy.clone(), off);
            anon = copy;
        }
        let prot = if private && anon_shared(&anon) { seg_prot.without_write() } else { seg_prot };
        self.pmap.enter(vap, anon.page(), prot);
        Ok(())
    }

    /// Copy `src` into this map's memory at `va`, faulting pages in as
    /// needed. Any failure reports `EFAULT`.
    pub fn copyout(&self, src: &[u8], va: Vaddr) -> Result<()> {
        self.copy_pages(va, src.len(), Prot::WRITE, |pa, done, len| unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr().add(done), phys_to_virt(pa), len);
        })
    }

    /// Copy `dst.len()` bytes from this map's memory at `va`.
    pub fn copyin(&self, va: Vaddr, dst: &mut [u8]) -> Result<()> {
        self.copy_pages(va, dst.len(), Prot::READ, |pa, done, len| unsafe {
            core::ptr::copy_nonoverlapping(phys_to_virt(pa), dst.as_mut_ptr().add(done), len);
        })
    }

    fn copy_pages(
        &self,
        va: Vaddr,
        len: usize,
        access: Prot,
        mut chunk: impl FnMut(crate::Paddr, usize, usize),
    ) -> Result<()> {
        let mut done = 0;
        while done < len {
            let cur = va + done;
            let page_rest = PAGE_SIZE - (cur & (PAGE_SIZE - 1));
            let n = page_rest.min(len - done);
            self.page_fault(cur, access).map_err(|_| Errno::Fault)?;
            let pa = self.pmap.extract(cur).map_err(|_| Errno::Fault)?;
            chunk(pa + (cur & (PAGE_SIZE - 1)), done, n);
            done += n;
        }
        Ok(())
    }
}

fn exactly_one_sharing(flags: VmFlags) -> bool {
    flags.contains(VmFlags::SHARED) != flags.contains(VmFlags::PRIVATE)
}

fn locate<'a>(inner: &'a MapInner, va: Vaddr) -> Option<&'a VmSegment> {
    inner.segments.range(..=va).next_back().map(|(_, seg)| seg).filter(|seg| va < seg.end)
}

fn locate_mut(segments: &mut BTreeMap<Vaddr, VmSegment>, va: Vaddr) -> Option<&mut VmSegment> {
    segments.range_mut(..=va).next_back().map(|(_, seg)| seg).filter(|seg| va < seg.end)
}

fn overlaps(inner: &MapInner, start: Vaddr, end: Vaddr) -> bool {
    inner.segments.values().any(|seg| seg.start < end && start < seg.end)
}

fn findspace_from(inner: &MapInner, from: Vaddr, length: usize, limit: Vaddr) -> Option<Vaddr> {
    let mut candidate = from;
    for seg in inner.segments.values() {
        if seg.end <= candidate {
            continue;
        }
        if seg.start >= candidate && seg.start - candidate >= length {
            break;
        }
        candidate = seg.end;
    }
    (candidate.checked_add(length)? <= limit).then_some(candidate)
}

static KERNEL_MAP: OnceBox<Arc<VmMap>> = OnceBox::new();
static ACTIVE_MAP: Spinlock<Option<Arc<VmMap>>> = Spinlock::new(None);

/// The singleton kernel map, spanning the kernel virtual range over the
/// kernel pmap.
pub fn vm_map_kernel() -> &'static Arc<VmMap> {
    KERNEL_MAP.get_or_init(|| {
        Box::new(Arc::new(VmMap {
            pmap: pmap_kernel().clone(),
            start: KERNEL_SPACE_START,
            end: KERNEL_SPACE_END,
            inner: RwLock::new(MapInner { segments: BTreeMap::new() }),
        }))
    })
}

pub fn bootstrap() {
    let _ = vm_map_kernel();
}

/// Install `map` as the active user address space.
pub fn vm_map_activate(map: Option<Arc<VmMap>>) {
    crate::pmap::pmap_activate(map.as_ref().map(|m| m.pmap.clone()));
    *ACTIVE_MAP.lock() = map;
}

/// The active user map, if any.
pub fn vm_map_user() -> Option<Arc<VmMap>> {
    ACTIVE_MAP.lock().clone()
}

/// Map serving `va`: the kernel map for kernel addresses, the active user
/// map otherwise.
pub fn vm_map_lookup(va: Vaddr) -> Option<Arc<VmMap>> {
    let kernel = vm_map_kernel();
    let (ks, ke) = kernel.bounds();
    if va >= ks && va < ke {
        return Some(kernel.clone());
    }
    vm_map_user().filter(|m| {
        let (s, e) = m.bounds();
        va >= s && va < e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physmem::testmem;

    const RW: Prot = Prot::READ.union(Prot::WRITE);

    fn anon_private() -> VmFlags {
        VmFlags::ANON | VmFlags::PRIVATE
    }

    fn write_byte(map: &VmMap, va: Vaddr, byte: u8) {
        map.page_fault(va, Prot::WRITE).unwrap();
        let pa = map.pmap().extract(va).unwrap();
        unsafe { *phys_to_virt(pa).add(va & (PAGE_SIZE - 1)) = byte };
    }

    fn read_byte(map: &VmMap, va: Vaddr) -> u8 {
        map.page_fault(va, Prot::READ).unwrap();
        let pa = map.pmap().extract(va).unwrap();
        unsafe { *phys_to_virt(pa).add(va & (PAGE_SIZE - 1)) }
    }

    #[test]
    fn findspace_and_fixed_insertion() {
        testmem::init();
        let map = VmMap::new().unwrap();
        let hint = 0x1000_0000;
        let a = map.findspace(hint, PAGE_SIZE).unwrap();
        assert_eq!(a, hint);
        let got = map
            .alloc_segment(a, 4 * PAGE_SIZE, RW, anon_private() | VmFlags::FIXED)
            .unwrap();
        assert_eq!(got, a);
        // The next gap at or above the hint follows the new segment.
        assert_eq!(map.findspace(a, PAGE_SIZE).unwrap(), a + 4 * PAGE_SIZE);
        // A fixed request overlapping it must fail and leave the map alone.
        let before = map.nsegments();
        let err = map.alloc_segment(a + 2 * PAGE_SIZE, PAGE_SIZE, Prot::READ, anon_private() | VmFlags::FIXED);
        assert_eq!(err, Err(Errno::NoMem));
        assert_eq!(map.nsegments(), before);
    }

    #[test]
    fn hint_below_all_gaps_falls_back_to_lowest() {
        testmem::init();
        let map = VmMap::new().unwrap();
        // Occupy the very top of the space so a high hint cannot be served.
        let (_, end) = map.bounds();
        let top = end - PAGE_SIZE;
        map.alloc_segment(top, PAGE_SIZE, RW, anon_private() | VmFlags::FIXED).unwrap();
        let got = map.findspace(top, 2 * PAGE_SIZE).unwrap();
        let (start, _) = map.bounds();
        assert_eq!(got, start);
    }

    #[test]
    fn segments_never_overlap() {
        testmem::init();
        let map = VmMap::new().unwrap();
        for _ in 0..8 {
            map.alloc_segment(0, 2 * PAGE_SIZE, RW, anon_private()).unwrap();
        }
        let inner = map.inner.read();
        let segs: Vec<(Vaddr, Vaddr)> = inner.segments.values().map(|s| (s.start, s.end)).collect();
        for (i, &(s1, e1)) in segs.iter().enumerate() {
            assert!(s1 < e1);
            for &(s2, e2) in &segs[i + 1..] {
                assert!(e1 <= s2 || e2 <= s1, "{:#x}..{:#x} overlaps {:#x}..{:#x}", s1, e1, s2, e2);
            }
        }
    }

    #[test]
    fn faults_outside_any_segment_are_segv() {
        testmem::init();
        let map = VmMap::new().unwrap();
        assert_eq!(map.page_fault(0x1000_0000, Prot::READ), Err(Errno::Fault));
        let va = map.alloc_segment(0, PAGE_SIZE, Prot::READ, anon_private()).unwrap();
        assert_eq!(map.page_fault(va, Prot::WRITE), Err(Errno::Acces));
        assert_eq!(map.page_fault(va, Prot::READ), Ok(()));
    }

    #[test]
    fn anonymous_memory_is_zero_on_first_touch() {
        testmem::init();
        let map = VmMap::new().unwrap();
        let va = map.alloc_segment(0, PAGE_SIZE, RW, anon_private()).unwrap();
        assert_eq!(read_byte(&map, va + 123), 0);
    }

    #[test]
    fn cow_clone_isolates_writes() {
        testmem::init();
        let parent = VmMap::new().unwrap();
        let va = parent.alloc_segment(0, PAGE_SIZE, RW, anon_private()).unwrap();
        write_byte(&parent, va, 0xaa);
        let child = parent.clone_map().unwrap();
        // Child sees the parent's byte, then diverges on write.
        assert_eq!(read_byte(&child, va), 0xaa);
        write_byte(&child, va, 0xbb);
        assert_eq!(read_byte(&child, va), 0xbb);
        assert_eq!(read_byte(&parent, va), 0xaa);
        // And the other way round.
        write_byte(&parent, va, 0xcc);
        assert_eq!(read_byte(&child, va), 0xbb);
    }

    #[test]
    fn shared_anon_pages_are_mapped_read_only() {
        testmem::init();
        let parent = VmMap::new().unwrap();
        let va = parent.alloc_segment(0, PAGE_SIZE, RW, anon_private()).unwrap();
        write_byte(&parent, va, 1);
        let child = parent.clone_map().unwrap();
        // Read faults on both sides: mappings must lack write permission
        // while the anon is shared.
        child.page_fault(va, Prot::READ).unwrap();
        parent.page_fault(va, Prot::READ).unwrap();
        assert_eq!(child.pmap().prot_of(va), Some(Prot::READ));
        assert_eq!(parent.pmap().prot_of(va), Some(Prot::READ));
        // A write fault upgrades the faulting side to read-write.
        child.page_fault(va, Prot::WRITE).unwrap();
        assert_eq!(child.pmap().prot_of(va), Some(RW));
    }

    #[test]
    fn shared_segments_stay_coupled_across_clone() {
        testmem::init();
        let parent = VmMap::new().unwrap();
        let va = parent
            .alloc_segment(0, PAGE_SIZE, RW, VmFlags::ANON | VmFlags::SHARED)
            .unwrap();
        write_byte(&parent, va, 0x42);
        let child = parent.clone_map().unwrap();
        write_byte(&child, va, 0x43);
        assert_eq!(read_byte(&parent, va), 0x43);
    }

    #[test]
    fn private_object_writes_promote_to_anons() {
        testmem::init();
        let map = VmMap::new().unwrap();
        let object = VmObject::alloc(PagerKind::Anonymous);
        let obj_page = object.page_in(0).unwrap();
        unsafe { *phys_to_virt(obj_page) = 0x11 };
        let va = map
            .alloc_segment_object(0, PAGE_SIZE, RW, VmFlags::PRIVATE, object.clone(), 0)
            .unwrap();
        assert_eq!(read_byte(&map, va), 0x11);
        write_byte(&map, va, 0x22);
        assert_eq!(read_byte(&map, va), 0x22);
        // The object page is untouched; the write went to an anon copy.
        assert_eq!(unsafe { *phys_to_virt(obj_page) }, 0x11);
        assert_eq!(map.pmap().prot_of(va), Some(RW));
    }

    #[test]
    fn resize_respects_the_neighbourhood() {
        testmem::init();
        let map = VmMap::new().unwrap();
        let a = map.alloc_segment(0, 2 * PAGE_SIZE, RW, anon_private()).unwrap();
        let b = map
            .alloc_segment(a + 4 * PAGE_SIZE, PAGE_SIZE, RW, anon_private() | VmFlags::FIXED)
            .unwrap();
        // Growing into the gap works, through the neighbour does not.
        map.resize(a, a + 4 * PAGE_SIZE).unwrap();
        assert_eq!(map.resize(a, b + PAGE_SIZE), Err(Errno::NoMem));
        // Shrinking drops the tail pages and mappings.
        write_byte(&map, a + 3 * PAGE_SIZE, 9);
        map.resize(a, a + PAGE_SIZE).unwrap();
        assert!(map.pmap().extract(a + 3 * PAGE_SIZE).is_err());
        assert_eq!(map.segment_span(a), Some((a, a + PAGE_SIZE)));
    }

    #[test]
    fn protect_downgrades_and_faults_recheck() {
        testmem::init();
        let map = VmMap::new().unwrap();
        let va = map.alloc_segment(0, PAGE_SIZE, RW, anon_private()).unwrap();
        write_byte(&map, va, 5);
        map.protect(va, va + PAGE_SIZE, Prot::READ).unwrap();
        // The old mapping is gone and the write is now refused.
        assert!(map.pmap().extract(va).is_err());
        assert_eq!(map.page_fault(va, Prot::WRITE), Err(Errno::Acces));
        assert_eq!(read_byte(&map, va), 5);
    }

    #[test]
    fn remove_segment_unmaps_whole_ranges_only() {
        testmem::init();
        let map = VmMap::new().unwrap();
        let va = map.alloc_segment(0, 2 * PAGE_SIZE, RW, anon_private()).unwrap();
        write_byte(&map, va, 1);
        assert_eq!(map.remove_segment(va, PAGE_SIZE), Err(Errno::NotSup));
        map.remove_segment(va, 2 * PAGE_SIZE).unwrap();
        assert_eq!(map.nsegments(), 0);
        assert!(map.pmap().extract(va).is_err());
    }

    #[test]
    fn copyout_and_copyin_roundtrip_through_the_fault_path() {
        testmem::init();
        let map = VmMap::new().unwrap();
        let va = map.alloc_segment(0, 2 * PAGE_SIZE, RW, anon_private()).unwrap();
        // Straddle a page boundary on purpose.
        let target = va + PAGE_SIZE - 3;
        map.copyout(b"boundary", target).unwrap();
        let mut back = [0u8; 8];
        map.copyin(target, &mut back).unwrap();
        assert_eq!(&back, b"boundary");
        // Outside any segment: EFAULT.
        assert_eq!(map.copyout(b"x", 0x7000_0000), Err(Errno::Fault));
    }

    #[test]
    fn copyout_to_read_only_memory_is_efault() {
        testmem::init();
        let map = VmMap::new().unwrap();
        let va = map.alloc_segment(0, PAGE_SIZE, Prot::READ, anon_private()).unwrap();
        assert_eq!(map.copyout(b"nope", va), Err(Errno::Fault));
    }
}
