//! Physical memory manager.
//!
//! Owns every usable RAM frame as a page descriptor and serves power-of-two
//! sized page runs from per-order free lists (buddy system). Splitting takes
//! the smallest sufficient run apart, freeing coalesces a run with its buddy
//! as long as the buddy is free, of equal order and inside the same segment.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;
use spinning_top::Spinlock;

use crate::Paddr;
use crate::config::{PAGE_SIZE, PAGE_SHIFT};
use crate::kenv;

/// Largest supported run order (2^20 pages = 4 GiB per run).
const MAX_ORDER: usize = 20;

bitflags! {
    /// Page descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// Never available for allocation (kernel image, DTB, firmware).
        const RESERVED = 0x01;
        /// Page run has been handed out by the allocator.
        const ALLOCATED = 0x02;
        /// Page is under allocator control.
        const MANAGED = 0x04;
        /// Accessed since the bit was last cleared (software emulation).
        const REFERENCED = 0x08;
        /// Written to since the bit was last cleared (software emulation).
        const MODIFIED = 0x10;
    }
}

/// Physical page descriptor. One exists for every RAM frame, created when
/// its segment is registered. `size` is only meaningful at the head of a run.
#[derive(Debug)]
pub struct Page {
    pub paddr: Paddr,
    /// Run length in pages, tracked at the run head.
    pub size: usize,
    pub flags: PageFlags,
    /// Offset within the owning VM object, valid while `owned` is set.
    pub offset: usize,
    /// Whether some VM object currently owns this page.
    pub owned: bool,
}

impl Page {
    fn new(paddr: Paddr) -> Self {
        Page { paddr, size: 1, flags: PageFlags::MANAGED, offset: 0, owned: false }
    }
}

struct PmSegment {
    start: Paddr,
    end: Paddr,
    pages: Vec<Page>,
    /// Free run heads, indexed by order. Runs are pushed and popped at the
    /// tail, so recently split buddies are reused first.
    freelist: [Vec<u32>; MAX_ORDER + 1],
}

impl PmSegment {
    fn npages(&self) -> usize {
        (self.end - self.start) >> PAGE_SHIFT
    }

    fn contains(&self, pa: Paddr) -> bool {
        pa >= self.start && pa < self.end
    }

    fn idx(&self, pa: Paddr) -> usize {
        (pa - self.start) >> PAGE_SHIFT
    }

    fn remove_free(&mut self, idx: usize, order: usize) {
        let pos = self.freelist[order]
            .iter()
            .position(|&i| i as usize == idx)
            .expect("free run missing from its free list");
        self.freelist[order].swap_remove(pos);
    }

    /// Mark the run starting at `idx` free and merge it with its buddy while
    /// possible.
    fn insert_free(&mut self, mut idx: usize, mut order: usize) {
        loop {
            let buddy = idx ^ (1 << order);
            let buddy_mergeable = order < MAX_ORDER
                && buddy + (1 << order) <= self.npages()
                && self.pages[buddy].size == 1 << order
                && self.pages[buddy].flags.contains(PageFlags::MANAGED)
                && !self.pages[buddy].flags.intersects(PageFlags::ALLOCATED | PageFlags::RESERVED)
                && self.freelist[order].contains(&(buddy as u32));
            if !buddy_mergeable {
                break;
            }
            self.remove_free(buddy, order);
            idx = idx.min(buddy);
            order += 1;
        }
        self.pages[idx].size = 1 << order;
        self.pages[idx].flags.remove(PageFlags::ALLOCATED);
        self.freelist[order].push(idx as u32);
    }

    /// Free a run of `len` pages at `idx`, decomposing it into buddy-aligned
    /// power-of-two chunks. `len` need not be a power of two (split runs).
    fn free_run(&mut self, mut idx: usize, mut len: usize) {
        while len > 0 {
            let align = if idx == 0 { MAX_ORDER } else { idx.trailing_zeros() as usize };
            let mut order = align.min(MAX_ORDER);
            while (1 << order) > len {
                order -= 1;
            }
            self.insert_free(idx, order);
            idx += 1 << order;
            len -= 1 << order;
        }
    }

    fn alloc(&mut self, n: usize) -> Option<Paddr> {
        let want = n.trailing_zeros() as usize;
        let order = (want..=MAX_ORDER).find(|&o| !self.freelist[o].is_empty())?;
        let idx = self.freelist[order].pop().expect("free list emptied") as usize;
        // Split the run down to the requested order; each split produces a
        // free buddy of equal order.
        let mut o = order;
        while o > want {
            o -= 1;
            let buddy = idx + (1 << o);
            self.pages[buddy].size = 1 << o;
            self.freelist[o].push(buddy as u32);
        }
        self.pages[idx].size = n;
        self.pages[idx].flags.insert(PageFlags::ALLOCATED);
        Some(self.start + (idx << PAGE_SHIFT))
    }

    /// Take a specific free page out of the free lists, splitting runs on
    /// the way down. Used to reserve boot-time ranges.
    fn carve_page(&mut self, target: usize) -> bool {
        for order in (0..=MAX_ORDER).rev() {
            let Some(pos) = self.freelist[order]
                .iter()
                .position(|&i| (i as usize..i as usize + (1 << order)).contains(&target))
            else {
                continue;
            };
            let mut idx = self.freelist[order][pos] as usize;
            self.freelist[order].swap_remove(pos);
            let mut o = order;
            while o > 0 {
                o -= 1;
                let (keep, split) = if target < idx + (1 << o) {
                    (idx, idx + (1 << o))
                } else {
                    (idx + (1 << o), idx)
                };
                self.pages[split].size = 1 << o;
                self.freelist[o].push(split as u32);
                idx = keep;
            }
            return true;
        }
        false
    }
}

/// The allocator proper; the kernel uses a single global instance behind
/// [`pm_alloc`] and friends.
pub struct PhysMem {
    segments: Vec<PmSegment>,
}

impl PhysMem {
    pub const fn new() -> Self {
        PhysMem { segments: Vec::new() }
    }

    /// Register a RAM region `[start, end)`. Both bounds must be
    /// page-aligned. All of its frames become allocatable at once.
    pub fn add_segment(&mut self, start: Paddr, end: Paddr) {
        assert!(crate::vm::page_aligned(start) && crate::vm::page_aligned(end) && start < end);
        let npages = (end - start) >> PAGE_SHIFT;
        let mut pages = Vec::with_capacity(npages);
        for i in 0..npages {
            pages.push(Page::new(start + (i << PAGE_SHIFT)));
        }
        let mut seg = PmSegment { start, end, pages, freelist: [const { Vec::new() }; MAX_ORDER + 1] };
        seg.free_run(0, npages);
        self.segments.push(seg);
    }

    /// Mark `[start, end)` unavailable for allocation. The range must
    /// currently be free; reservation happens at boot before any user of the
    /// allocator runs.
    pub fn reserve(&mut self, start: Paddr, end: Paddr) {
        let start = crate::vm::page_align_down(start);
        let end = crate::vm::page_align_up(end);
        for seg in &mut self.segments {
            let lo = start.max(seg.start);
            let hi = end.min(seg.end);
            let mut pa = lo;
            while pa < hi {
                let idx = seg.idx(pa);
                if !seg.carve_page(idx) {
                    panic!("cannot reserve busy page {:#x}", pa);
                }
                seg.pages[idx].size = 1;
                seg.pages[idx].flags = PageFlags::RESERVED;
                pa += PAGE_SIZE;
            }
        }
    }

    /// Allocate a run of `n` pages, `n` a power of two. Returns the physical
    /// address of the run head, or `None` if no segment has a sufficient run.
    pub fn alloc(&mut self, n: usize) -> Option<Paddr> {
        assert!(n.is_power_of_two(), "page run length must be a power of two");
        self.segments.iter_mut().find_map(|seg| seg.alloc(n))
    }

    /// Free the run whose head is at `pa`.
    pub fn free(&mut self, pa: Paddr) {
        let seg = self
            .segments
            .iter_mut()
            .find(|s| s.contains(pa))
            .expect("freeing page outside any segment");
        let idx = seg.idx(pa);
        let page = &mut seg.pages[idx];
        if !page.flags.contains(PageFlags::MANAGED) || !page.flags.contains(PageFlags::ALLOCATED) {
            panic!("freeing page {:#x} that is not an allocated managed page", pa);
        }
        page.flags.remove(PageFlags::ALLOCATED | PageFlags::REFERENCED | PageFlags::MODIFIED);
        page.owned = false;
        let len = page.size;
        seg.free_run(idx, len);
    }

    /// Split one page off the tail of the allocated run headed at `pa`.
    /// The remainder keeps the head address with its size reduced; the split
    /// page becomes an independent allocated single-page run.
    pub fn split_alloc_page(&mut self, pa: Paddr) -> Option<Paddr> {
        let seg = self.segments.iter_mut().find(|s| s.contains(pa))?;
        let idx = seg.idx(pa);
        if !seg.pages[idx].flags.contains(PageFlags::ALLOCATED) || seg.pages[idx].size <= 1 {
            return None;
        }
        let size = seg.pages[idx].size;
        seg.pages[idx].size = size - 1;
        let tail = idx + size - 1;
        seg.pages[tail].size = 1;
        seg.pages[tail].flags.insert(PageFlags::ALLOCATED);
        Some(seg.start + (tail << PAGE_SHIFT))
    }

    /// Access the descriptor of the frame at `pa`.
    pub fn page_mut(&mut self, pa: Paddr) -> Option<&mut Page> {
        let seg = self.segments.iter_mut().find(|s| s.contains(pa))?;
        let idx = seg.idx(pa);
        seg.pages.get_mut(idx)
    }

    fn npages(&self) -> usize {
        self.segments.iter().map(|s| s.npages()).sum()
    }
}

static PHYSMEM: Spinlock<PhysMem> = Spinlock::new(PhysMem::new());

static TOTAL_PAGES: AtomicUsize = AtomicUsize::new(0);
static ALLOCATED_PAGES: AtomicUsize = AtomicUsize::new(0);

/// Register a RAM region with the global allocator.
pub fn pm_add_segment(start: Paddr, end: Paddr) {
    let mut pm = PHYSMEM.lock();
    pm.add_segment(start, end);
    TOTAL_PAGES.store(pm.npages(), Ordering::Release);
}

/// Reserve `[start, end)` so it is never allocated.
pub fn pm_reserve(start: Paddr, end: Paddr) {
    PHYSMEM.lock().reserve(start, end);
}

/// Allocate a run of `n` pages (`n` a power of two).
pub fn pm_alloc(n: usize) -> Option<Paddr> {
    let result = PHYSMEM.lock().alloc(n);
    if result.is_some() {
        ALLOCATED_PAGES.fetch_add(n, Ordering::Relaxed);
    }
    result
}

/// Free the run whose head is at `pa`.
pub fn pm_free(pa: Paddr) {
    let mut pm = PHYSMEM.lock();
    let n = pm.page_mut(pa).map(|p| p.size).unwrap_or(1);
    pm.free(pa);
    ALLOCATED_PAGES.fetch_sub(n, Ordering::Relaxed);
}

/// Split a single allocated page off the run headed at `pa`.
pub fn pm_split_alloc_page(pa: Paddr) -> Option<Paddr> {
    PHYSMEM.lock().split_alloc_page(pa)
}

/// Run `f` on the page descriptor of the frame at `pa`.
pub fn with_page<R>(pa: Paddr, f: impl FnOnce(&mut Page) -> R) -> Option<R> {
    PHYSMEM.lock().page_mut(pa).map(f)
}

/// (total, allocated, free) page counts.
pub fn stats() -> (usize, usize, usize) {
    let total = TOTAL_PAGES.load(Ordering::Relaxed);
    let allocated = ALLOCATED_PAGES.load(Ordering::Relaxed);
    (total, allocated, total.saturating_sub(allocated))
}

/// Register RAM described by the boot environment (`mem_start`/`mem_end` or
/// `memsize`) and reserve the initrd image (`rd_start`/`rd_size`).
pub fn init_from_kenv() {
    let (start, end) = match (kenv::get_uint("mem_start"), kenv::get_uint("mem_end")) {
        (Some(start), Some(end)) => (start, end),
        _ => match kenv::get_uint("memsize") {
            Some(size) => (0, size),
            None => return,
        },
    };
    pm_add_segment(crate::vm::page_align_up(start), crate::vm::page_align_down(end));
    if let (Some(rd_start), Some(rd_size)) = (kenv::get_uint("rd_start"), kenv::get_uint("rd_size"))
    {
        pm_reserve(rd_start, rd_start + rd_size);
    }
    log::debug!(target: "physmem", "{} pages of RAM under management", stats().0);
}
