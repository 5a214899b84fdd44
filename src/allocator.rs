//! Kernel heap allocator.
//!
//! The global allocator is `talc` over a static arena living in `.bss`. The
//! arena is claimed lazily on the first allocation so no boot-order
//! dependency exists between the heap and the rest of the core. Page-granular
//! kernel memory (thread stacks, page-sized buffers) comes from [`crate::kmem`]
//! instead.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use spinning_top::Spinlock;
use talc::{ClaimOnOom, Span, Talc};

use crate::config::KERNEL_HEAP_SIZE;

#[repr(align(4096))]
struct Arena([u8; KERNEL_HEAP_SIZE]);

static mut ARENA: Arena = Arena([0; KERNEL_HEAP_SIZE]);

static TALC: Spinlock<Talc<ClaimOnOom>> = Spinlock::new(Talc::new(unsafe {
    ClaimOnOom::new(Span::from_const_array(core::ptr::addr_of!(ARENA.0)))
}));

// Memory tracking
static ALLOCATED_BYTES: AtomicUsize = AtomicUsize::new(0);
static ALLOCATION_COUNT: AtomicUsize = AtomicUsize::new(0);
static PEAK_ALLOCATED: AtomicUsize = AtomicUsize::new(0);

/// Kernel heap statistics.
#[derive(Debug, Clone, Copy)]
pub struct HeapStats {
    pub heap_size: usize,
    pub allocated: usize,
    pub allocation_count: usize,
    pub peak_allocated: usize,
}

/// Get current heap statistics.
pub fn stats() -> HeapStats {
    HeapStats {
        heap_size: KERNEL_HEAP_SIZE,
        allocated: ALLOCATED_BYTES.load(Ordering::Relaxed),
        allocation_count: ALLOCATION_COUNT.load(Ordering::Relaxed),
        peak_allocated: PEAK_ALLOCATED.load(Ordering::Relaxed),
    }
}

fn note_alloc(size: usize) {
    let new_allocated = ALLOCATED_BYTES.fetch_add(size, Ordering::Relaxed) + size;
    ALLOCATION_COUNT.fetch_add(1, Ordering::Relaxed);
    let mut peak = PEAK_ALLOCATED.load(Ordering::Relaxed);
    while new_allocated > peak {
        match PEAK_ALLOCATED.compare_exchange_weak(
            peak,
            new_allocated,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(p) => peak = p,
        }
    }
}

struct KernelAllocator;

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let result = TALC
            .lock()
            .malloc(layout)
            .map(|p| p.as_ptr())
            .unwrap_or(ptr::null_mut());
        if !result.is_null() {
            note_alloc(layout.size());
        }
        result
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() {
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe {
            TALC.lock().free(ptr::NonNull::new_unchecked(ptr), layout);
        }
        ALLOCATED_BYTES.fetch_sub(layout.size(), Ordering::Relaxed);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        unsafe {
            if new_size == 0 {
                self.dealloc(ptr, layout);
                return ptr::null_mut();
            }
            let new_layout = match Layout::from_size_align(new_size, layout.align()) {
                Ok(l) => l,
                Err(_) => return ptr::null_mut(),
            };
            let new_ptr = self.alloc(new_layout);
            if new_ptr.is_null() {
                return ptr::null_mut();
            }
            if !ptr.is_null() && layout.size() > 0 {
                ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
                self.dealloc(ptr, layout);
            }
            new_ptr
        }
    }
}
