//! Kernel configuration constants.
//!
//! This module contains tunable parameters for the kernel core.
//! Modify these values to adjust kernel behavior.

#![allow(dead_code)]

/// Size of a physical or virtual page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// log2(PAGE_SIZE).
pub const PAGE_SHIFT: usize = 12;

/// System clock frequency: 1 tick = 1 ms.
pub const HZ: u64 = 1000;

/// Scheduler time quantum, in ticks.
///
/// Threads of equal priority round-robin on this granularity.
pub const SLICE: u32 = 10;

/// Number of pages mapped for each kernel thread stack.
///
/// One extra unmapped guard page always sits below the stack so that an
/// overflow faults instead of silently corrupting the adjacent allocation.
pub const KSTACK_PAGES: usize = 4;

/// Total number of thread priorities. 0 is the highest, 255 the lowest.
pub const PRIO_QTY: usize = 256;

/// How many priorities are served by the bands reserved for interrupt
/// threads, kernel threads and user threads. The three must sum to
/// `PRIO_QTY`.
pub const PRIO_ITHRD_QTY: usize = 32;
pub const PRIO_KTHRD_QTY: usize = 64;
pub const PRIO_UTHRD_QTY: usize = 160;

/// Number of run queues; each serves `RQ_PPQ` adjacent priorities.
pub const RQ_NQS: usize = 64;

/// Priorities per run queue.
pub const RQ_PPQ: usize = PRIO_QTY / RQ_NQS;

/// Number of buckets in the callout wheel. Must be a power of two.
pub const CALLOUT_BUCKETS: usize = 64;

/// Size of the static kernel heap arena claimed by the global allocator.
pub const KERNEL_HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Lowest user-space address manageable by a user VM map.
pub const USER_SPACE_START: usize = 0x0000_1000;

/// One past the highest user-space address.
pub const USER_SPACE_END: usize = 0x0000_8000_0000_0000;

/// Kernel virtual address range handed to the KVA allocator.
pub const KERNEL_SPACE_START: usize = 0xffff_0000_0000_0000;
pub const KERNEL_SPACE_END: usize = 0xffff_8000_0000_0000;

/// The brk segment is placed at the first large enough gap at or after this
/// address. The space available to `sbrk` is indirectly bounded by it.
pub const SBRK_START: usize = 0x0800_0000;

/// Map a band-relative value in `[0, PRIO_QTY - 1]` onto interrupt-thread
/// priorities.
pub const fn prio_ithread(n: usize) -> u8 {
    (n * (PRIO_ITHRD_QTY - 1) / (PRIO_QTY - 1)) as u8
}

/// Map a band-relative value in `[0, PRIO_QTY - 1]` onto kernel-thread
/// priorities.
pub const fn prio_kthread(n: usize) -> u8 {
    (PRIO_ITHRD_QTY + n * (PRIO_KTHRD_QTY - 1) / (PRIO_QTY - 1)) as u8
}

/// Map a band-relative value in `[0, PRIO_QTY - 1]` onto user-thread
/// priorities.
pub const fn prio_uthread(n: usize) -> u8 {
    (PRIO_ITHRD_QTY + PRIO_KTHRD_QTY + n * (PRIO_UTHRD_QTY - 1) / (PRIO_QTY - 1)) as u8
}

/// True if `p1` is a higher priority than `p2`. Smaller numeric values mean
/// higher priority, so priority comparisons must go through these helpers.
pub const fn prio_gt(p1: u8, p2: u8) -> bool {
    p1 < p2
}

/// True if `p1` is a priority at least as high as `p2`.
pub const fn prio_ge(p1: u8, p2: u8) -> bool {
    p1 <= p2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_bands_cover_the_whole_range() {
        assert_eq!(PRIO_ITHRD_QTY + PRIO_KTHRD_QTY + PRIO_UTHRD_QTY, PRIO_QTY);
        assert_eq!(prio_ithread(0), 0);
        assert_eq!(prio_kthread(0), PRIO_ITHRD_QTY as u8);
        assert_eq!(prio_uthread(0), (PRIO_ITHRD_QTY + PRIO_KTHRD_QTY) as u8);
        assert_eq!(prio_uthread(PRIO_QTY - 1), 255);
    }

    #[test]
    fn numerically_smaller_priority_wins() {
        assert!(prio_gt(prio_ithread(0), prio_uthread(0)));
        assert!(prio_ge(10, 10));
        assert!(!prio_gt(200, 100));
    }
}
