//! System clock.
//!
//! The architecture timer glue calls [`clock_tick`] at HZ; each tick
//! advances the monotonic tick counter, delegates expired callouts and runs
//! the scheduler's quantum accounting. `clock_nanosleep` is implemented
//! here on top of the timed sleep.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::HZ;
use crate::sleepq::sleepq_wait_timed;
use crate::thread::WakeReason;
use crate::{Errno, Result, Systime};

static NOW: AtomicU64 = AtomicU64::new(0);

/// Current system time in ticks since boot.
pub fn getsystime() -> Systime {
    NOW.load(Ordering::Acquire)
}

/// One HZ tick: advance time, fire callouts, account the running thread.
pub fn clock_tick() {
    let now = NOW.fetch_add(1, Ordering::AcqRel) + 1;
    crate::callout::callout_process(now);
    crate::sched::sched_clock();
}

pub const CLOCK_REALTIME: u32 = 0;
pub const CLOCK_MONOTONIC: u32 = 3;

/// Only flag `clock_nanosleep` understands.
pub const TIMER_ABSTIME: u32 = 0x1;

/// Second/nanosecond pair as exchanged with userland.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl Timespec {
    pub const fn new(tv_sec: i64, tv_nsec: i64) -> Timespec {
        Timespec { tv_sec, tv_nsec }
    }

    /// True iff the pair encodes a valid non-negative duration.
    pub fn valid(&self) -> bool {
        self.tv_sec >= 0 && (0..1_000_000_000).contains(&self.tv_nsec)
    }

    /// Duration in ticks, rounded up so a sleep never undershoots.
    pub fn to_ticks(&self) -> Systime {
        let sec = self.tv_sec as u64 * HZ;
        let nsec_per_tick = 1_000_000_000 / HZ;
        sec + (self.tv_nsec as u64).div_ceil(nsec_per_tick)
    }

    /// Ticks to Timespec, for reporting remaining time.
    pub fn from_ticks(ticks: Systime) -> Timespec {
        let nsec_per_tick = (1_000_000_000 / HZ) as i64;
        Timespec { tv_sec: (ticks / HZ) as i64, tv_nsec: (ticks % HZ) as i64 * nsec_per_tick }
    }
}

fn nanosleep_chan() -> usize {
    0x7d00_0000_0000 | crate::sched::current_tid() as usize
}

/// Sleep until `rqt` (absolute) or for `rqt` (relative) on the given clock.
/// `rmt`, when requested, receives the unslept remainder of a relative
/// sleep interrupted by a signal.
pub fn do_clock_nanosleep(
    clock_id: u32,
    flags: u32,
    rqt: &Timespec,
    rmt: Option<&mut Timespec>,
) -> Result<()> {
    if clock_id != CLOCK_REALTIME && clock_id != CLOCK_MONOTONIC {
        return Err(Errno::Inval);
    }
    if flags & !TIMER_ABSTIME != 0 {
        return Err(Errno::Inval);
    }
    if !rqt.valid() {
        return Err(Errno::Inval);
    }
    let start = getsystime();
    let deadline = if flags & TIMER_ABSTIME != 0 {
        rqt.to_ticks()
    } else {
        start + rqt.to_ticks()
    };
    loop {
        let now = getsystime();
        if now >= deadline {
            return Ok(());
        }
        match sleepq_wait_timed(nanosleep_chan(), "clock_nanosleep", deadline - now) {
            WakeReason::TimedOut => return Ok(()),
            WakeReason::Interrupted => {
                if flags & TIMER_ABSTIME == 0
                    && let Some(rmt) = rmt
                {
                    let left = deadline.saturating_sub(getsystime());
                    *rmt = Timespec::from_ticks(left);
                }
                return Err(Errno::Intr);
            }
            // Spurious wakeup: go back to sleep for the remainder.
            WakeReason::Normal => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_seconds_are_invalid() {
        crate::testutil::boot();
        let rqt = Timespec::new(-1, 0);
        assert_eq!(do_clock_nanosleep(CLOCK_MONOTONIC, 0, &rqt, None), Err(Errno::Inval));
    }

    #[test]
    fn nanoseconds_must_stay_below_one_second() {
        crate::testutil::boot();
        let rqt = Timespec::new(0, 1_000_000_000);
        assert_eq!(do_clock_nanosleep(CLOCK_MONOTONIC, 0, &rqt, None), Err(Errno::Inval));
        let rqt = Timespec::new(0, -1);
        assert_eq!(do_clock_nanosleep(CLOCK_MONOTONIC, 0, &rqt, None), Err(Errno::Inval));
    }

    #[test]
    fn unknown_flags_are_invalid() {
        crate::testutil::boot();
        let rqt = Timespec::new(0, 100_000);
        assert_eq!(
            do_clock_nanosleep(CLOCK_MONOTONIC, !TIMER_ABSTIME, &rqt, None),
            Err(Errno::Inval)
        );
    }

    #[test]
    fn unknown_clocks_are_invalid() {
        crate::testutil::boot();
        let rqt = Timespec::new(0, 0);
        assert_eq!(do_clock_nanosleep(77, 0, &rqt, None), Err(Errno::Inval));
    }

    #[test]
    fn absolute_deadline_in_the_past_returns_at_once() {
        crate::testutil::boot();
        let rqt = Timespec::new(0, 0);
        assert_eq!(do_clock_nanosleep(CLOCK_MONOTONIC, TIMER_ABSTIME, &rqt, None), Ok(()));
    }

    #[test]
    fn tick_conversion_rounds_up() {
        let one_and_a_bit_ms = Timespec::new(0, 1_000_001);
        assert_eq!(one_and_a_bit_ms.to_ticks(), 2);
        assert_eq!(Timespec::new(2, 0).to_ticks(), 2 * HZ);
        assert_eq!(Timespec::new(0, 1).to_ticks(), 1);
        assert_eq!(Timespec::new(0, 0).to_ticks(), 0);
    }

    #[test]
    fn from_ticks_roundtrips_whole_seconds() {
        let ts = Timespec::from_ticks(2 * HZ + 5);
        assert_eq!(ts.tv_sec, 2);
        assert_eq!(ts.tv_nsec, 5 * (1_000_000_000 / HZ) as i64);
    }
}
