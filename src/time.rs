//! Monotonic time for the timer subsystem.
//!
//! [`MonoTime`] is an absolute point on the monotonic clock in
//! second/nanosecond form, the same shape the OS alarm is programmed with.
//! Subtraction normalizes the sub-second component by borrowing a second, so
//! a delta never carries a negative nanosecond remainder.

use std::ops::Add;
use std::time::Duration;

const NSEC_PER_SEC: u32 = 1_000_000_000;

/// An absolute point on the monotonic clock.
///
/// Ordering is the strict total order on (seconds, nanoseconds); the
/// nanosecond field is always in `[0, 1e9)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonoTime {
    secs: i64,
    nanos: u32,
}

impl MonoTime {
    pub const ZERO: MonoTime = MonoTime { secs: 0, nanos: 0 };

    /// Creates a timestamp, carrying excess nanoseconds into the seconds.
    #[must_use]
    pub const fn new(secs: i64, nanos: u32) -> Self {
        Self {
            secs: secs + (nanos / NSEC_PER_SEC) as i64,
            nanos: nanos % NSEC_PER_SEC,
        }
    }

    /// Seconds component.
    #[must_use]
    pub const fn secs(self) -> i64 {
        self.secs
    }

    /// Sub-second component, always `< 1e9`.
    #[must_use]
    pub const fn subsec_nanos(self) -> u32 {
        self.nanos
    }

    /// Time elapsed from `earlier` to `self`, or `None` if `earlier` is
    /// later. A negative sub-second remainder borrows one second so the
    /// nanosecond component of the result stays in `[0, 1e9)`.
    #[must_use]
    pub fn duration_since(self, earlier: MonoTime) -> Option<Duration> {
        let mut secs = self.secs - earlier.secs;
        let mut nanos = self.nanos as i64 - earlier.nanos as i64;
        if nanos < 0 {
            nanos += NSEC_PER_SEC as i64;
            secs -= 1;
        }
        if secs < 0 {
            return None;
        }
        Some(Duration::new(secs as u64, nanos as u32))
    }

    /// Like [`duration_since`](Self::duration_since), clamping to zero when
    /// `earlier` is in the future.
    #[must_use]
    pub fn saturating_duration_since(self, earlier: MonoTime) -> Duration {
        self.duration_since(earlier).unwrap_or(Duration::ZERO)
    }
}

impl Add<Duration> for MonoTime {
    type Output = MonoTime;

    fn add(self, rhs: Duration) -> MonoTime {
        let mut secs = self.secs + rhs.as_secs() as i64;
        let mut nanos = self.nanos + rhs.subsec_nanos();
        if nanos >= NSEC_PER_SEC {
            nanos -= NSEC_PER_SEC;
            secs += 1;
        }
        MonoTime { secs, nanos }
    }
}

/// A source of monotonic timestamps.
///
/// The timer subsystem reads time only through this trait, so tests can
/// substitute a deterministic clock. A single monotonic domain is the only
/// one warden uses; a second domain would be another implementor.
pub trait Clock {
    fn now(&self) -> MonoTime;
}

/// Production clock backed by `CLOCK_MONOTONIC`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> MonoTime {
        let ts = rustix::time::clock_gettime(rustix::time::ClockId::Monotonic);
        MonoTime::new(ts.tv_sec, ts.tv_nsec as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_carries_excess_nanos() {
        let t = MonoTime::new(1, 2_500_000_000);
        assert_eq!(t.secs(), 3);
        assert_eq!(t.subsec_nanos(), 500_000_000);
    }

    #[test]
    fn duration_since_borrows_a_second() {
        // 5.1s - 3.9s: the raw nanosecond difference is negative, so one
        // second is borrowed and the remainder lands in [0, 1e9).
        let a = MonoTime::new(5, 100_000_000);
        let b = MonoTime::new(3, 900_000_000);
        assert_eq!(a.duration_since(b), Some(Duration::new(1, 200_000_000)));
    }

    #[test]
    fn duration_since_rejects_future_earlier() {
        let a = MonoTime::new(2, 0);
        let b = MonoTime::new(2, 1);
        assert_eq!(a.duration_since(b), None);
        assert_eq!(a.saturating_duration_since(b), Duration::ZERO);
    }

    #[test]
    fn add_carries_into_seconds() {
        let t = MonoTime::new(1, 800_000_000) + Duration::new(0, 300_000_000);
        assert_eq!(t, MonoTime::new(2, 100_000_000));
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(MonoTime::new(1, 999_999_999) < MonoTime::new(2, 0));
        assert!(MonoTime::new(2, 1) > MonoTime::new(2, 0));
    }

    #[test]
    fn monotonic_clock_advances() {
        let clock = MonotonicClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
