//! Timestamp sources.
//!
//! Every timestamp the engine writes comes from an injected [`Clock`], which
//! keeps message ordering stable and lets tests control time.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

pub trait Clock: Send + Sync {
    /// Returns a timestamp strictly greater than any previously returned one,
    /// until the end of the representable range.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock with a monotonic guard.
///
/// If the system clock steps backwards (or two calls land in the same
/// microsecond) the returned value is bumped one microsecond past the last.
#[derive(Debug, Default)]
pub struct SystemClock {
    last_micros: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_micros();
        let mut prev = self.last_micros.load(Ordering::Relaxed);
        loop {
            let next = if wall > prev { wall } else { prev + 1 };
            match self.last_micros.compare_exchange_weak(
                prev,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return micros_to_datetime(next),
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Test clock: starts at a fixed instant and ticks one millisecond per call.
#[derive(Debug)]
pub struct ManualClock {
    micros: AtomicI64,
}

impl ManualClock {
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            micros: AtomicI64::new(start.timestamp_micros()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let step = by.num_microseconds().unwrap_or(0).max(0);
        self.micros.fetch_add(step, Ordering::AcqRel);
    }

    /// Current reading without ticking.
    pub fn peek(&self) -> DateTime<Utc> {
        micros_to_datetime(self.micros.load(Ordering::Acquire))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        micros_to_datetime(self.micros.fetch_add(1_000, Ordering::AcqRel) + 1_000)
    }
}

/// Readings outside chrono's range saturate at its bounds, so the clock
/// stops advancing rather than jumping back.
fn micros_to_datetime(micros: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(micros).single().unwrap_or(if micros < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_strictly_increasing() {
        let clock = SystemClock::new();
        let mut last = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_manual_clock_ticks_and_advances() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let clock = ManualClock::starting_at(start);

        let first = clock.now();
        let second = clock.now();
        assert!(second > first);
        assert_eq!(second - first, Duration::milliseconds(1));

        clock.advance(Duration::hours(2));
        assert!(clock.peek() >= start + Duration::hours(2));
    }

    #[test]
    fn test_clock_saturates_at_end_of_range() {
        let clock = ManualClock::starting_at(DateTime::<Utc>::MAX_UTC - Duration::milliseconds(2));
        let mut last = clock.now();
        for _ in 0..5 {
            let next = clock.now();
            assert!(next >= last);
            last = next;
        }
        assert_eq!(last, DateTime::<Utc>::MAX_UTC);

        let system = SystemClock {
            last_micros: AtomicI64::new(DateTime::<Utc>::MAX_UTC.timestamp_micros()),
        };
        assert_eq!(system.now(), DateTime::<Utc>::MAX_UTC);
    }
}
