//! Injectable time source.
//!
//! Every component reads wall-clock time through [`Clock`] so tests can
//! drive expiry windows, billing deadlines, and history pruning with a
//! [`ManualClock`] instead of real timers.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;

/// Wall-clock abstraction. Implementations must be cheap to call.
pub trait Clock: Send + Sync {
    /// Current instant in UTC.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Current calendar date (UTC, date-only). Expiry math is date-only.
    fn today(&self) -> NaiveDate {
        self.now_utc().date_naive()
    }
}

/// Production clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock for tests: starts at a fixed instant and only moves
/// when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Convenience constructor from an RFC 3339 timestamp.
    ///
    /// # Panics
    ///
    /// Panics on a malformed timestamp; intended for fixed test fixtures.
    pub fn at(rfc3339: &str) -> Self {
        let start = DateTime::parse_from_rfc3339(rfc3339)
            .expect("valid RFC 3339 timestamp")
            .with_timezone(&Utc);
        Self::new(start)
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::at("2024-01-15T12:00:00Z");
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());

        clock.advance(Duration::hours(13));
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 1, 16).unwrap());
    }

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now_utc();
        let b = clock.now_utc();
        assert!(b >= a);
    }
}
