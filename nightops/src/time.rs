//! Time helpers: the wire timestamp format and an injectable wall clock.
//!
//! All absolute timestamps on the wire use UTC ISO-8601 with second precision
//! (`YYYY-MM-DDTHH:MM:SSZ`). Durations and aging are measured against the
//! wall clock returned by a [`Clock`], which the tests replace with a
//! [`ManualClock`] pinned to a fixed instant.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;

/// Wire format for absolute UTC timestamps.
pub const UTC_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Formats a timestamp in the wire format.
pub fn format_utc(time: DateTime<Utc>) -> String {
    time.format(UTC_FORMAT).to_string()
}

/// Parses a wire-format timestamp.
///
/// Rejects anything that is not exactly `YYYY-MM-DDTHH:MM:SSZ`.
pub fn parse_utc(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value, UTC_FORMAT).map(|naive| naive.and_utc())
}

/// Source of the current UTC wall-clock time.
///
/// Controllers take the clock as a trait object so the scheduling and aging
/// logic can be exercised at literal instants.
pub trait Clock: Send + Sync {
    /// Returns the current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Intended for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock pinned to the given instant.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Creates a clock pinned to a wire-format timestamp.
    ///
    /// # Panics
    ///
    /// Panics if the timestamp does not parse; intended for test fixtures.
    pub fn at(value: &str) -> Self {
        Self::new(parse_utc(value).expect("valid wire-format timestamp"))
    }

    /// Jumps the clock to a new instant.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    /// Advances the clock by a duration.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).expect("duration in range");
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
