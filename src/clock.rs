//! Time source abstraction.
//!
//! Everything in the pipeline that stamps or compares time goes through
//! the [`Clock`] trait: entry timestamps, chunk ids, retention cutoffs,
//! alert windows. Production code uses [`SystemClock`]; tests that need
//! deterministic time (retention sweeps, timestamp substitution) inject a
//! [`MockClock`] and move it by hand.
//!
//! The canonical representation is a chrono [`DateTime<Utc>`], which is
//! what the rest of the crate stores and serializes. A [`SystemTime`]
//! view is derived from it for the one place that compares against file
//! modification times.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

/// A source of the current time.
pub trait Clock: Send + Sync {
    /// Current instant as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Current instant as a [`SystemTime`], for comparisons against file
    /// metadata.
    fn now_system(&self) -> SystemTime {
        SystemTime::from(self.now_utc())
    }
}

/// The real wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A hand-driven clock for tests.
///
/// Holds the current instant as unix nanoseconds in an atomic, so tests
/// can advance it from any thread without locking.
///
/// # Example
///
/// ```
/// use chrono::TimeZone;
/// use std::time::Duration;
/// use loglake::clock::{Clock, MockClock};
///
/// let clock = MockClock::at(chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap());
/// clock.advance(Duration::from_secs(60));
/// assert_eq!(clock.now_utc().timestamp(), 1_700_000_060);
/// ```
pub struct MockClock {
    nanos: AtomicI64,
}

impl Clock for MockClock {
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.nanos.load(Ordering::Relaxed))
    }
}

impl MockClock {
    /// A mock clock pinned to the given instant.
    pub fn at(time: DateTime<Utc>) -> Self {
        Self {
            nanos: AtomicI64::new(time.timestamp_nanos_opt().unwrap_or_default()),
        }
    }

    /// A mock clock starting at the real current time.
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        self.nanos
            .fetch_add(duration.as_nanos() as i64, Ordering::Relaxed);
    }

    /// Jumps the clock to an absolute instant.
    pub fn set(&self, time: DateTime<Utc>) {
        self.nanos.store(
            time.timestamp_nanos_opt().unwrap_or_default(),
            Ordering::Relaxed,
        );
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn should_advance_mock_clock() {
        // given
        let clock = MockClock::at(Utc.timestamp_opt(1_700_000_000, 0).unwrap());

        // when
        clock.advance(Duration::from_secs(60));

        // then
        assert_eq!(clock.now_utc().timestamp(), 1_700_000_060);
    }

    #[test]
    fn should_jump_to_absolute_instant() {
        // given
        let clock = MockClock::new();

        // when
        clock.set(Utc.timestamp_opt(1_705_314_600, 0).unwrap());

        // then
        assert_eq!(clock.now_utc().timestamp(), 1_705_314_600);
    }

    #[test]
    fn should_derive_system_time_view() {
        // given
        let instant = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let clock = MockClock::at(instant);

        // when
        let system = clock.now_system();

        // then
        assert_eq!(
            system
                .duration_since(std::time::SystemTime::UNIX_EPOCH)
                .unwrap()
                .as_secs(),
            1_700_000_000
        );
    }
}
