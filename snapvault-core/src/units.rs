//! Unified file timestamp.
//!
//! The engine never compares platform file times directly; everything is
//! normalized to [`Timestamp`], a 64-bit tick counted in nanoseconds since
//! the Unix epoch. An absent value is `Option<Timestamp>` (likewise
//! `Option<u64>` for sizes), which is what gates a field's participation in
//! index queries.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use filetime::FileTime;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A filesystem modification time as a signed nanosecond tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Construct from a raw nanosecond tick (e.g. an index TIME column).
    pub fn from_nanos(nanos: i64) -> Self {
        Timestamp(nanos)
    }

    /// The raw nanosecond tick, as stored in the index.
    pub fn as_nanos(self) -> i64 {
        self.0
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Convert from the system clock. Times before the epoch map to
    /// negative ticks.
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp(d.as_nanos() as i64),
            Err(e) => Timestamp(-(e.duration().as_nanos() as i64)),
        }
    }

    /// Convert back to the system clock.
    pub fn to_system_time(self) -> SystemTime {
        if self.0 >= 0 {
            UNIX_EPOCH + Duration::from_nanos(self.0 as u64)
        } else {
            UNIX_EPOCH - Duration::from_nanos(self.0.unsigned_abs())
        }
    }

    /// Convert from a filesystem modification time.
    pub fn from_file_time(time: FileTime) -> Self {
        Timestamp(time.unix_seconds() * NANOS_PER_SEC + i64::from(time.nanoseconds()))
    }

    /// Convert to a filesystem modification time (for mtime preservation).
    pub fn to_file_time(self) -> FileTime {
        let secs = self.0.div_euclid(NANOS_PER_SEC);
        let nanos = self.0.rem_euclid(NANOS_PER_SEC) as u32;
        FileTime::from_unix_time(secs, nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nanos_round_trip() {
        let ts = Timestamp::from_nanos(1_700_000_000_123_456_789);
        assert_eq!(ts.as_nanos(), 1_700_000_000_123_456_789);
    }

    #[test]
    fn test_system_time_round_trip() {
        let now = SystemTime::now();
        let ts = Timestamp::from_system_time(now);
        let back = ts.to_system_time();
        // SystemTime resolution is at least nanoseconds on all supported
        // platforms, so the round trip is exact.
        assert_eq!(back, now);
    }

    #[test]
    fn test_file_time_round_trip() {
        let ft = FileTime::from_unix_time(1_700_000_000, 123_456_789);
        let ts = Timestamp::from_file_time(ft);
        assert_eq!(ts.to_file_time(), ft);
    }

    #[test]
    fn test_pre_epoch_time() {
        let ft = FileTime::from_unix_time(-5, 500_000_000);
        let ts = Timestamp::from_file_time(ft);
        assert_eq!(ts.as_nanos(), -4_500_000_000);
        assert_eq!(ts.to_file_time(), ft);
    }

    #[test]
    fn test_ordering_matches_chronology() {
        let older = Timestamp::from_file_time(FileTime::from_unix_time(100, 0));
        let newer = Timestamp::from_file_time(FileTime::from_unix_time(100, 1));
        assert!(older < newer);
    }
}
