//! Timestamp precision and clock helpers.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Precision of the timestamps handled by the engine.
///
/// Every timestamp crossing the public API, the WAL and the on-disk metadata
/// is an `i64` expressed in this unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampPrecision {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

/// Converts a wall-clock duration into timestamp units of the given precision.
pub fn duration_to_units(duration: Duration, precision: TimestampPrecision) -> i64 {
    match precision {
        TimestampPrecision::Nanoseconds => duration.as_nanos().min(i64::MAX as u128) as i64,
        TimestampPrecision::Microseconds => duration.as_micros().min(i64::MAX as u128) as i64,
        TimestampPrecision::Milliseconds => duration.as_millis().min(i64::MAX as u128) as i64,
        TimestampPrecision::Seconds => duration.as_secs().min(i64::MAX as u64) as i64,
    }
}

/// Returns the current Unix time in the given precision.
pub fn now_in_precision(precision: TimestampPrecision) -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    duration_to_units(since_epoch, precision)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_to_units() {
        let d = Duration::from_secs(2);
        assert_eq!(duration_to_units(d, TimestampPrecision::Seconds), 2);
        assert_eq!(duration_to_units(d, TimestampPrecision::Milliseconds), 2_000);
        assert_eq!(
            duration_to_units(d, TimestampPrecision::Microseconds),
            2_000_000
        );
        assert_eq!(
            duration_to_units(d, TimestampPrecision::Nanoseconds),
            2_000_000_000
        );
    }

    #[test]
    fn test_now_advances() {
        let a = now_in_precision(TimestampPrecision::Nanoseconds);
        let b = now_in_precision(TimestampPrecision::Nanoseconds);
        assert!(b >= a);
        assert!(a > 0);
    }
}
