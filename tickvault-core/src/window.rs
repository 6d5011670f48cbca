//! Timeframe parsing and partition window arithmetic.
//!
//! Every archived series is cut into fixed windows of time, one partition
//! file per window. The window length depends on the sampling granularity:
//! fine-grained series get daily files, coarser series get ~monthly files.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};

use crate::provider::DataError;

/// Parse a timeframe label of the form `<int><unit>` into a duration.
///
/// Supported units are `s`, `m`, `h` and `d`, matched by their first
/// occurrence in the label — so `"1m"` is one minute, never one month.
///
/// Returns [`DataError::UnsupportedTimeframe`] for an unknown unit or a
/// non-integer quantity.
pub fn duration_from_label(label: &str) -> Result<Duration, DataError> {
    let units: [(char, fn(i64) -> Duration); 4] = [
        ('s', Duration::seconds),
        ('m', Duration::minutes),
        ('h', Duration::hours),
        ('d', Duration::days),
    ];
    for (unit, to_duration) in units {
        if let Some(idx) = label.find(unit) {
            let quantity: i64 = label[..idx]
                .parse()
                .map_err(|_| DataError::UnsupportedTimeframe(label.to_string()))?;
            return Ok(to_duration(quantity));
        }
    }
    Err(DataError::UnsupportedTimeframe(label.to_string()))
}

/// Partition window length for a given sampling granularity.
///
/// Sub-hourly series are partitioned per day. Hourly and coarser series all
/// land in ~monthly (31-day) windows: daily-or-coarser granularities do NOT
/// get a longer yearly window even though [`period_start`] aligns them to
/// January 1. This matches the established archive layout on disk; changing
/// the tiering would orphan every existing coarse-granularity partition.
pub fn partition_window(granularity: Duration) -> Duration {
    if granularity < Duration::hours(1) {
        Duration::days(1)
    } else {
        Duration::days(31)
    }
}

/// Floor an instant to the start of its enclosing partition period.
///
/// Daily-or-coarser granularities floor to January 1 of the instant's year,
/// hourly-or-coarser to the first of the month. Sub-hourly instants are
/// returned unchanged: daily alignment is the caller's stepping
/// responsibility (fetch walks from a date boundary in whole windows).
pub fn period_start(granularity: Duration, instant: DateTime<Utc>) -> DateTime<Utc> {
    if granularity >= Duration::days(1) {
        Utc.with_ymd_and_hms(instant.year(), 1, 1, 0, 0, 0).unwrap()
    } else if granularity >= Duration::hours(1) {
        Utc.with_ymd_and_hms(instant.year(), instant.month(), 1, 0, 0, 0)
            .unwrap()
    } else {
        instant
    }
}
