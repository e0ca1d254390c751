//! Time utilities for proxy-fleet
//!
//! Bucket arithmetic for the snapshot series.

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::stats::SeriesKind;

/// Floor `ts` to a multiple of `bucket` since the Unix epoch.
///
/// Buckets are aligned to UTC; a zero or negative bucket returns `ts` unchanged.
///
/// # Examples
/// ```
/// use chrono::{Duration, TimeZone, Utc};
/// use pf_core::time::floor_to;
///
/// let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 7, 42).unwrap();
/// let floored = floor_to(ts, Duration::minutes(5));
/// assert_eq!(floored, Utc.with_ymd_and_hms(2024, 5, 1, 10, 5, 0).unwrap());
/// ```
pub fn floor_to(ts: DateTime<Utc>, bucket: Duration) -> DateTime<Utc> {
    let width = bucket.num_seconds();
    if width <= 0 {
        return ts;
    }
    let secs = ts.timestamp();
    let floored = secs - secs.rem_euclid(width);
    Utc.timestamp_opt(floored, 0).single().unwrap_or(ts)
}

/// Start of the bucket of `series` that contains `ts`
pub fn bucket_start(series: SeriesKind, ts: DateTime<Utc>) -> DateTime<Utc> {
    floor_to(ts, series.bucket())
}

/// Start of the last bucket of `series` that has fully elapsed at `now`
pub fn previous_bucket(series: SeriesKind, now: DateTime<Utc>) -> DateTime<Utc> {
    bucket_start(series, now) - series.bucket()
}
