//! Ingestion intervals and segment granularity.
//!
//! Time handling in this crate follows one stable, documented mapping:
//!
//! - An ingestion interval is a half-open UTC range `[start, end)`,
//!   serialized as a single ISO-8601 `start/end` string.
//! - A segment granularity defines fixed-width buckets counted forward
//!   from the Unix epoch (`1970-01-01T00:00:00Z`); bucket ids are
//!   `floor(epoch_seconds / bucket_len)`.
//! - An interval is only usable for indexing when it aligns to bucket
//!   boundaries, so the buckets partition it exactly: non-overlapping,
//!   contiguous, no partial bucket at either edge.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use roaring::RoaringBitmap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::{Backtrace, IntoError, Snafu};

const SECONDS_PER_MINUTE: i64 = 60;
const SECONDS_PER_HOUR: i64 = 60 * 60;
const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Discrete bucket identifier: whole buckets since the Unix epoch.
pub type BucketId = u64;

/// Errors raised while constructing or parsing a [`TimeInterval`].
#[derive(Debug, Snafu)]
pub enum IntervalError {
    /// The interval would be empty or inverted.
    #[snafu(display("Interval start {start} is not before end {end}"))]
    Empty {
        /// Requested inclusive start.
        start: DateTime<Utc>,
        /// Requested exclusive end.
        end: DateTime<Utc>,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The textual form is not `start/end`.
    #[snafu(display("Interval `{value}` is not of the form <start>/<end>"))]
    MissingSeparator {
        /// The offending input string.
        value: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// One of the two boundary timestamps failed to parse as RFC 3339.
    #[snafu(display("Interval boundary `{value}` is not a valid RFC 3339 timestamp"))]
    BadBoundary {
        /// The offending boundary text.
        value: String,
        /// The underlying chrono parse error.
        source: chrono::ParseError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

/// Half-open UTC time interval `[start, end)`.
///
/// The `start < end` invariant is enforced at construction, so an
/// instance is never empty. The wire form is a single string,
/// `2014-10-22T00:00:00.000Z/2014-10-23T00:00:00.000Z`, matching the
/// descriptor catalog format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeInterval {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeInterval {
    /// Creates an interval, rejecting `start >= end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, IntervalError> {
        if start >= end {
            return EmptySnafu { start, end }.fail();
        }
        Ok(Self { start, end })
    }

    /// Inclusive start of the interval.
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Exclusive end of the interval.
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Whether `ts` falls inside the half-open interval.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            self.start.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.end.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }
}

impl FromStr for TimeInterval {
    type Err = IntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start_str, end_str) = s.split_once('/').ok_or_else(|| {
            MissingSeparatorSnafu { value: s }.build()
        })?;

        let start = DateTime::parse_from_rfc3339(start_str)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|source| {
                BadBoundarySnafu {
                    value: start_str,
                }
                .into_error(source)
            })?;
        let end = DateTime::parse_from_rfc3339(end_str)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|source| {
                BadBoundarySnafu {
                    value: end_str,
                }
                .into_error(source)
            })?;

        Self::new(start, end)
    }
}

impl Serialize for TimeInterval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeInterval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Fixed-width segment bucket size.
///
/// Buckets are epoch-anchored: bucket 0 starts at the Unix epoch and
/// bucket `n` covers `[n * len, (n + 1) * len)` seconds. Sub-second
/// granularities are not supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentGranularity {
    /// Buckets of `n` whole seconds.
    Seconds(u32),
    /// Buckets of `n` whole minutes.
    Minutes(u32),
    /// Buckets of `n` whole hours.
    Hours(u32),
    /// Buckets of `n` whole days (calendar-free, 86400-second days).
    Days(u32),
}

impl SegmentGranularity {
    /// Bucket length in whole seconds.
    pub fn len_secs(&self) -> i64 {
        match *self {
            SegmentGranularity::Seconds(n) => n as i64,
            SegmentGranularity::Minutes(n) => (n as i64) * SECONDS_PER_MINUTE,
            SegmentGranularity::Hours(n) => (n as i64) * SECONDS_PER_HOUR,
            SegmentGranularity::Days(n) => (n as i64) * SECONDS_PER_DAY,
        }
    }

    /// Whether the width is non-zero. Zero-width granularities are
    /// rejected by spec validation before any bucket math runs.
    pub fn is_valid(&self) -> bool {
        self.len_secs() > 0
    }

    /// Map a timestamp into its bucket id.
    ///
    /// Uses Euclidean division so the mapping stays monotonic for any
    /// input; pre-epoch timestamps clamp to bucket 0 (ingestion intervals
    /// are validated to start at or after the epoch, so routing never
    /// hits the clamp).
    pub fn bucket_id(&self, ts: DateTime<Utc>) -> BucketId {
        let len_secs = self.len_secs();
        debug_assert!(len_secs > 0, "granularity width must be positive");

        let bucket = ts.timestamp().div_euclid(len_secs);
        debug_assert!(
            bucket >= 0,
            "bucket_id received pre-epoch timestamp: {ts:?} -> bucket {bucket}"
        );
        if bucket < 0 { 0 } else { bucket as BucketId }
    }

    /// Reconstruct the half-open interval covered by bucket `id`.
    ///
    /// Returns `None` only when the bucket lies outside chrono's
    /// representable range, which spec validation makes unreachable for
    /// real jobs.
    pub fn bucket_interval(&self, id: BucketId) -> Option<TimeInterval> {
        let len_secs = self.len_secs();
        let start_secs = i64::try_from(id).ok()?.checked_mul(len_secs)?;
        let end_secs = start_secs.checked_add(len_secs)?;

        let start = DateTime::<Utc>::from_timestamp(start_secs, 0)?;
        let end = DateTime::<Utc>::from_timestamp(end_secs, 0)?;
        TimeInterval::new(start, end).ok()
    }

    /// Whether `interval` starts and ends exactly on bucket boundaries.
    pub fn aligns_with(&self, interval: &TimeInterval) -> bool {
        let len_secs = self.len_secs();
        if len_secs <= 0 {
            return false;
        }
        interval.start().timestamp().rem_euclid(len_secs) == 0
            && interval.end().timestamp().rem_euclid(len_secs) == 0
    }

    /// Bitmap of every bucket id intersecting the half-open `interval`.
    ///
    /// The driver uses this as the expected-bucket set for completeness
    /// accounting. Bucket ids are assumed to fit in `u32`, which holds
    /// for any second-or-wider granularity until well past year 2100.
    pub fn expected_bucket_ids(&self, interval: &TimeInterval) -> RoaringBitmap {
        let first = self.bucket_id(interval.start());
        // Pull the exclusive end back by one nanosecond so a boundary end
        // timestamp does not drag in the next bucket.
        let last = self.bucket_id(interval.end() - chrono::Duration::nanoseconds(1));

        RoaringBitmap::from_iter((first..=last).map(|b| {
            debug_assert!(b <= u32::MAX as u64, "bucket id {b} exceeds u32::MAX");
            b as u32
        }))
    }
}

/// Ingestion interval plus the segment granularity that tiles it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GranularitySpec {
    /// Half-open interval rows must fall into; rows outside are dropped.
    pub interval: TimeInterval,
    /// Width of each segment bucket.
    pub segment_granularity: SegmentGranularity,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s)
            .single()
            .expect("valid UTC timestamp")
    }

    #[test]
    fn interval_rejects_inverted_and_empty() {
        let t = utc(2014, 10, 22, 0, 0, 0);
        assert!(TimeInterval::new(t, t).is_err());
        assert!(TimeInterval::new(t + chrono::Duration::seconds(1), t).is_err());
    }

    #[test]
    fn interval_contains_is_half_open() {
        let iv = TimeInterval::new(utc(2014, 10, 22, 0, 0, 0), utc(2014, 10, 23, 0, 0, 0))
            .expect("valid interval");

        assert!(iv.contains(iv.start()));
        assert!(iv.contains(utc(2014, 10, 22, 23, 59, 59)));
        assert!(!iv.contains(iv.end()));
        assert!(!iv.contains(utc(2014, 10, 21, 23, 59, 59)));
    }

    #[test]
    fn interval_display_and_parse_round_trip() {
        let iv = TimeInterval::new(utc(2014, 10, 22, 0, 0, 0), utc(2014, 10, 24, 0, 0, 0))
            .expect("valid interval");

        let text = iv.to_string();
        assert_eq!(
            text,
            "2014-10-22T00:00:00.000Z/2014-10-24T00:00:00.000Z"
        );

        let parsed: TimeInterval = text.parse().expect("parse back");
        assert_eq!(parsed, iv);
    }

    #[test]
    fn interval_parse_rejects_garbage() {
        assert!("2014-10-22T00:00:00Z".parse::<TimeInterval>().is_err());
        assert!("not-a-date/2014-10-23T00:00:00Z"
            .parse::<TimeInterval>()
            .is_err());
        assert!("2014-10-23T00:00:00Z/2014-10-22T00:00:00Z"
            .parse::<TimeInterval>()
            .is_err());
    }

    #[test]
    fn interval_serde_uses_single_string() {
        let iv = TimeInterval::new(utc(2014, 10, 22, 0, 0, 0), utc(2014, 10, 23, 0, 0, 0))
            .expect("valid interval");

        let json = serde_json::to_string(&iv).expect("serialize");
        assert_eq!(
            json,
            "\"2014-10-22T00:00:00.000Z/2014-10-23T00:00:00.000Z\""
        );
        let back: TimeInterval = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, iv);
    }

    #[test]
    fn day_bucket_id_and_interval_round_trip() {
        let g = SegmentGranularity::Days(1);
        let ts = utc(2014, 10, 22, 13, 45, 0);

        let id = g.bucket_id(ts);
        // 2014-10-22T00:00:00Z is exactly 16365 days after the epoch.
        assert_eq!(id, 16365);

        let iv = g.bucket_interval(id).expect("representable bucket");
        assert_eq!(iv.start(), utc(2014, 10, 22, 0, 0, 0));
        assert_eq!(iv.end(), utc(2014, 10, 23, 0, 0, 0));
        assert!(iv.contains(ts));
    }

    #[test]
    fn bucket_ids_are_monotonic_across_boundary() {
        let g = SegmentGranularity::Hours(1);
        let base = utc(2014, 10, 22, 9, 0, 0);

        let b0 = g.bucket_id(base);
        let b1 = g.bucket_id(base + chrono::Duration::minutes(59));
        let b2 = g.bucket_id(base + chrono::Duration::hours(1));

        assert_eq!(b0, b1);
        assert_eq!(b2, b0 + 1);
    }

    #[test]
    fn len_secs_covers_variants() {
        assert_eq!(SegmentGranularity::Seconds(7).len_secs(), 7);
        assert_eq!(SegmentGranularity::Minutes(3).len_secs(), 180);
        assert_eq!(SegmentGranularity::Hours(2).len_secs(), 7200);
        assert_eq!(SegmentGranularity::Days(1).len_secs(), 86400);
        assert!(!SegmentGranularity::Seconds(0).is_valid());
    }

    #[test]
    fn alignment_checks_both_edges() {
        let g = SegmentGranularity::Days(1);

        let aligned = TimeInterval::new(utc(2014, 10, 22, 0, 0, 0), utc(2014, 10, 24, 0, 0, 0))
            .expect("valid interval");
        assert!(g.aligns_with(&aligned));

        let ragged_start =
            TimeInterval::new(utc(2014, 10, 22, 6, 0, 0), utc(2014, 10, 24, 0, 0, 0))
                .expect("valid interval");
        assert!(!g.aligns_with(&ragged_start));

        let ragged_end = TimeInterval::new(utc(2014, 10, 22, 0, 0, 0), utc(2014, 10, 23, 18, 0, 0))
            .expect("valid interval");
        assert!(!g.aligns_with(&ragged_end));
    }

    #[test]
    fn expected_bucket_ids_partition_the_interval() {
        let g = SegmentGranularity::Days(1);
        let iv = TimeInterval::new(utc(2014, 10, 22, 0, 0, 0), utc(2014, 10, 24, 0, 0, 0))
            .expect("valid interval");

        let ids = g.expected_bucket_ids(&iv);
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(16365));
        assert!(ids.contains(16366));
        // The bucket starting at the exclusive end is not expected.
        assert!(!ids.contains(16367));

        // Reconstructed bucket intervals tile the ingestion interval with
        // no gaps and no overlap.
        let mut cursor = iv.start();
        for id in ids.iter() {
            let bucket = g
                .bucket_interval(id as BucketId)
                .expect("representable bucket");
            assert_eq!(bucket.start(), cursor);
            cursor = bucket.end();
        }
        assert_eq!(cursor, iv.end());
    }

    #[test]
    fn hour_granularity_expected_ids_count() {
        let g = SegmentGranularity::Hours(6);
        let iv = TimeInterval::new(utc(2014, 10, 22, 0, 0, 0), utc(2014, 10, 23, 0, 0, 0))
            .expect("valid interval");

        assert!(g.aligns_with(&iv));
        assert_eq!(g.expected_bucket_ids(&iv).len(), 4);
    }
}
