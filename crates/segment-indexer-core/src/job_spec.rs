//! Job specification model.
//!
//! An index job is configured entirely up front by an [`IndexJobSpec`]:
//! the input row shape, the timestamp column and format, the dimension
//! and metric (aggregator) lists, the ingestion interval with its segment
//! granularity, the hash-partition count, and tuning knobs. Bucket and
//! partition counts derive from this spec alone, never from incidental
//! execution-environment parallelism hints, so the full set of expected
//! (bucket, partition) work units is known before any row is read.
//!
//! All spec types are plain serde data; [`IndexJobSpec::validate`] checks
//! the cross-field invariants (column references resolve, the interval
//! aligns to the granularity, partition count is non-zero).

pub mod granularity;
pub mod schema;

pub use granularity::{
    BucketId, GranularitySpec, IntervalError, SegmentGranularity, TimeInterval,
};
pub use schema::{
    AggregatorSpec, DataSchema, IndexJobSpec, PartitionsSpec, RowFormat, SpecError,
    TimestampFormat, TimestampSpec, TuningConfig,
};
