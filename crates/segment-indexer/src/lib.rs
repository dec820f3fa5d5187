//! # segment-indexer
//!
//! Batch segment generation: turn flat delimited rows into immutable,
//! versioned, time-partitioned, hash-sharded segments plus a durable
//! descriptor catalog that makes them discoverable.
//!
//! This crate is the supported public entry point and provides a small,
//! stable surface over `segment-indexer-core`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use segment_indexer::prelude::*;
//! ```

/// Convenience prelude with the stable, supported surface.
pub mod prelude;

/// Distinct-count sketch namespace (wrapper-only).
pub mod sketch {
    pub use segment_indexer_core::sketch::{HllSketch, SketchError, MAX_PRECISION, MIN_PRECISION};
}

pub use segment_indexer_core::aggregate::{
    AggregateError, AggregatedRow, MetricValue, RowAggregator,
};
pub use segment_indexer_core::catalog::{
    list_published, publish, CatalogError, DescriptorCatalog, FileDescriptorCatalog,
    PublishOutcome, PutOutcome,
};
pub use segment_indexer_core::job::{
    run_index_job, JobError, JobReport, PublishedUnit, UnitError, UnitOutcome, UnitState,
};
pub use segment_indexer_core::job_spec::{
    AggregatorSpec, BucketId, DataSchema, GranularitySpec, IndexJobSpec, IntervalError,
    PartitionsSpec, RowFormat, SegmentGranularity, SpecError, TimeInterval, TimestampFormat,
    TimestampSpec, TuningConfig,
};
pub use segment_indexer_core::packaging::{
    pack_segment, read_archive, read_segment, PackagedSegment, PackagingError, UnpackedSegment,
};
pub use segment_indexer_core::rows::{ParsedRow, RowParseError, RowParser};
pub use segment_indexer_core::segment::{
    DecodedIndex, IndexFileError, IndexMeta, LoadSpec, SegmentDescriptor, ShardSpec,
    SEGMENT_BINARY_VERSION,
};
pub use segment_indexer_core::sharding::{AssignError, ShardAssigner, UnitKey};
pub use segment_indexer_core::storage::{OutputLocation, StorageError};
