//! Wrapper prelude.
//!
//! The `segment-indexer` crate is the supported public entry point.
//! Downstream code should prefer importing from this prelude instead of
//! depending on internal core module paths.

pub use crate::sketch;
pub use crate::{
    publish, run_index_job, AggregatorSpec, DataSchema, DescriptorCatalog,
    FileDescriptorCatalog, GranularitySpec, IndexJobSpec, JobError, JobReport, LoadSpec,
    OutputLocation, PartitionsSpec, PublishOutcome, RowFormat, SegmentDescriptor,
    SegmentGranularity, ShardSpec, TimeInterval, TimestampFormat, TimestampSpec, TuningConfig,
    UnitKey, UnitOutcome, UnitState,
};
