//! Deterministic routing of rows to (bucket, partition) work units.
//!
//! A row's destination is a pure function of the job spec and the row
//! itself: the event timestamp picks the time bucket, and a stable hash
//! of the partition-key dimension values picks the partition within it.
//! Nothing about the execution environment (worker counts, scheduling
//! hints, retry attempts) enters the computation, so re-running a job
//! or running it at different parallelism yields byte-identical shard
//! assignment.

use std::fmt;

use chrono::{DateTime, Utc};
use snafu::{Backtrace, OptionExt, Snafu};

use crate::job_spec::granularity::{BucketId, SegmentGranularity, TimeInterval};
use crate::job_spec::schema::{
    IndexJobSpec, PartitionKeyNotDimensionSnafu, SpecError, ZeroPartitionsSnafu,
};
use crate::rows::ParsedRow;

const SHARD_KEY_TAG: &[u8] = b"shard-key-v1";

/// Error raised when a row cannot be routed.
#[derive(Debug, Snafu)]
pub enum AssignError {
    /// The event timestamp falls outside the ingestion interval. Such
    /// rows are dropped and counted, never written to any segment.
    #[snafu(display(
        "Event timestamp {} is outside the ingestion interval {interval}",
        timestamp.to_rfc3339()
    ))]
    OutOfInterval {
        /// The offending event timestamp.
        timestamp: DateTime<Utc>,
        /// The ingestion interval that excludes it.
        interval: TimeInterval,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

/// Identity of one work unit: a time bucket and a partition within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitKey {
    /// Epoch-anchored bucket id (see
    /// [`SegmentGranularity::bucket_id`]).
    pub bucket_id: BucketId,
    /// Partition index in `0..partition_count`.
    pub partition_index: u32,
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket_id, self.partition_index)
    }
}

/// Stable partition-key hash: blake3 over the domain tag
/// `shard-key-v1` followed by each key value prefixed with a single
/// zero byte, taking the first 8 digest bytes as a little-endian
/// `u64`. The recipe is fixed; partition layout must survive re-runs
/// and mixed-version fleets.
pub fn shard_hash_v1(values: &[&str]) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(SHARD_KEY_TAG);
    for v in values {
        hasher.update(b"\0");
        hasher.update(v.as_bytes());
    }

    let digest = hasher.finalize();
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(first)
}

/// Routes parsed rows to work units for one job.
#[derive(Clone, Debug)]
pub struct ShardAssigner {
    interval: TimeInterval,
    granularity: SegmentGranularity,
    partition_count: u32,
    key_indexes: Vec<usize>,
}

impl ShardAssigner {
    /// Build an assigner from a job spec, resolving the partition-key
    /// dimensions to positions in the parsed dimension tuple.
    pub fn from_spec(spec: &IndexJobSpec) -> Result<Self, SpecError> {
        if spec.partitions.partition_count == 0 {
            return ZeroPartitionsSnafu.fail();
        }

        let key_indexes = spec
            .partition_key_dimensions()
            .iter()
            .map(|key| {
                spec.schema
                    .dimensions
                    .iter()
                    .position(|d| d == key)
                    .context(PartitionKeyNotDimensionSnafu { column: key })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            interval: spec.granularity.interval,
            granularity: spec.granularity.segment_granularity,
            partition_count: spec.partitions.partition_count,
            key_indexes,
        })
    }

    /// Route one row to its work unit.
    ///
    /// The row must come from the same schema this assigner was built
    /// from, so the partition-key indexes line up with its dimensions.
    pub fn assign(&self, row: &ParsedRow) -> Result<UnitKey, AssignError> {
        if !self.interval.contains(row.timestamp) {
            return OutOfIntervalSnafu {
                timestamp: row.timestamp,
                interval: self.interval,
            }
            .fail();
        }
        debug_assert!(
            self.key_indexes.iter().all(|&i| i < row.dimensions.len()),
            "row dimensions do not match the assigner's schema"
        );

        let key: Vec<&str> = self
            .key_indexes
            .iter()
            .map(|&i| row.dimensions[i].as_str())
            .collect();

        Ok(UnitKey {
            bucket_id: self.granularity.bucket_id(row.timestamp),
            partition_index: (shard_hash_v1(&key) % u64::from(self.partition_count)) as u32,
        })
    }
}
