//! Batch index job driver.
//!
//! [`run_index_job`] takes raw delimited lines end to end: it parses and
//! routes each line to its (bucket, partition) work unit, fans the units
//! out as bounded tokio tasks, and has each unit aggregate, package, and
//! publish its own segment. Units share nothing but the append-only
//! descriptor catalog, so one unit's failure never blocks the rest; the
//! run finishes by re-scanning the catalog and reporting per-unit
//! outcomes plus routing counters in a [`JobReport`].
//!
//! A unit moves through `pending -> aggregating -> packaged ->
//! published`, and can fail out of `aggregating` (data quality,
//! archive write) or `packaged` (publish conflict). The driver
//! concurrency bound and the spec's advisory runtime properties are
//! scheduling hints only; routing and segment content depend solely on
//! the job spec.
//!
//! Dropping the returned future stops issuing new units. Archives are
//! written atomically and catalog entries are complete-or-absent, so
//! everything already published stays valid.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use roaring::RoaringBitmap;
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::aggregate::{AggregateError, RowAggregator};
use crate::catalog::{self, CatalogError, DescriptorCatalog, PublishOutcome};
use crate::job_spec::{BucketId, IndexJobSpec, SpecError};
use crate::packaging::{self, PackagingError};
use crate::rows::{ParsedRow, RowParser};
use crate::segment::SegmentDescriptor;
use crate::sharding::{AssignError, ShardAssigner, UnitKey};
use crate::storage::OutputLocation;

/// Job-scope failures. Unit-scope failures live in [`UnitError`] and
/// are reported per unit, not raised here.
#[derive(Debug, Snafu)]
pub enum JobError {
    /// The job spec failed validation.
    #[snafu(display("Invalid job spec: {source}"))]
    Spec {
        /// The underlying validation error.
        #[snafu(backtrace)]
        source: SpecError,
    },

    /// Too many input lines could not be parsed into rows.
    #[snafu(display(
        "{malformed} of {read} input lines are malformed, above the tolerated \
         fraction {max_fraction}"
    ))]
    RoutingQuality {
        /// Lines that failed to parse.
        malformed: u64,
        /// Non-blank lines consumed.
        read: u64,
        /// Configured `max_skipped_row_fraction`.
        max_fraction: f64,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A unit task stopped without reporting an outcome.
    #[snafu(display("Unit task failed to complete: {source}"))]
    UnitTask {
        /// The underlying join error.
        source: tokio::task::JoinError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The completeness scan over the catalog failed.
    #[snafu(display("Catalog verification failed: {source}"))]
    Verify {
        /// The underlying catalog error.
        #[snafu(backtrace)]
        source: CatalogError,
    },
}

/// Failures scoped to a single (bucket, partition) unit.
#[derive(Debug, Snafu)]
pub enum UnitError {
    /// The unit's bucket id does not map back to a representable
    /// interval.
    #[snafu(display("Bucket {bucket_id} is outside the representable time range"))]
    BucketRange {
        /// The offending bucket id.
        bucket_id: BucketId,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Aggregation failed, or the unit's skip rate broke the tolerance.
    #[snafu(display("Aggregation failed: {source}"))]
    Aggregate {
        /// The underlying aggregation error.
        #[snafu(backtrace)]
        source: AggregateError,
    },

    /// Writing the unit's archive or descriptor sidecar failed.
    #[snafu(display("Packaging failed: {source}"))]
    Package {
        /// The underlying packaging error.
        #[snafu(backtrace)]
        source: PackagingError,
    },

    /// Recording the unit's descriptor in the catalog failed.
    #[snafu(display("Publishing failed: {source}"))]
    Publish {
        /// The underlying catalog error.
        #[snafu(backtrace)]
        source: CatalogError,
    },
}

impl UnitError {
    /// The state the unit failed out of.
    pub fn failed_from(&self) -> UnitState {
        match self {
            UnitError::BucketRange { .. }
            | UnitError::Aggregate { .. }
            | UnitError::Package { .. } => UnitState::Aggregating,
            UnitError::Publish { .. } => UnitState::Packaged,
        }
    }
}

/// Lifecycle of one work unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitState {
    /// Routed rows are waiting for a task slot.
    Pending,
    /// Folding rows into metric accumulators.
    Aggregating,
    /// Archive and descriptor sidecar are on disk.
    Packaged,
    /// The descriptor is in the catalog.
    Published,
    /// Terminal failure; other units are unaffected.
    Failed,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnitState::Pending => "pending",
            UnitState::Aggregating => "aggregating",
            UnitState::Packaged => "packaged",
            UnitState::Published => "published",
            UnitState::Failed => "failed",
        })
    }
}

/// Facts about a unit whose descriptor reached the catalog.
#[derive(Clone, Debug)]
pub struct PublishedUnit {
    /// The published descriptor.
    pub descriptor: SegmentDescriptor,
    /// Archive path relative to the output root.
    pub archive_rel: PathBuf,
    /// Input rows routed to this unit.
    pub rows_routed: u64,
    /// Routed rows skipped for malformed metric values.
    pub rows_skipped: u64,
    /// Aggregated rows written into the archive.
    pub rows_aggregated: u64,
    /// True when an identical descriptor was already in the catalog.
    pub republished: bool,
}

/// Terminal outcome of one work unit.
#[derive(Debug)]
pub enum UnitOutcome {
    /// The unit's descriptor is in the catalog.
    Published(PublishedUnit),
    /// The unit failed; see [`UnitError::failed_from`] for the edge.
    Failed {
        /// What went wrong.
        error: UnitError,
    },
}

impl UnitOutcome {
    /// Terminal state of the unit.
    pub fn state(&self) -> UnitState {
        match self {
            UnitOutcome::Published(_) => UnitState::Published,
            UnitOutcome::Failed { .. } => UnitState::Failed,
        }
    }
}

/// Counters and per-unit outcomes for one job run.
#[derive(Debug)]
pub struct JobReport {
    /// Non-blank input lines consumed.
    pub rows_read: u64,
    /// Lines dropped at routing because they could not be parsed.
    pub rows_malformed: u64,
    /// Parsed rows whose timestamp fell outside the ingestion interval.
    pub rows_out_of_interval: u64,
    /// Every bucket id the configured interval tiles into.
    pub expected_buckets: RoaringBitmap,
    /// Terminal outcome per unit that received rows.
    pub units: BTreeMap<UnitKey, UnitOutcome>,
    /// Catalog scan for this job's version after all units finished.
    pub published: Vec<SegmentDescriptor>,
    /// Units that published but were absent from the final scan.
    pub missing_from_catalog: Vec<UnitKey>,
}

impl JobReport {
    /// True when every unit published and the final catalog scan
    /// confirmed all of them.
    pub fn succeeded(&self) -> bool {
        self.missing_from_catalog.is_empty()
            && self
                .units
                .values()
                .all(|outcome| matches!(outcome, UnitOutcome::Published(_)))
    }

    /// The units that reached the catalog.
    pub fn published_units(&self) -> impl Iterator<Item = (&UnitKey, &PublishedUnit)> {
        self.units.iter().filter_map(|(key, outcome)| match outcome {
            UnitOutcome::Published(unit) => Some((key, unit)),
            UnitOutcome::Failed { .. } => None,
        })
    }
}

/// Run an index job over raw delimited lines.
///
/// Routing happens inline; each non-empty unit then runs as its own
/// tokio task, bounded by `tuning.max_parallel_units` (unbounded when
/// unset). The returned report records every unit's terminal state,
/// so callers must check [`JobReport::succeeded`]; only job-scope
/// problems (invalid spec, routing quality, a lost task, a failed
/// verification scan) surface as [`JobError`].
pub async fn run_index_job<I>(
    spec: &IndexJobSpec,
    lines: I,
    location: &OutputLocation,
    catalog: Arc<dyn DescriptorCatalog>,
) -> Result<JobReport, JobError>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    spec.validate().context(SpecSnafu)?;
    let parser = RowParser::from_schema(&spec.schema).context(SpecSnafu)?;
    let assigner = ShardAssigner::from_spec(spec).context(SpecSnafu)?;
    let expected_buckets = spec
        .granularity
        .segment_granularity
        .expected_bucket_ids(&spec.granularity.interval);

    let mut units: BTreeMap<UnitKey, Vec<ParsedRow>> = BTreeMap::new();
    let mut rows_read: u64 = 0;
    let mut rows_malformed: u64 = 0;
    let mut rows_out_of_interval: u64 = 0;

    for line in lines {
        let line = line.as_ref();
        if line.trim().is_empty() {
            continue;
        }
        rows_read += 1;

        let row = match parser.parse_line(line) {
            Ok(row) => row,
            Err(e) => {
                rows_malformed += 1;
                log::warn!("Skipping malformed input line: {e}");
                continue;
            }
        };
        match assigner.assign(&row) {
            Ok(key) => {
                debug_assert!(
                    expected_buckets.contains(key.bucket_id as u32),
                    "assigned bucket {} is outside the configured interval",
                    key.bucket_id
                );
                units.entry(key).or_default().push(row);
            }
            Err(e @ AssignError::OutOfInterval { .. }) => {
                rows_out_of_interval += 1;
                log::warn!("Dropping row: {e}");
            }
        }
    }

    let max_fraction = spec.tuning.max_skipped_row_fraction;
    if rows_malformed > 0 && rows_malformed as f64 / rows_read as f64 > max_fraction {
        return RoutingQualitySnafu {
            malformed: rows_malformed,
            read: rows_read,
            max_fraction,
        }
        .fail();
    }

    // A zero bound would stall every unit; the smallest usable bound is
    // one task at a time.
    let permits = spec.tuning.max_parallel_units.unwrap_or(units.len()).max(1);
    let semaphore = Arc::new(Semaphore::new(permits));
    let spec = Arc::new(spec.clone());

    let mut tasks: JoinSet<(UnitKey, Result<PublishedUnit, UnitError>)> = JoinSet::new();
    for (key, rows) in units {
        let spec = Arc::clone(&spec);
        let location = location.clone();
        let catalog = Arc::clone(&catalog);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            // The semaphore is never closed.
            let _permit = semaphore.acquire_owned().await.ok();
            let result = run_unit(&spec, &location, catalog.as_ref(), key, rows).await;
            (key, result)
        });
    }

    let mut outcomes: BTreeMap<UnitKey, UnitOutcome> = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        let (key, result) = joined.context(UnitTaskSnafu)?;
        match result {
            Ok(unit) => {
                outcomes.insert(key, UnitOutcome::Published(unit));
            }
            Err(error) => {
                log::warn!("Unit {key} failed from {}: {error}", error.failed_from());
                outcomes.insert(key, UnitOutcome::Failed { error });
            }
        }
    }

    let published = catalog::list_published(
        catalog.as_ref(),
        &spec.schema.data_source,
        &spec.tuning.version,
    )
    .await
    .context(VerifySnafu)?;

    let missing_from_catalog: Vec<UnitKey> = outcomes
        .iter()
        .filter_map(|(key, outcome)| match outcome {
            UnitOutcome::Published(unit) if !published.contains(&unit.descriptor) => {
                Some(*key)
            }
            _ => None,
        })
        .collect();

    let published_count = outcomes
        .values()
        .filter(|o| matches!(o, UnitOutcome::Published(_)))
        .count();
    log::info!(
        "Index job for {} version {}: {published_count}/{} units published, \
         {rows_read} rows read, {rows_malformed} malformed, \
         {rows_out_of_interval} out of interval",
        spec.schema.data_source,
        spec.tuning.version,
        outcomes.len(),
    );

    Ok(JobReport {
        rows_read,
        rows_malformed,
        rows_out_of_interval,
        expected_buckets,
        units: outcomes,
        published,
        missing_from_catalog,
    })
}

/// Take one unit from routed rows to a published descriptor.
async fn run_unit(
    spec: &IndexJobSpec,
    location: &OutputLocation,
    catalog: &dyn DescriptorCatalog,
    key: UnitKey,
    rows: Vec<ParsedRow>,
) -> Result<PublishedUnit, UnitError> {
    let interval = spec
        .granularity
        .segment_granularity
        .bucket_interval(key.bucket_id)
        .ok_or_else(|| BucketRangeSnafu { bucket_id: key.bucket_id }.build())?;

    log::debug!(
        "Unit {key}: {} -> {} ({} rows)",
        UnitState::Pending,
        UnitState::Aggregating,
        rows.len()
    );
    let rows_routed = rows.len() as u64;
    let mut aggregator = RowAggregator::from_spec(spec).context(AggregateSnafu)?;
    for row in &rows {
        aggregator.add_row(row);
    }
    let rows_skipped = aggregator.rows_skipped();
    let aggregated = aggregator.finish().context(AggregateSnafu)?;

    let packaged =
        packaging::pack_segment(location, spec, &interval, key.partition_index, &aggregated)
            .await
            .context(PackageSnafu)?;
    log::debug!(
        "Unit {key}: {} -> {}",
        UnitState::Aggregating,
        UnitState::Packaged
    );

    let outcome = catalog::publish(catalog, &packaged.descriptor)
        .await
        .context(PublishSnafu)?;
    log::debug!(
        "Unit {key}: {} -> {}",
        UnitState::Packaged,
        UnitState::Published
    );

    Ok(PublishedUnit {
        descriptor: packaged.descriptor,
        archive_rel: packaged.archive_rel,
        rows_routed,
        rows_skipped,
        rows_aggregated: packaged.row_count,
        republished: outcome == PublishOutcome::AlreadyPublished,
    })
}
