//! Input schema, aggregator, partition, and tuning spec types.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};

use crate::job_spec::granularity::GranularitySpec;
use crate::layout::{self, LayoutError};
use crate::sketch::{MAX_PRECISION, MIN_PRECISION};

/// Default sketch precision (2^11 registers), matching the original
/// distinct-count aggregator this job descends from.
pub const DEFAULT_SKETCH_PRECISION: u8 = 11;

fn default_delimiter() -> char {
    ','
}

fn default_sketch_precision() -> u8 {
    DEFAULT_SKETCH_PRECISION
}

/// Errors raised by [`IndexJobSpec::validate`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SpecError {
    /// The partition count was zero.
    #[snafu(display("Partition count must be at least 1"))]
    ZeroPartitions {
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The segment granularity has zero width.
    #[snafu(display("Segment granularity must have a positive width"))]
    ZeroWidthGranularity {
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The ingestion interval does not start and end on bucket boundaries.
    #[snafu(display(
        "Ingestion interval {interval} does not align to the segment granularity"
    ))]
    MisalignedInterval {
        /// The offending interval, rendered as `start/end`.
        interval: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The ingestion interval starts before the Unix epoch.
    #[snafu(display("Ingestion interval start {start} is before the Unix epoch"))]
    PreEpochInterval {
        /// The offending start boundary, rendered as RFC 3339.
        start: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A spec field references a column the row format does not carry.
    #[snafu(display("Unknown {role} column `{column}` (not in the row format)"))]
    UnknownColumn {
        /// The missing column name.
        column: String,
        /// Which role referenced it (timestamp, dimension, metric input).
        role: &'static str,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A partition-key column is not one of the configured dimensions.
    #[snafu(display("Partition dimension `{column}` is not a configured dimension"))]
    PartitionKeyNotDimension {
        /// The offending column name.
        column: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Two output columns (dimensions or metric names) share a name.
    #[snafu(display("Duplicate output column name `{name}`"))]
    DuplicateName {
        /// The duplicated name.
        name: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A chrono pattern was empty.
    #[snafu(display("Timestamp pattern must not be empty"))]
    EmptyPattern {
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A distinct-count aggregator asks for an unsupported precision.
    #[snafu(display("Sketch precision {precision} is outside the supported 4..=16 range"))]
    BadSketchPrecision {
        /// The offending precision.
        precision: u8,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The data source or version is not usable as a path component.
    #[snafu(display("Invalid {role} `{value}`"))]
    UnusablePathComponent {
        /// The offending value.
        value: String,
        /// Which spec field carried it.
        role: &'static str,
        /// The underlying layout validation error.
        #[snafu(backtrace)]
        source: LayoutError,
    },
}

/// Positional layout of the delimited input lines.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFormat {
    /// Field delimiter, one character.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Column name for each position, in order.
    pub columns: Vec<String>,
}

/// How the timestamp column is encoded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampFormat {
    /// RFC 3339 / ISO-8601 text (`2014-10-22T00:00:00Z`).
    Iso8601,
    /// Integer milliseconds since the Unix epoch.
    EpochMillis,
    /// A chrono strftime pattern, e.g. `%Y%m%d%H` for `2014102200`.
    /// Components the pattern omits (minutes, seconds) default to zero.
    Pattern(String),
}

/// Which column carries the event timestamp, and its encoding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampSpec {
    /// Input column holding the timestamp.
    pub column: String,
    /// Encoding of that column.
    pub format: TimestampFormat,
}

/// One configured metric: an output name, the input column it reads, and
/// the fold applied per dimension group.
///
/// Aggregations are commutative and associative, so row order within a
/// partition never affects the result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AggregatorSpec {
    /// Additive integer sum over `field`.
    LongSum {
        /// Output metric column name.
        name: String,
        /// Input column summed.
        field: String,
    },
    /// Mergeable HyperLogLog distinct count of `field` values.
    DistinctCount {
        /// Output metric column name.
        name: String,
        /// Input column whose distinct values are estimated.
        field: String,
        /// Sketch precision (register count is `2^precision`).
        #[serde(default = "default_sketch_precision")]
        precision: u8,
    },
}

impl AggregatorSpec {
    /// Output metric column name.
    pub fn name(&self) -> &str {
        match self {
            AggregatorSpec::LongSum { name, .. } => name,
            AggregatorSpec::DistinctCount { name, .. } => name,
        }
    }

    /// Input column this aggregator folds.
    pub fn field(&self) -> &str {
        match self {
            AggregatorSpec::LongSum { field, .. } => field,
            AggregatorSpec::DistinctCount { field, .. } => field,
        }
    }
}

/// Logical shape of the input rows and the produced segments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSchema {
    /// Data source (table) name; first path component of every segment.
    pub data_source: String,
    /// Positional layout of the raw input lines.
    pub row_format: RowFormat,
    /// Timestamp column and encoding.
    pub timestamp: TimestampSpec,
    /// Dimension columns, in output order.
    pub dimensions: Vec<String>,
    /// Metric aggregators, in output order.
    pub metrics: Vec<AggregatorSpec>,
}

/// Hash partitioning of each time bucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionsSpec {
    /// Number of hash shards per bucket. Fixed up front; never derived
    /// from execution-environment parallelism hints.
    pub partition_count: u32,
    /// Dimension subset hashed for partition assignment. Empty means all
    /// configured dimensions, in order.
    #[serde(default)]
    pub partition_dimensions: Vec<String>,
}

/// Job tuning knobs.
///
/// `max_parallel_units` and `runtime_properties` are advisory scheduling
/// hints only. They must never influence shard assignment, partition
/// count, or any produced bytes; the end-to-end tests pin this.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Version string stamped into paths and descriptors (callers usually
    /// pass the job start time).
    pub version: String,
    /// Fraction of malformed rows tolerated (per unit, and across routing)
    /// before failing with a data-quality error. The fraction is checked
    /// over the whole row set, so the outcome is independent of row
    /// order; zero fails on any malformed row.
    #[serde(default)]
    pub max_skipped_row_fraction: f64,
    /// Upper bound on concurrently running (bucket, partition) units.
    #[serde(default)]
    pub max_parallel_units: Option<usize>,
    /// Opaque pass-through properties for the execution environment.
    #[serde(default)]
    pub runtime_properties: BTreeMap<String, String>,
}

/// Complete configuration of one index job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexJobSpec {
    /// Input and output schema.
    pub schema: DataSchema,
    /// Ingestion interval and segment granularity.
    pub granularity: GranularitySpec,
    /// Hash partitioning of each bucket.
    pub partitions: PartitionsSpec,
    /// Tuning knobs.
    pub tuning: TuningConfig,
}

impl IndexJobSpec {
    /// Dimension columns hashed for partition assignment.
    pub fn partition_key_dimensions(&self) -> &[String] {
        if self.partitions.partition_dimensions.is_empty() {
            &self.schema.dimensions
        } else {
            &self.partitions.partition_dimensions
        }
    }

    /// Metric output names, in aggregator order.
    pub fn metric_names(&self) -> Vec<String> {
        self.schema
            .metrics
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    /// Check the cross-field invariants of the spec.
    ///
    /// The driver runs this before reading any row; every later stage may
    /// assume a validated spec (column lookups resolve, the interval tiles
    /// into whole buckets, partition count is non-zero).
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.partitions.partition_count == 0 {
            return ZeroPartitionsSnafu.fail();
        }
        if !self.granularity.segment_granularity.is_valid() {
            return ZeroWidthGranularitySnafu.fail();
        }
        if self.granularity.interval.start().timestamp() < 0 {
            return PreEpochIntervalSnafu {
                start: self.granularity.interval.start().to_rfc3339(),
            }
            .fail();
        }
        if !self
            .granularity
            .segment_granularity
            .aligns_with(&self.granularity.interval)
        {
            return MisalignedIntervalSnafu {
                interval: self.granularity.interval.to_string(),
            }
            .fail();
        }

        layout::validate_path_component(&self.schema.data_source).context(
            UnusablePathComponentSnafu {
                value: self.schema.data_source.clone(),
                role: "data source",
            },
        )?;
        layout::validate_path_component(&self.tuning.version).context(
            UnusablePathComponentSnafu {
                value: self.tuning.version.clone(),
                role: "version",
            },
        )?;

        let mut columns: BTreeSet<&str> = BTreeSet::new();
        for c in &self.schema.row_format.columns {
            if !columns.insert(c.as_str()) {
                return DuplicateNameSnafu { name: c.clone() }.fail();
            }
        }

        if !columns.contains(self.schema.timestamp.column.as_str()) {
            return UnknownColumnSnafu {
                column: self.schema.timestamp.column.clone(),
                role: "timestamp",
            }
            .fail();
        }
        if let TimestampFormat::Pattern(p) = &self.schema.timestamp.format {
            if p.is_empty() {
                return EmptyPatternSnafu.fail();
            }
        }

        for dim in &self.schema.dimensions {
            if !columns.contains(dim.as_str()) {
                return UnknownColumnSnafu {
                    column: dim.clone(),
                    role: "dimension",
                }
                .fail();
            }
        }
        for metric in &self.schema.metrics {
            if !columns.contains(metric.field()) {
                return UnknownColumnSnafu {
                    column: metric.field().to_string(),
                    role: "metric input",
                }
                .fail();
            }
            if let AggregatorSpec::DistinctCount { precision, .. } = metric {
                if !(MIN_PRECISION..=MAX_PRECISION).contains(precision) {
                    return BadSketchPrecisionSnafu {
                        precision: *precision,
                    }
                    .fail();
                }
            }
        }
        for key_dim in &self.partitions.partition_dimensions {
            if !self.schema.dimensions.contains(key_dim) {
                return PartitionKeyNotDimensionSnafu {
                    column: key_dim.clone(),
                }
                .fail();
            }
        }

        let mut output_names = BTreeSet::new();
        for name in self
            .schema
            .dimensions
            .iter()
            .map(String::as_str)
            .chain(self.schema.metrics.iter().map(AggregatorSpec::name))
        {
            if !output_names.insert(name) {
                return DuplicateNameSnafu {
                    name: name.to_string(),
                }
                .fail();
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::website_spec;

    #[test]
    fn canonical_spec_validates() {
        let spec = website_spec("2014-10-22T12:00:00Z", 4, 0.0);
        spec.validate().expect("canonical spec should be valid");
        assert_eq!(spec.partition_key_dimensions(), ["host".to_string()]);
        assert_eq!(spec.metric_names(), ["visited_num", "unique_hosts"]);
    }

    #[test]
    fn zero_partitions_rejected() {
        let spec = website_spec("v1", 0, 0.0);
        assert!(matches!(
            spec.validate(),
            Err(SpecError::ZeroPartitions { .. })
        ));
    }

    #[test]
    fn misaligned_interval_rejected() {
        let mut spec = website_spec("v1", 4, 0.0);
        spec.granularity.interval = "2014-10-22T06:00:00Z/2014-10-23T00:00:00Z"
            .parse()
            .expect("valid interval");
        assert!(matches!(
            spec.validate(),
            Err(SpecError::MisalignedInterval { .. })
        ));
    }

    #[test]
    fn unknown_columns_rejected_per_role() {
        let mut spec = website_spec("v1", 4, 0.0);
        spec.schema.timestamp.column = "nope".to_string();
        assert!(matches!(
            spec.validate(),
            Err(SpecError::UnknownColumn { role: "timestamp", .. })
        ));

        let mut spec = website_spec("v1", 4, 0.0);
        spec.schema.dimensions = vec!["nope".to_string()];
        assert!(matches!(
            spec.validate(),
            Err(SpecError::UnknownColumn { role: "dimension", .. })
        ));

        let mut spec = website_spec("v1", 4, 0.0);
        spec.schema.metrics.push(AggregatorSpec::LongSum {
            name: "other".to_string(),
            field: "nope".to_string(),
        });
        assert!(matches!(
            spec.validate(),
            Err(SpecError::UnknownColumn { role: "metric input", .. })
        ));
    }

    #[test]
    fn out_of_range_sketch_precision_rejected() {
        let mut spec = website_spec("v1", 4, 0.0);
        spec.schema.metrics = vec![AggregatorSpec::DistinctCount {
            name: "unique_hosts".to_string(),
            field: "host".to_string(),
            precision: 30,
        }];
        assert!(matches!(
            spec.validate(),
            Err(SpecError::BadSketchPrecision { precision: 30, .. })
        ));
    }

    #[test]
    fn partition_key_must_be_dimension() {
        let mut spec = website_spec("v1", 4, 0.0);
        spec.partitions.partition_dimensions = vec!["visited_num".to_string()];
        assert!(matches!(
            spec.validate(),
            Err(SpecError::PartitionKeyNotDimension { .. })
        ));
    }

    #[test]
    fn duplicate_output_names_rejected() {
        let mut spec = website_spec("v1", 4, 0.0);
        spec.schema.metrics.push(AggregatorSpec::LongSum {
            name: "host".to_string(),
            field: "visited_num".to_string(),
        });
        assert!(matches!(
            spec.validate(),
            Err(SpecError::DuplicateName { .. })
        ));
    }

    #[test]
    fn bad_path_components_rejected() {
        let mut spec = website_spec("v1", 4, 0.0);
        spec.schema.data_source = "web/site".to_string();
        assert!(matches!(
            spec.validate(),
            Err(SpecError::UnusablePathComponent { role: "data source", .. })
        ));

        let mut spec = website_spec("../v1", 4, 0.0);
        assert!(matches!(
            spec.validate(),
            Err(SpecError::UnusablePathComponent { role: "version", .. })
        ));
    }

    #[test]
    fn spec_serde_round_trip() {
        let spec = website_spec("2014-10-22T12:00:00Z", 4, 0.02);
        let json = serde_json::to_string_pretty(&spec).expect("serialize spec");
        let back: IndexJobSpec = serde_json::from_str(&json).expect("deserialize spec");
        assert_eq!(back, spec);
    }

    #[test]
    fn aggregator_wire_form_is_tagged_camel_case() {
        let agg = AggregatorSpec::DistinctCount {
            name: "unique_hosts".to_string(),
            field: "host".to_string(),
            precision: DEFAULT_SKETCH_PRECISION,
        };
        let json = serde_json::to_value(&agg).expect("serialize aggregator");
        assert_eq!(json["type"], "distinctCount");
        assert_eq!(json["name"], "unique_hosts");
        assert_eq!(json["field"], "host");

        // Precision is optional on the wire and defaults to 11.
        let parsed: AggregatorSpec = serde_json::from_str(
            r#"{"type":"distinctCount","name":"u","field":"host"}"#,
        )
        .expect("deserialize aggregator");
        assert!(matches!(
            parsed,
            AggregatorSpec::DistinctCount { precision: 11, .. }
        ));
    }
}
