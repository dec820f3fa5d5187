//! Per-unit rollup of parsed rows into aggregated segment rows.
//!
//! [`RowAggregator`] folds the rows of one work unit, grouping by the
//! full dimension tuple and applying one accumulator per configured
//! metric. Every fold is commutative and associative (modular integer
//! sums, per-register sketch maxima), and the malformed-row tolerance
//! is evaluated over the whole row set in [`RowAggregator::finish`], so
//! the outcome never depends on the order rows arrive in. Two partial
//! aggregators over disjoint row sets [`merge`](RowAggregator::merge)
//! into exactly the state a single pass would have produced.
//!
//! Rows whose numeric metric inputs do not parse are skipped, logged,
//! and counted; `finish` fails the unit when the skipped fraction
//! exceeds the spec's tolerance. Output rows come back sorted
//! lexicographically by dimension tuple.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use snafu::{Backtrace, ResultExt, Snafu};

use crate::job_spec::schema::{AggregatorSpec, IndexJobSpec};
use crate::rows::ParsedRow;
use crate::sketch::{HllSketch, SketchError};

/// Errors raised while aggregating one work unit.
#[derive(Debug, Snafu)]
pub enum AggregateError {
    /// Too many rows were malformed.
    #[snafu(display(
        "Skipped {skipped} of {seen} rows, over the tolerated fraction {max_fraction}"
    ))]
    DataQuality {
        /// Rows skipped as malformed.
        skipped: u64,
        /// Rows offered in total.
        seen: u64,
        /// Configured tolerance.
        max_fraction: f64,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A distinct-count sketch could not be created or merged.
    #[snafu(display("Sketch operation failed: {source}"))]
    Sketch {
        /// The underlying sketch error.
        #[snafu(backtrace)]
        source: SketchError,
    },
}

/// Final value of one metric for one dimension group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    /// Result of an additive integer aggregator.
    Long(i64),
    /// Result of a distinct-count aggregator.
    Sketch(HllSketch),
}

impl MetricValue {
    /// The integer value, if this is a [`MetricValue::Long`].
    pub fn as_long(&self) -> Option<i64> {
        match self {
            MetricValue::Long(v) => Some(*v),
            MetricValue::Sketch(_) => None,
        }
    }

    /// The sketch, if this is a [`MetricValue::Sketch`].
    pub fn as_sketch(&self) -> Option<&HllSketch> {
        match self {
            MetricValue::Long(_) => None,
            MetricValue::Sketch(s) => Some(s),
        }
    }
}

/// One rolled-up output row: a dimension tuple and its metric values,
/// in the schema's metric order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregatedRow {
    /// Dimension values, in the schema's dimension order.
    pub dimensions: Vec<String>,
    /// One folded value per configured metric.
    pub metrics: Vec<MetricValue>,
}

#[derive(Clone, Debug)]
enum MetricAccumulator {
    LongSum { total: i64 },
    Distinct { sketch: HllSketch },
}

enum FoldInput<'a> {
    Long(i64),
    Text(&'a str),
}

/// Order-independent rollup state for one work unit.
#[derive(Debug)]
pub struct RowAggregator {
    metrics: Vec<AggregatorSpec>,
    prototype: Vec<MetricAccumulator>,
    groups: BTreeMap<Vec<String>, Vec<MetricAccumulator>>,
    rows_seen: u64,
    rows_skipped: u64,
    max_skipped_fraction: f64,
}

impl RowAggregator {
    /// Build an empty aggregator for the spec's metric set.
    pub fn from_spec(spec: &IndexJobSpec) -> Result<Self, AggregateError> {
        let prototype = spec
            .schema
            .metrics
            .iter()
            .map(|agg| {
                Ok(match agg {
                    AggregatorSpec::LongSum { .. } => MetricAccumulator::LongSum { total: 0 },
                    AggregatorSpec::DistinctCount { precision, .. } => {
                        MetricAccumulator::Distinct {
                            sketch: HllSketch::new(*precision).context(SketchSnafu)?,
                        }
                    }
                })
            })
            .collect::<Result<Vec<_>, AggregateError>>()?;

        Ok(Self {
            metrics: spec.schema.metrics.clone(),
            prototype,
            groups: BTreeMap::new(),
            rows_seen: 0,
            rows_skipped: 0,
            max_skipped_fraction: spec.tuning.max_skipped_row_fraction,
        })
    }

    /// Rows offered so far, including skipped ones.
    pub fn rows_seen(&self) -> u64 {
        self.rows_seen
    }

    /// Rows skipped as malformed so far.
    pub fn rows_skipped(&self) -> u64 {
        self.rows_skipped
    }

    /// Distinct dimension groups accumulated so far.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Fold one row. Malformed metric values skip the whole row; the
    /// skip is logged and held against the tolerance in
    /// [`RowAggregator::finish`].
    pub fn add_row(&mut self, row: &ParsedRow) {
        debug_assert_eq!(
            row.metric_inputs.len(),
            self.metrics.len(),
            "row metric inputs do not match the aggregator's schema"
        );
        self.rows_seen += 1;

        // Validate every input before touching any accumulator, so a
        // malformed row leaves the group state untouched.
        let mut inputs = Vec::with_capacity(self.metrics.len());
        for (agg, raw) in self.metrics.iter().zip(&row.metric_inputs) {
            match agg {
                AggregatorSpec::LongSum { name, .. } => match raw.parse::<i64>() {
                    Ok(v) => inputs.push(FoldInput::Long(v)),
                    Err(_) => {
                        self.rows_skipped += 1;
                        log::warn!(
                            "Skipping malformed row: metric `{name}` needs an integer, got `{raw}`"
                        );
                        return;
                    }
                },
                AggregatorSpec::DistinctCount { .. } => inputs.push(FoldInput::Text(raw)),
            }
        }

        let accumulators = self
            .groups
            .entry(row.dimensions.clone())
            .or_insert_with(|| self.prototype.clone());
        for (acc, input) in accumulators.iter_mut().zip(inputs) {
            match (acc, input) {
                (MetricAccumulator::LongSum { total }, FoldInput::Long(v)) => {
                    // Modular 64-bit sum.
                    *total = total.wrapping_add(v);
                }
                (MetricAccumulator::Distinct { sketch }, FoldInput::Text(t)) => {
                    sketch.add(t.as_bytes());
                }
                _ => debug_assert!(false, "accumulator and input kinds diverged"),
            }
        }
    }

    /// Fold another partial aggregator over a disjoint row set into this
    /// one.
    pub fn merge(&mut self, other: RowAggregator) -> Result<(), AggregateError> {
        debug_assert_eq!(
            self.metrics, other.metrics,
            "merging aggregators built from different specs"
        );

        for (dimensions, accumulators) in other.groups {
            match self.groups.entry(dimensions) {
                Entry::Vacant(slot) => {
                    slot.insert(accumulators);
                }
                Entry::Occupied(mut slot) => {
                    for (dst, src) in slot.get_mut().iter_mut().zip(accumulators) {
                        match (dst, src) {
                            (
                                MetricAccumulator::LongSum { total },
                                MetricAccumulator::LongSum { total: other_total },
                            ) => {
                                *total = total.wrapping_add(other_total);
                            }
                            (
                                MetricAccumulator::Distinct { sketch },
                                MetricAccumulator::Distinct { sketch: other_sketch },
                            ) => {
                                sketch.merge(&other_sketch).context(SketchSnafu)?;
                            }
                            _ => debug_assert!(false, "accumulator kinds diverged"),
                        }
                    }
                }
            }
        }

        self.rows_seen += other.rows_seen;
        self.rows_skipped += other.rows_skipped;
        Ok(())
    }

    /// Check the malformed-row tolerance and return the rolled-up rows,
    /// sorted lexicographically by dimension tuple.
    pub fn finish(self) -> Result<Vec<AggregatedRow>, AggregateError> {
        if self.rows_skipped > 0 {
            let fraction = self.rows_skipped as f64 / self.rows_seen as f64;
            if fraction > self.max_skipped_fraction {
                return DataQualitySnafu {
                    skipped: self.rows_skipped,
                    seen: self.rows_seen,
                    max_fraction: self.max_skipped_fraction,
                }
                .fail();
            }
        }

        Ok(self
            .groups
            .into_iter()
            .map(|(dimensions, accumulators)| AggregatedRow {
                dimensions,
                metrics: accumulators
                    .into_iter()
                    .map(|acc| match acc {
                        MetricAccumulator::LongSum { total } => MetricValue::Long(total),
                        MetricAccumulator::Distinct { sketch } => MetricValue::Sketch(sketch),
                    })
                    .collect(),
            })
            .collect())
    }
}
