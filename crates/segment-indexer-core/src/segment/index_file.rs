//! Columnar index artifact stored inside each segment archive.
//!
//! The rolled-up rows of one segment are written as a single Parquet
//! file: one non-nullable Utf8 column per dimension, then one column
//! per metric in aggregator order (Int64 for sums, Binary holding the
//! encoded sketch for distinct counts). Dimension columns always come
//! first, which is how [`decode_index`] splits the schema back apart
//! without external information. Row order is whatever the caller
//! wrote, and the packager writes rows sorted by dimension tuple.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, BinaryBuilder, Int64Array, Int64Builder, StringArray,
    StringBuilder,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

use crate::aggregate::{AggregatedRow, MetricValue};
use crate::job_spec::granularity::TimeInterval;
use crate::job_spec::schema::AggregatorSpec;
use crate::sketch::{HllSketch, SketchError};

/// Errors raised while encoding or decoding an index file.
#[derive(Debug, Snafu)]
pub enum IndexFileError {
    /// Parquet-level write or read failure.
    #[snafu(display("Parquet error: {source}"))]
    Parquet {
        /// The underlying parquet error.
        source: parquet::errors::ParquetError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Arrow-level batch construction failure.
    #[snafu(display("Arrow error: {source}"))]
    Arrow {
        /// The underlying arrow error.
        source: arrow::error::ArrowError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A column does not have the layout this format promises.
    #[snafu(display("Column `{name}` is not {expected}"))]
    Column {
        /// The offending column name.
        name: String,
        /// What the format expected there.
        expected: &'static str,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A sketch column holds bytes that do not decode.
    #[snafu(display("Undecodable sketch column value: {source}"))]
    SketchColumn {
        /// The underlying sketch decode error.
        #[snafu(backtrace)]
        source: SketchError,
    },
}

/// Summary of the index artifact, stored beside it in the archive as
/// `index_meta.json` and cross-checked on unpack.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMeta {
    /// Index format version the archive was written with.
    pub binary_version: i32,
    /// Time bucket the index covers.
    pub interval: TimeInterval,
    /// Dimension column names, in column order.
    pub dimensions: Vec<String>,
    /// Metric column names, in aggregator output order.
    pub metrics: Vec<String>,
    /// Number of rolled-up rows in the index.
    pub row_count: u64,
}

/// An index file read back into memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedIndex {
    /// Dimension column names, in column order.
    pub dimensions: Vec<String>,
    /// Metric column names, in column order.
    pub metric_names: Vec<String>,
    /// Rows in file order.
    pub rows: Vec<AggregatedRow>,
}

enum MetricBuilder {
    Long(Int64Builder),
    Sketch(BinaryBuilder),
}

/// Encode rolled-up rows as Parquet bytes with the fixed column layout.
pub fn encode_index(
    dimensions: &[String],
    metrics: &[AggregatorSpec],
    rows: &[AggregatedRow],
) -> Result<Vec<u8>, IndexFileError> {
    let mut fields = Vec::with_capacity(dimensions.len() + metrics.len());
    for dim in dimensions {
        fields.push(Field::new(dim, DataType::Utf8, false));
    }
    for agg in metrics {
        let data_type = match agg {
            AggregatorSpec::LongSum { .. } => DataType::Int64,
            AggregatorSpec::DistinctCount { .. } => DataType::Binary,
        };
        fields.push(Field::new(agg.name(), data_type, false));
    }
    let schema = Arc::new(Schema::new(fields));

    let mut dim_builders: Vec<StringBuilder> =
        dimensions.iter().map(|_| StringBuilder::new()).collect();
    let mut metric_builders: Vec<MetricBuilder> = metrics
        .iter()
        .map(|agg| match agg {
            AggregatorSpec::LongSum { .. } => MetricBuilder::Long(Int64Builder::new()),
            AggregatorSpec::DistinctCount { .. } => MetricBuilder::Sketch(BinaryBuilder::new()),
        })
        .collect();

    for row in rows {
        debug_assert_eq!(row.dimensions.len(), dimensions.len());
        debug_assert_eq!(row.metrics.len(), metrics.len());

        for (builder, value) in dim_builders.iter_mut().zip(&row.dimensions) {
            builder.append_value(value);
        }
        for (builder, value) in metric_builders.iter_mut().zip(&row.metrics) {
            match (builder, value) {
                (MetricBuilder::Long(b), MetricValue::Long(v)) => b.append_value(*v),
                (MetricBuilder::Sketch(b), MetricValue::Sketch(s)) => {
                    b.append_value(s.to_bytes());
                }
                _ => debug_assert!(false, "metric value kind diverged from the aggregator plan"),
            }
        }
    }

    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(dimensions.len() + metrics.len());
    for mut builder in dim_builders {
        arrays.push(Arc::new(builder.finish()));
    }
    for builder in metric_builders {
        match builder {
            MetricBuilder::Long(mut b) => arrays.push(Arc::new(b.finish())),
            MetricBuilder::Sketch(mut b) => arrays.push(Arc::new(b.finish())),
        }
    }

    let batch = RecordBatch::try_new(schema.clone(), arrays).context(ArrowSnafu)?;

    let mut buf = Vec::new();
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(&mut buf, schema, Some(props)).context(ParquetSnafu)?;
    writer.write(&batch).context(ParquetSnafu)?;
    writer.close().context(ParquetSnafu)?;
    Ok(buf)
}

enum ColumnKind {
    Long,
    Sketch,
}

enum TypedColumn<'a> {
    Long(&'a Int64Array),
    Sketch(&'a BinaryArray),
}

/// Decode an index file, splitting dimension and metric columns by the
/// fixed layout: a leading run of Utf8 columns, then Int64/Binary
/// metric columns.
pub fn decode_index(bytes: Vec<u8>) -> Result<DecodedIndex, IndexFileError> {
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes)).context(ParquetSnafu)?;
    let schema = builder.schema().clone();

    let mut dimensions = Vec::new();
    let mut metric_names = Vec::new();
    let mut kinds = Vec::new();
    for field in schema.fields() {
        match field.data_type() {
            DataType::Utf8 if kinds.is_empty() => dimensions.push(field.name().clone()),
            DataType::Int64 => {
                metric_names.push(field.name().clone());
                kinds.push(ColumnKind::Long);
            }
            DataType::Binary => {
                metric_names.push(field.name().clone());
                kinds.push(ColumnKind::Sketch);
            }
            _ => {
                return ColumnSnafu {
                    name: field.name().clone(),
                    expected: "a leading utf8 dimension or an int64/binary metric",
                }
                .fail();
            }
        }
    }

    let reader = builder.build().context(ParquetSnafu)?;
    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.context(ArrowSnafu)?;

        let dim_arrays = (0..dimensions.len())
            .map(|i| {
                batch.column(i)
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .context(ColumnSnafu {
                        name: dimensions[i].clone(),
                        expected: "a utf8 array",
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let metric_arrays = kinds
            .iter()
            .enumerate()
            .map(|(k, kind)| {
                let column = batch.column(dimensions.len() + k);
                match kind {
                    ColumnKind::Long => column
                        .as_any()
                        .downcast_ref::<Int64Array>()
                        .map(TypedColumn::Long)
                        .context(ColumnSnafu {
                            name: metric_names[k].clone(),
                            expected: "an int64 array",
                        }),
                    ColumnKind::Sketch => column
                        .as_any()
                        .downcast_ref::<BinaryArray>()
                        .map(TypedColumn::Sketch)
                        .context(ColumnSnafu {
                            name: metric_names[k].clone(),
                            expected: "a binary array",
                        }),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        for r in 0..batch.num_rows() {
            let row_dimensions = dim_arrays.iter().map(|a| a.value(r).to_string()).collect();
            let row_metrics = metric_arrays
                .iter()
                .map(|col| match col {
                    TypedColumn::Long(a) => Ok(MetricValue::Long(a.value(r))),
                    TypedColumn::Sketch(a) => Ok(MetricValue::Sketch(
                        HllSketch::from_bytes(a.value(r)).context(SketchColumnSnafu)?,
                    )),
                })
                .collect::<Result<Vec<_>, IndexFileError>>()?;

            rows.push(AggregatedRow {
                dimensions: row_dimensions,
                metrics: row_metrics,
            });
        }
    }

    Ok(DecodedIndex {
        dimensions,
        metric_names,
        rows,
    })
}
