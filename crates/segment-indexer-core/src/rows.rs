//! Delimited input line parsing.
//!
//! Input files are plain text, one event per line, fields split on a
//! single configured delimiter (no quoting). [`RowParser`] resolves the
//! spec's column names to positions once, then turns each line into a
//! [`ParsedRow`]: an event timestamp, the dimension values in output
//! order, and the raw text of each aggregator's input field. Metric
//! values stay unparsed here; whether `"abc"` is an acceptable long is
//! the aggregation layer's call, where skips are counted against the
//! configured tolerance.

use chrono::format::{parse, Parsed, StrftimeItems};
use chrono::{DateTime, Utc};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

use crate::job_spec::schema::{DataSchema, SpecError, TimestampFormat, UnknownColumnSnafu};

/// Errors raised while parsing one input line.
#[derive(Debug, Snafu)]
pub enum RowParseError {
    /// The line has the wrong number of fields.
    #[snafu(display("Expected {expected} fields, found {actual}"))]
    ColumnCount {
        /// Number of columns the row format declares.
        expected: usize,
        /// Number of fields the line actually split into.
        actual: usize,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The timestamp field does not match the configured format.
    #[snafu(display("Unparseable timestamp `{value}`: {source}"))]
    Timestamp {
        /// The offending field text.
        value: String,
        /// The underlying chrono parse error.
        source: chrono::ParseError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// An epoch-millis timestamp field is not an integer.
    #[snafu(display("Unparseable epoch-millis timestamp `{value}`: {source}"))]
    EpochValue {
        /// The offending field text.
        value: String,
        /// The underlying integer parse error.
        source: std::num::ParseIntError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The timestamp is outside the range chrono can represent.
    #[snafu(display("Timestamp `{value}` is out of the representable range"))]
    TimestampRange {
        /// The offending field text.
        value: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

/// One successfully parsed input line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedRow {
    /// Event timestamp, in UTC.
    pub timestamp: DateTime<Utc>,
    /// Dimension values, in the schema's dimension order.
    pub dimensions: Vec<String>,
    /// Raw input text for each aggregator, in the schema's metric order.
    pub metric_inputs: Vec<String>,
}

/// Line parser with column positions resolved against a schema.
#[derive(Clone, Debug)]
pub struct RowParser {
    delimiter: char,
    column_count: usize,
    timestamp_index: usize,
    timestamp_format: TimestampFormat,
    dimension_indexes: Vec<usize>,
    metric_indexes: Vec<usize>,
}

impl RowParser {
    /// Resolve the schema's column names to line positions.
    ///
    /// Fails with [`SpecError::UnknownColumn`] when a referenced column is
    /// missing from the row format; a spec that passed
    /// [`IndexJobSpec::validate`](crate::job_spec::IndexJobSpec::validate)
    /// always resolves.
    pub fn from_schema(schema: &DataSchema) -> Result<Self, SpecError> {
        let position = |name: &str, role: &'static str| -> Result<usize, SpecError> {
            schema
                .row_format
                .columns
                .iter()
                .position(|c| c == name)
                .context(UnknownColumnSnafu { column: name, role })
        };

        let timestamp_index = position(&schema.timestamp.column, "timestamp")?;
        let dimension_indexes = schema
            .dimensions
            .iter()
            .map(|d| position(d, "dimension"))
            .collect::<Result<Vec<_>, _>>()?;
        let metric_indexes = schema
            .metrics
            .iter()
            .map(|m| position(m.field(), "metric input"))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            delimiter: schema.row_format.delimiter,
            column_count: schema.row_format.columns.len(),
            timestamp_index,
            timestamp_format: schema.timestamp.format.clone(),
            dimension_indexes,
            metric_indexes,
        })
    }

    /// Parse one input line.
    pub fn parse_line(&self, line: &str) -> Result<ParsedRow, RowParseError> {
        let fields: Vec<&str> = line.split(self.delimiter).collect();
        if fields.len() != self.column_count {
            return ColumnCountSnafu {
                expected: self.column_count,
                actual: fields.len(),
            }
            .fail();
        }

        let timestamp = self.parse_timestamp(fields[self.timestamp_index])?;
        let dimensions = self
            .dimension_indexes
            .iter()
            .map(|&i| fields[i].to_string())
            .collect();
        let metric_inputs = self
            .metric_indexes
            .iter()
            .map(|&i| fields[i].to_string())
            .collect();

        Ok(ParsedRow {
            timestamp,
            dimensions,
            metric_inputs,
        })
    }

    fn parse_timestamp(&self, raw: &str) -> Result<DateTime<Utc>, RowParseError> {
        match &self.timestamp_format {
            TimestampFormat::Iso8601 => DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .context(TimestampSnafu { value: raw }),
            TimestampFormat::EpochMillis => {
                let millis: i64 = raw.parse().context(EpochValueSnafu { value: raw })?;
                DateTime::from_timestamp_millis(millis)
                    .context(TimestampRangeSnafu { value: raw })
            }
            TimestampFormat::Pattern(pattern) => {
                parse_pattern_timestamp(pattern, raw).context(TimestampSnafu { value: raw })
            }
        }
    }
}

/// Parse a wall-clock timestamp against a strftime pattern, reading it
/// as UTC. Components the pattern omits default to zero, so `%Y%m%d%H`
/// yields the top of the hour and `%Y%m%d` midnight.
fn parse_pattern_timestamp(
    pattern: &str,
    raw: &str,
) -> Result<DateTime<Utc>, chrono::ParseError> {
    let mut parsed = Parsed::new();
    parse(&mut parsed, raw, StrftimeItems::new(pattern))?;

    // set_* fails only when the component was already parsed to a
    // different value; those are left as parsed.
    let _ = parsed.set_hour(0);
    let _ = parsed.set_minute(0);
    let _ = parsed.set_second(0);

    let naive = parsed.to_naive_datetime_with_offset(0)?;
    Ok(naive.and_utc())
}
