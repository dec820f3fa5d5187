//! Shared test fixtures.

use std::collections::BTreeMap;

use crate::job_spec::{
    AggregatorSpec, DataSchema, GranularitySpec, IndexJobSpec, PartitionsSpec, RowFormat,
    SegmentGranularity, TimestampFormat, TimestampSpec, TuningConfig,
};

/// The website traffic fixture: comma-separated
/// `timestamp,host,visited_num` lines with `%Y%m%d%H` timestamps,
/// ingested over 2014-10-22/2014-10-24 in day buckets, one `host`
/// dimension, a visit sum, and a distinct-host sketch.
pub fn website_spec(version: &str, partition_count: u32, tolerance: f64) -> IndexJobSpec {
    IndexJobSpec {
        schema: DataSchema {
            data_source: "website".to_string(),
            row_format: RowFormat {
                delimiter: ',',
                columns: vec![
                    "timestamp".to_string(),
                    "host".to_string(),
                    "visited_num".to_string(),
                ],
            },
            timestamp: TimestampSpec {
                column: "timestamp".to_string(),
                format: TimestampFormat::Pattern("%Y%m%d%H".to_string()),
            },
            dimensions: vec!["host".to_string()],
            metrics: vec![
                AggregatorSpec::LongSum {
                    name: "visited_num".to_string(),
                    field: "visited_num".to_string(),
                },
                AggregatorSpec::DistinctCount {
                    name: "unique_hosts".to_string(),
                    field: "host".to_string(),
                    precision: 11,
                },
            ],
        },
        granularity: GranularitySpec {
            interval: "2014-10-22T00:00:00Z/2014-10-24T00:00:00Z"
                .parse()
                .expect("valid fixture interval"),
            segment_granularity: SegmentGranularity::Days(1),
        },
        partitions: PartitionsSpec {
            partition_count,
            partition_dimensions: Vec::new(),
        },
        tuning: TuningConfig {
            version: version.to_string(),
            max_skipped_row_fraction: tolerance,
            max_parallel_units: None,
            runtime_properties: BTreeMap::new(),
        },
    }
}
