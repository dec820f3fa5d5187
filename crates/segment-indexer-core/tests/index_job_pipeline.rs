#![allow(missing_docs)]

//! End-to-end runs of the website traffic fixture: twenty rows over two
//! day buckets, hash-sharded into four partitions, summed and
//! distinct-counted, packaged, and published.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use segment_indexer_core::catalog::{self, DescriptorCatalog, FileDescriptorCatalog};
use segment_indexer_core::job::{run_index_job, UnitError, UnitOutcome, UnitState};
use segment_indexer_core::job_spec::{
    AggregatorSpec, DataSchema, GranularitySpec, IndexJobSpec, PartitionsSpec, RowFormat,
    SegmentGranularity, TimestampFormat, TimestampSpec, TuningConfig,
};
use segment_indexer_core::packaging;
use segment_indexer_core::rows::RowParser;
use segment_indexer_core::segment::LoadSpec;
use segment_indexer_core::sharding::{ShardAssigner, UnitKey};
use segment_indexer_core::storage::{self, OutputLocation};
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const HOSTS: [&str; 10] = [
    "a.example.com",
    "b.example.com",
    "c.example.com",
    "d.example.com",
    "e.example.com",
    "f.example.com",
    "g.example.com",
    "h.example.com",
    "i.example.com",
    "j.example.com",
];

#[tokio::test]
async fn website_job_publishes_hash_sharded_day_segments() -> TestResult {
    let tmp = TempDir::new()?;
    let location = OutputLocation::local(tmp.path());
    let catalog = Arc::new(FileDescriptorCatalog::new(location.clone()));
    let spec = website_spec("2014-10-22T12:30:00Z", 4, 0.0);
    let lines = fixture_lines();

    let report = run_index_job(&spec, &lines, &location, Arc::clone(&catalog) as _).await?;

    assert!(report.succeeded(), "job must succeed: {report:?}");
    assert_eq!(report.rows_read, 20);
    assert_eq!(report.rows_malformed, 0);
    assert_eq!(report.rows_out_of_interval, 0);

    // Routing is a pure function of the spec, so the expected unit set
    // and per-host sums can be recomputed independently.
    let expected = expected_routing(&spec, &lines)?;
    let unit_keys: Vec<UnitKey> = report.units.keys().copied().collect();
    let expected_keys: Vec<UnitKey> = expected.keys().copied().collect();
    assert_eq!(unit_keys, expected_keys);

    // Both day buckets produced segments.
    let covered: BTreeSet<u64> = unit_keys.iter().map(|k| k.bucket_id).collect();
    assert_eq!(covered.len(), 2);
    let expected_buckets: BTreeSet<u64> =
        report.expected_buckets.iter().map(u64::from).collect();
    assert_eq!(covered, expected_buckets);

    let mut per_bucket_groups: BTreeMap<u64, u64> = BTreeMap::new();
    let mut per_bucket_routed: BTreeMap<u64, u64> = BTreeMap::new();
    for (key, unit) in report.published_units() {
        let descriptor = &unit.descriptor;
        assert_eq!(descriptor.data_source, "website");
        assert_eq!(descriptor.version, "2014-10-22T12:30:00Z");
        assert_eq!(descriptor.dimensions, vec!["host".to_string()]);
        assert_eq!(
            descriptor.metrics,
            vec!["visited_num".to_string(), "unique_hosts".to_string()]
        );
        assert_eq!(descriptor.binary_version, 9);
        assert_eq!(descriptor.shard_spec.partition_index, key.partition_index);
        assert_eq!(descriptor.shard_spec.total_partitions, 4);

        let interval = spec
            .granularity
            .segment_granularity
            .bucket_interval(key.bucket_id)
            .ok_or("bucket interval must be representable")?;
        assert_eq!(descriptor.interval, interval);

        let LoadSpec::Local { path } = &descriptor.load_spec;
        assert_eq!(
            Path::new(path),
            storage::join_rel(&location, &unit.archive_rel)
        );

        // Unpack the archive and check it against the recomputed routing.
        let unpacked = packaging::read_segment(&location, &unit.archive_rel).await?;
        assert_eq!(unpacked.meta.binary_version, descriptor.binary_version);
        assert_eq!(unpacked.meta.interval, descriptor.interval);
        assert_eq!(unpacked.meta.row_count, unit.rows_aggregated);
        assert_eq!(unpacked.index.dimensions, vec!["host".to_string()]);
        assert_eq!(
            unpacked.index.metric_names,
            vec!["visited_num".to_string(), "unique_hosts".to_string()]
        );

        let expected_groups = &expected[key];
        assert_eq!(unpacked.index.rows.len(), expected_groups.len());
        for row in &unpacked.index.rows {
            let host = &row.dimensions[0];
            let visits = row.metrics[0].as_long().ok_or("sum metric must be a long")?;
            assert_eq!(visits, expected_groups[host], "wrong sum for {host}");

            // Each group holds exactly one distinct host.
            let sketch = row.metrics[1]
                .as_sketch()
                .ok_or("distinct metric must be a sketch")?;
            let estimate = sketch.estimate();
            assert!(
                (estimate - 1.0).abs() < 0.01,
                "distinct estimate for {host} was {estimate}"
            );
        }

        *per_bucket_groups.entry(key.bucket_id).or_default() += unpacked.meta.row_count;
        *per_bucket_routed.entry(key.bucket_id).or_default() += unit.rows_routed;
    }

    // Ten rows and ten hosts went into each day bucket.
    for bucket in &covered {
        assert_eq!(per_bucket_routed[bucket], 10);
        assert_eq!(per_bucket_groups[bucket], 10);
    }

    // The catalog scan agrees with the report, and nothing half-written
    // is left anywhere under the output root.
    assert_eq!(report.published, catalog.scan("website").await?);
    let all_files = storage::list_files(&location, Path::new("")).await?;
    assert_eq!(all_files.len(), report.units.len() * 3);
    assert!(all_files
        .iter()
        .all(|p| p.extension().and_then(|e| e.to_str()) != Some("tmp")));
    Ok(())
}

#[tokio::test]
async fn scheduling_hints_never_change_produced_segments() -> TestResult {
    let lines = fixture_lines();

    let plain_dir = TempDir::new()?;
    let plain_location = OutputLocation::local(plain_dir.path());
    let plain_catalog = Arc::new(FileDescriptorCatalog::new(plain_location.clone()));
    let plain_spec = website_spec("v-hints", 4, 0.0);
    let plain = run_index_job(&plain_spec, &lines, &plain_location, plain_catalog as _).await?;
    assert!(plain.succeeded());

    // Same job, now with a serialized driver and the external
    // parallelism hints the original environment would inject.
    let hinted_dir = TempDir::new()?;
    let hinted_location = OutputLocation::local(hinted_dir.path());
    let hinted_catalog = Arc::new(FileDescriptorCatalog::new(hinted_location.clone()));
    let mut hinted_spec = website_spec("v-hints", 4, 0.0);
    hinted_spec.tuning.max_parallel_units = Some(1);
    hinted_spec
        .tuning
        .runtime_properties
        .insert("mapreduce.job.reduces".to_string(), "0".to_string());
    hinted_spec
        .tuning
        .runtime_properties
        .insert("mapreduce.job.maps".to_string(), "97".to_string());
    let hinted =
        run_index_job(&hinted_spec, &lines, &hinted_location, hinted_catalog as _).await?;
    assert!(hinted.succeeded());

    let plain_keys: Vec<UnitKey> = plain.units.keys().copied().collect();
    let hinted_keys: Vec<UnitKey> = hinted.units.keys().copied().collect();
    assert_eq!(plain_keys, hinted_keys);

    for ((plain_key, plain_unit), (hinted_key, hinted_unit)) in
        plain.published_units().zip(hinted.published_units())
    {
        assert_eq!(plain_key, hinted_key);
        assert_eq!(plain_unit.archive_rel, hinted_unit.archive_rel);
        assert_eq!(
            plain_unit.descriptor.shard_spec,
            hinted_unit.descriptor.shard_spec
        );
        assert_eq!(plain_unit.descriptor.size, hinted_unit.descriptor.size);

        let plain_bytes =
            storage::read_all_bytes(&plain_location, &plain_unit.archive_rel).await?;
        let hinted_bytes =
            storage::read_all_bytes(&hinted_location, &hinted_unit.archive_rel).await?;
        assert_eq!(plain_bytes, hinted_bytes, "archives must be byte-identical");
    }
    Ok(())
}

#[tokio::test]
async fn rerunning_an_identical_job_is_idempotent() -> TestResult {
    let tmp = TempDir::new()?;
    let location = OutputLocation::local(tmp.path());
    let catalog = Arc::new(FileDescriptorCatalog::new(location.clone()));
    let spec = website_spec("2014-10-22T12:30:00Z", 4, 0.0);
    let lines = fixture_lines();

    let first = run_index_job(&spec, &lines, &location, Arc::clone(&catalog) as _).await?;
    assert!(first.succeeded());
    assert!(first.published_units().all(|(_, unit)| !unit.republished));

    let second = run_index_job(&spec, &lines, &location, Arc::clone(&catalog) as _).await?;
    assert!(second.succeeded());
    assert_eq!(second.units.len(), first.units.len());
    assert!(second.published_units().all(|(_, unit)| unit.republished));

    // Still exactly one catalog entry per unit, and the archives are
    // intact.
    let scanned = catalog.scan("website").await?;
    assert_eq!(scanned.len(), first.units.len());
    for (_, unit) in second.published_units() {
        let unpacked = packaging::read_segment(&location, &unit.archive_rel).await?;
        assert_eq!(unpacked.meta.row_count, unit.rows_aggregated);
    }
    Ok(())
}

#[tokio::test]
async fn one_failing_unit_never_blocks_the_rest() -> TestResult {
    let tmp = TempDir::new()?;
    let location = OutputLocation::local(tmp.path());
    let catalog = Arc::new(FileDescriptorCatalog::new(location.clone()));
    let spec = website_spec("v-isolation", 4, 0.0);

    // One row with an unparseable metric value; zero tolerance turns the
    // skip into a failure of exactly the unit that owns the row.
    let mut lines = fixture_lines();
    lines.push("2014102205,a.example.com,not-a-number".to_string());
    let parser = RowParser::from_schema(&spec.schema)?;
    let assigner = ShardAssigner::from_spec(&spec)?;
    let bad_unit = assigner.assign(&parser.parse_line(lines.last().ok_or("line")?)?)?;

    let report = run_index_job(&spec, &lines, &location, Arc::clone(&catalog) as _).await?;
    assert!(!report.succeeded());

    for (key, outcome) in &report.units {
        if *key == bad_unit {
            match outcome {
                UnitOutcome::Failed { error } => {
                    assert!(matches!(error, UnitError::Aggregate { .. }));
                    assert_eq!(error.failed_from(), UnitState::Aggregating);
                }
                UnitOutcome::Published(_) => {
                    return Err(format!("unit {key} should have failed").into());
                }
            }
        } else {
            assert_eq!(outcome.state(), UnitState::Published, "unit {key}");
        }
    }

    // Every healthy unit reached the catalog; the failed one did not.
    let published =
        catalog::list_published(catalog.as_ref(), "website", "v-isolation").await?;
    assert_eq!(published.len(), report.units.len() - 1);
    let bad_interval = spec
        .granularity
        .segment_granularity
        .bucket_interval(bad_unit.bucket_id)
        .ok_or("bucket interval must be representable")?;
    assert!(!published.iter().any(|d| {
        d.interval == bad_interval && d.shard_spec.partition_index == bad_unit.partition_index
    }));
    Ok(())
}

/// Twenty rows: every host visits once per day bucket, with distinct
/// hour-of-day timestamps and assertable visit counts.
fn fixture_lines() -> Vec<String> {
    let mut lines = Vec::new();
    for (i, host) in HOSTS.iter().enumerate() {
        lines.push(format!("20141022{i:02},{host},{}", 100 * (i as i64 + 1)));
        lines.push(format!("20141023{:02},{host},{}", i + 10, 7 * (i as i64 + 1)));
    }
    lines
}

/// Recompute the routing and the per-unit, per-host visit sums straight
/// from the public assignment surface.
fn expected_routing(
    spec: &IndexJobSpec,
    lines: &[String],
) -> Result<BTreeMap<UnitKey, BTreeMap<String, i64>>, Box<dyn std::error::Error>> {
    let parser = RowParser::from_schema(&spec.schema)?;
    let assigner = ShardAssigner::from_spec(spec)?;

    let mut units: BTreeMap<UnitKey, BTreeMap<String, i64>> = BTreeMap::new();
    for line in lines {
        let row = parser.parse_line(line)?;
        let key = assigner.assign(&row)?;
        let host = row.dimensions[0].clone();
        *units.entry(key).or_default().entry(host).or_insert(0) +=
            row.metric_inputs[0].parse::<i64>()?;
    }
    Ok(units)
}

fn website_spec(version: &str, partition_count: u32, tolerance: f64) -> IndexJobSpec {
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
