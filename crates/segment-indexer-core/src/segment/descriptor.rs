//! Segment descriptor: the JSON document a published segment is known
//! by.
//!
//! The descriptor is the catalog's unit of record and also lands as a
//! `descriptor.json` sidecar next to each archive. Field names are
//! camelCase on the wire and fixed; downstream loaders parse them, so
//! the serde tests in this module pin the exact shape.
//!
//! Everything needed to locate the archive is carried in the
//! descriptor itself: [`SegmentDescriptor::archive_rel_path`] rebuilds
//! the storage path from (dataSource, interval, version,
//! partitionIndex) alone, and `loadSpec.path` records where the
//! producing job actually put it.

use serde::{Deserialize, Serialize};

use crate::job_spec::granularity::TimeInterval;
use crate::layout::{self, LayoutError};

/// On-disk format version of the index artifact inside the archive.
pub const SEGMENT_BINARY_VERSION: i32 = 9;

/// Position of a segment within its time bucket's hash partitioning.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardSpec {
    /// Partition index in `0..total_partitions`.
    pub partition_index: u32,
    /// Partition count the bucket was split into.
    pub total_partitions: u32,
}

/// Where the segment archive can be fetched from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LoadSpec {
    /// A file on a locally mounted filesystem.
    Local {
        /// Full path of the archive as the producing job wrote it.
        path: String,
    },
}

/// Published identity and location of one segment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentDescriptor {
    /// Data source the segment belongs to.
    pub data_source: String,
    /// Time bucket the segment covers, as a `start/end` string.
    pub interval: TimeInterval,
    /// Job version string; segments from a re-run carry a new version.
    pub version: String,
    /// Hash partition position within the bucket.
    pub shard_spec: ShardSpec,
    /// Dimension column names, in segment column order.
    pub dimensions: Vec<String>,
    /// Metric column names, in aggregator output order.
    pub metrics: Vec<String>,
    /// Index artifact format version.
    pub binary_version: i32,
    /// Archive size in bytes.
    pub size: u64,
    /// Fetch location of the archive.
    pub load_spec: LoadSpec,
}

impl SegmentDescriptor {
    /// Rebuild the root-relative archive path from the descriptor's
    /// identity fields. This must agree with where the packager writes,
    /// so a reader holding only the descriptor can find the archive
    /// without consulting `loadSpec`.
    pub fn archive_rel_path(&self) -> Result<std::path::PathBuf, LayoutError> {
        layout::archive_rel_path(
            &self.data_source,
            &self.interval,
            &self.version,
            self.shard_spec.partition_index,
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn descriptor() -> SegmentDescriptor {
        let interval = TimeInterval::new(
            Utc.with_ymd_and_hms(2014, 10, 22, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2014, 10, 23, 0, 0, 0).unwrap(),
        )
        .expect("valid interval");

        SegmentDescriptor {
            data_source: "website".to_string(),
            interval,
            version: "2014-10-22T12:00:00Z".to_string(),
            shard_spec: ShardSpec {
                partition_index: 2,
                total_partitions: 4,
            },
            dimensions: vec!["host".to_string()],
            metrics: vec!["visited_num".to_string(), "unique_hosts".to_string()],
            binary_version: SEGMENT_BINARY_VERSION,
            size: 1234,
            load_spec: LoadSpec::Local {
                path: "/data/segments/website/x/archive".to_string(),
            },
        }
    }

    #[test]
    fn wire_form_is_camel_case_with_fixed_fields() {
        let json = serde_json::to_value(descriptor()).expect("serialize descriptor");

        assert_eq!(json["dataSource"], "website");
        assert_eq!(
            json["interval"],
            "2014-10-22T00:00:00.000Z/2014-10-23T00:00:00.000Z"
        );
        assert_eq!(json["version"], "2014-10-22T12:00:00Z");
        assert_eq!(json["shardSpec"]["partitionIndex"], 2);
        assert_eq!(json["shardSpec"]["totalPartitions"], 4);
        assert_eq!(json["dimensions"][0], "host");
        assert_eq!(json["metrics"][0], "visited_num");
        assert_eq!(json["metrics"][1], "unique_hosts");
        assert_eq!(json["binaryVersion"], 9);
        assert_eq!(json["size"], 1234);
        assert_eq!(json["loadSpec"]["type"], "local");
        assert_eq!(json["loadSpec"]["path"], "/data/segments/website/x/archive");
    }

    #[test]
    fn descriptor_round_trips() {
        let original = descriptor();
        let json = serde_json::to_string_pretty(&original).expect("serialize descriptor");
        let back: SegmentDescriptor = serde_json::from_str(&json).expect("deserialize descriptor");
        assert_eq!(back, original);
    }

    #[test]
    fn archive_path_rebuilds_from_identity_fields() {
        let d = descriptor();
        let rel = d.archive_rel_path().expect("valid components");
        assert_eq!(
            rel,
            layout::archive_rel_path(
                "website",
                &d.interval,
                "2014-10-22T12:00:00Z",
                2
            )
            .expect("valid components")
        );
        let text = rel.to_string_lossy();
        assert!(text.starts_with("website/20141022T000000Z_20141023T000000Z/"));
        assert!(text.ends_with("/2/index.tar.zst"));
    }
}
