//! Directory and file layout conventions for segment output.
//!
//! Everything a job writes lives under one output root:
//!
//! ```text
//! <output_root>/
//!   <data_source>/
//!     <bucket_start>_<bucket_end>/      (compact ISO-8601, e.g. 20141022T000000Z)
//!       <version>/
//!         <partition_index>/
//!           index.tar.zst               (the segment archive)
//!           descriptor.json             (copy of the published descriptor)
//!   _segment_catalog/                   (descriptor catalog)
//!     <data_source>/
//!       <bucket_start>_<bucket_end>/
//!         <partition_index>.json
//! ```
//!
//! The functions here return *relative* [`PathBuf`] values; callers join
//! them with an output location before doing IO. Every path is
//! reconstructible from descriptor fields alone, so consumers never need
//! a lookup to find an archive.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use snafu::{Backtrace, Snafu};

use crate::job_spec::TimeInterval;

/// File name of the segment archive inside its partition directory.
pub const ARCHIVE_FILE_NAME: &str = "index.tar.zst";
/// File name of the descriptor copy written next to the archive.
pub const DESCRIPTOR_FILE_NAME: &str = "descriptor.json";
/// Root directory of the descriptor catalog.
pub const CATALOG_DIR_NAME: &str = "_segment_catalog";
/// Name of the Parquet artifact inside a segment archive.
pub const INDEX_ARTIFACT_NAME: &str = "index.parquet";
/// Name of the metadata artifact inside a segment archive.
pub const INDEX_META_NAME: &str = "index_meta.json";

/// Errors that can occur while building layout paths.
#[derive(Debug, Snafu)]
pub enum LayoutError {
    /// A path component failed validation.
    #[snafu(display("Invalid path component: {component}"))]
    InvalidComponent {
        /// The offending component.
        component: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

/// Validates that a value is safe to embed as a single path component.
///
/// A valid component must:
/// - Not be empty and not exceed 128 characters
/// - Contain at least one ASCII alphanumeric and not start with a dot
/// - Not contain path separators (`/`, `\`) or `..` sequences
/// - Only contain ASCII alphanumeric characters, dots, underscores,
///   hyphens, and colons (versions are often RFC 3339 timestamps)
pub fn validate_path_component(component: &str) -> Result<(), LayoutError> {
    let invalid = || {
        InvalidComponentSnafu {
            component: component.to_string(),
        }
        .fail()
    };

    if component.is_empty() || component.len() > 128 {
        return invalid();
    }
    if !component.chars().any(|c| c.is_ascii_alphanumeric()) {
        return invalid();
    }
    if component.starts_with('.') {
        return invalid();
    }
    if component.contains('/') || component.contains('\\') || component.contains("..") {
        return invalid();
    }

    let ok = component
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':'));
    if !ok {
        return invalid();
    }

    Ok(())
}

/// Render a timestamp in compact ISO-8601 basic form (`20141022T000000Z`).
///
/// Path components avoid the extended form because its colons trip
/// conservative filename validation on some filesystems.
pub fn compact_utc(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Directory component naming a bucket: `<start>_<end>` in compact form.
pub fn bucket_dir_name(interval: &TimeInterval) -> String {
    format!(
        "{}_{}",
        compact_utc(interval.start()),
        compact_utc(interval.end())
    )
}

/// Relative path: `<data_source>/<start>_<end>/<version>/<partition>/`.
pub fn segment_rel_dir(
    data_source: &str,
    interval: &TimeInterval,
    version: &str,
    partition_index: u32,
) -> Result<PathBuf, LayoutError> {
    validate_path_component(data_source)?;
    validate_path_component(version)?;

    let mut p = PathBuf::from(data_source);
    p.push(bucket_dir_name(interval));
    p.push(version);
    p.push(partition_index.to_string());
    Ok(p)
}

/// Relative path of the segment archive for one (bucket, partition).
pub fn archive_rel_path(
    data_source: &str,
    interval: &TimeInterval,
    version: &str,
    partition_index: u32,
) -> Result<PathBuf, LayoutError> {
    Ok(segment_rel_dir(data_source, interval, version, partition_index)?
        .join(ARCHIVE_FILE_NAME))
}

/// Relative path of the descriptor copy next to the archive.
pub fn descriptor_rel_path(
    data_source: &str,
    interval: &TimeInterval,
    version: &str,
    partition_index: u32,
) -> Result<PathBuf, LayoutError> {
    Ok(segment_rel_dir(data_source, interval, version, partition_index)?
        .join(DESCRIPTOR_FILE_NAME))
}

/// Relative path: `_segment_catalog/<data_source>/`.
pub fn catalog_rel_dir(data_source: &str) -> Result<PathBuf, LayoutError> {
    validate_path_component(data_source)?;
    let mut p = PathBuf::from(CATALOG_DIR_NAME);
    p.push(data_source);
    Ok(p)
}

/// Relative path of one catalog entry, keyed by
/// `(data_source, interval, partition_index)`.
pub fn catalog_entry_rel_path(
    data_source: &str,
    interval: &TimeInterval,
    partition_index: u32,
) -> Result<PathBuf, LayoutError> {
    let mut p = catalog_rel_dir(data_source)?;
    p.push(bucket_dir_name(interval));
    p.push(format!("{partition_index}.json"));
    Ok(p)
}
