//! Segment packaging: turn one unit's rolled-up rows into a published
//! archive plus descriptor sidecar.
//!
//! The archive is a zstd-compressed tar holding exactly two entries:
//! the Parquet index (`index.parquet`) and its JSON summary
//! (`index_meta.json`). It is assembled fully in memory and placed
//! with [`storage::write_atomic`], so a crash or cancellation mid-pack
//! leaves either the previous archive or nothing, never a torn file,
//! and re-packing the same unit and version is harmless.
//!
//! [`read_archive`] is the inverse: it unpacks both entries and
//! cross-checks the metadata against the decoded index before handing
//! the rows back.

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use snafu::{Backtrace, ResultExt, Snafu};

use crate::aggregate::AggregatedRow;
use crate::job_spec::granularity::TimeInterval;
use crate::job_spec::schema::IndexJobSpec;
use crate::layout::{self, LayoutError};
use crate::segment::descriptor::{LoadSpec, SegmentDescriptor, ShardSpec, SEGMENT_BINARY_VERSION};
use crate::segment::index_file::{decode_index, encode_index, DecodedIndex, IndexFileError, IndexMeta};
use crate::storage::{self, OutputLocation, StorageError};

/// Errors raised while packing or unpacking a segment archive.
#[derive(Debug, Snafu)]
pub enum PackagingError {
    /// The Parquet index could not be encoded or decoded.
    #[snafu(display("Index file error: {source}"))]
    Index {
        /// The underlying index codec error.
        #[snafu(backtrace)]
        source: IndexFileError,
    },

    /// The index metadata document could not be serialized.
    #[snafu(display("Cannot encode index metadata: {source}"))]
    MetaEncode {
        /// The underlying JSON error.
        source: serde_json::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The index metadata document could not be parsed.
    #[snafu(display("Cannot decode index metadata: {source}"))]
    MetaDecode {
        /// The underlying JSON error.
        source: serde_json::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The descriptor sidecar could not be serialized.
    #[snafu(display("Cannot encode segment descriptor: {source}"))]
    DescriptorEncode {
        /// The underlying JSON error.
        source: serde_json::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Building the tar+zstd archive failed.
    #[snafu(display("Cannot build segment archive: {source}"))]
    ArchiveBuild {
        /// The underlying I/O error.
        source: io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Reading the tar+zstd archive failed.
    #[snafu(display("Cannot read segment archive: {source}"))]
    ArchiveRead {
        /// The underlying I/O error.
        source: io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The archive lacks one of its two fixed entries.
    #[snafu(display("Segment archive has no `{name}` entry"))]
    MissingEntry {
        /// The absent entry name.
        name: &'static str,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The archive was written with an index format this reader does not know.
    #[snafu(display(
        "Archive binary version {found} is not supported (expected {})",
        SEGMENT_BINARY_VERSION
    ))]
    UnsupportedBinaryVersion {
        /// Version recorded in `index_meta.json`.
        found: i32,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The metadata row count disagrees with the decoded index.
    #[snafu(display("Archive metadata claims {meta} rows, index holds {actual}"))]
    RowCountMismatch {
        /// Row count recorded in `index_meta.json`.
        meta: u64,
        /// Row count actually decoded.
        actual: u64,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The metadata column names disagree with the decoded index.
    #[snafu(display("Archive metadata and index column names disagree"))]
    ColumnMismatch {
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A path component was unusable for the segment layout.
    #[snafu(display("Segment path error: {source}"))]
    Layout {
        /// The underlying layout error.
        #[snafu(backtrace)]
        source: LayoutError,
    },

    /// The archive or sidecar could not be written.
    #[snafu(display("Segment storage error: {source}"))]
    Storage {
        /// The underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },
}

/// A successfully packed segment, ready for publication.
#[derive(Clone, Debug)]
pub struct PackagedSegment {
    /// Descriptor to hand to the catalog.
    pub descriptor: SegmentDescriptor,
    /// Root-relative archive path, as written.
    pub archive_rel: PathBuf,
    /// Root-relative descriptor sidecar path, as written.
    pub descriptor_rel: PathBuf,
    /// Rolled-up rows inside the archive.
    pub row_count: u64,
}

/// A segment archive read back into memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnpackedSegment {
    /// The metadata entry.
    pub meta: IndexMeta,
    /// The decoded index entry.
    pub index: DecodedIndex,
}

fn append_entry(
    builder: &mut tar::Builder<Vec<u8>>,
    name: &str,
    bytes: &[u8],
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    // Fixed mode and mtime keep re-packed archives byte-identical.
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, name, bytes)
}

fn build_archive(index_bytes: &[u8], meta_bytes: &[u8]) -> Result<Vec<u8>, PackagingError> {
    let mut builder = tar::Builder::new(Vec::new());
    append_entry(&mut builder, layout::INDEX_ARTIFACT_NAME, index_bytes)
        .context(ArchiveBuildSnafu)?;
    append_entry(&mut builder, layout::INDEX_META_NAME, meta_bytes)
        .context(ArchiveBuildSnafu)?;
    let tar_bytes = builder.into_inner().context(ArchiveBuildSnafu)?;

    zstd::encode_all(tar_bytes.as_slice(), zstd::DEFAULT_COMPRESSION_LEVEL)
        .context(ArchiveBuildSnafu)
}

/// Pack one unit's rows and place the archive and descriptor sidecar
/// under the output root.
pub async fn pack_segment(
    location: &OutputLocation,
    spec: &IndexJobSpec,
    interval: &TimeInterval,
    partition_index: u32,
    rows: &[AggregatedRow],
) -> Result<PackagedSegment, PackagingError> {
    let dimensions = &spec.schema.dimensions;
    let metric_names = spec.metric_names();

    let index_bytes =
        encode_index(dimensions, &spec.schema.metrics, rows).context(IndexSnafu)?;
    let meta = IndexMeta {
        binary_version: SEGMENT_BINARY_VERSION,
        interval: *interval,
        dimensions: dimensions.clone(),
        metrics: metric_names.clone(),
        row_count: rows.len() as u64,
    };
    let meta_bytes = serde_json::to_vec_pretty(&meta).context(MetaEncodeSnafu)?;
    let archive = build_archive(&index_bytes, &meta_bytes)?;

    let data_source = &spec.schema.data_source;
    let version = &spec.tuning.version;
    let archive_rel =
        layout::archive_rel_path(data_source, interval, version, partition_index)
            .context(LayoutSnafu)?;
    let descriptor_rel =
        layout::descriptor_rel_path(data_source, interval, version, partition_index)
            .context(LayoutSnafu)?;

    storage::write_atomic(location, &archive_rel, &archive)
        .await
        .context(StorageSnafu)?;

    let descriptor = SegmentDescriptor {
        data_source: data_source.clone(),
        interval: *interval,
        version: version.clone(),
        shard_spec: ShardSpec {
            partition_index,
            total_partitions: spec.partitions.partition_count,
        },
        dimensions: dimensions.clone(),
        metrics: metric_names,
        binary_version: SEGMENT_BINARY_VERSION,
        size: archive.len() as u64,
        load_spec: LoadSpec::Local {
            path: storage::join_rel(location, &archive_rel)
                .display()
                .to_string(),
        },
    };
    let descriptor_bytes =
        serde_json::to_vec_pretty(&descriptor).context(DescriptorEncodeSnafu)?;
    storage::write_atomic(location, &descriptor_rel, &descriptor_bytes)
        .await
        .context(StorageSnafu)?;

    log::debug!(
        "Packed segment {} ({} rows, {} bytes)",
        archive_rel.display(),
        rows.len(),
        archive.len()
    );

    Ok(PackagedSegment {
        descriptor,
        archive_rel,
        descriptor_rel,
        row_count: rows.len() as u64,
    })
}

/// Unpack an archive and cross-check its metadata against the index.
pub fn read_archive(bytes: &[u8]) -> Result<UnpackedSegment, PackagingError> {
    let tar_bytes = zstd::decode_all(bytes).context(ArchiveReadSnafu)?;
    let mut archive = tar::Archive::new(tar_bytes.as_slice());

    let mut index_bytes: Option<Vec<u8>> = None;
    let mut meta_bytes: Option<Vec<u8>> = None;
    for entry in archive.entries().context(ArchiveReadSnafu)? {
        let mut entry = entry.context(ArchiveReadSnafu)?;
        let path = entry.path().context(ArchiveReadSnafu)?.into_owned();

        let mut buf = Vec::new();
        entry.read_to_end(&mut buf).context(ArchiveReadSnafu)?;
        if path == Path::new(layout::INDEX_ARTIFACT_NAME) {
            index_bytes = Some(buf);
        } else if path == Path::new(layout::INDEX_META_NAME) {
            meta_bytes = Some(buf);
        }
    }

    let index_bytes = index_bytes.ok_or_else(|| {
        MissingEntrySnafu {
            name: layout::INDEX_ARTIFACT_NAME,
        }
        .build()
    })?;
    let meta_bytes = meta_bytes.ok_or_else(|| {
        MissingEntrySnafu {
            name: layout::INDEX_META_NAME,
        }
        .build()
    })?;

    let meta: IndexMeta = serde_json::from_slice(&meta_bytes).context(MetaDecodeSnafu)?;
    if meta.binary_version != SEGMENT_BINARY_VERSION {
        return UnsupportedBinaryVersionSnafu {
            found: meta.binary_version,
        }
        .fail();
    }
    let index = decode_index(index_bytes).context(IndexSnafu)?;

    if meta.row_count != index.rows.len() as u64 {
        return RowCountMismatchSnafu {
            meta: meta.row_count,
            actual: index.rows.len() as u64,
        }
        .fail();
    }
    if meta.dimensions != index.dimensions || meta.metrics != index.metric_names {
        return ColumnMismatchSnafu.fail();
    }

    Ok(UnpackedSegment { meta, index })
}

/// Read and unpack the archive at a root-relative path.
pub async fn read_segment(
    location: &OutputLocation,
    archive_rel: &Path,
) -> Result<UnpackedSegment, PackagingError> {
    let bytes = storage::read_all_bytes(location, archive_rel)
        .await
        .context(StorageSnafu)?;
    read_archive(&bytes)
}
