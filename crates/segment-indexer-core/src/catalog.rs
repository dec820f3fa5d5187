//! Append-only catalog of published segment descriptors.
//!
//! The catalog is a key-value store keyed by `(dataSource, interval,
//! partitionIndex)` with three primitives: insert-if-absent, point
//! lookup, and scan. Entries are never updated or deleted.
//! [`DescriptorCatalog`]
//! is the seam for alternative backings, and [`FileDescriptorCatalog`]
//! is the bundled one: a `_segment_catalog/` tree under the output
//! root with one JSON document per segment, created via hard-link
//! put-if-absent so a lost publish race can never clobber or truncate
//! the winner's entry.
//!
//! [`publish`] layers the retry policy on top: republishing an
//! identical descriptor is reported as [`PublishOutcome::AlreadyPublished`]
//! and warned about, while a differing descriptor under an occupied
//! key is a hard [`CatalogError::Conflict`].

use std::path::PathBuf;

use async_trait::async_trait;
use snafu::{Backtrace, ResultExt, Snafu};

use crate::job_spec::granularity::TimeInterval;
use crate::layout::{self, LayoutError};
use crate::segment::descriptor::SegmentDescriptor;
use crate::storage::{self, OutputLocation, StorageError};

/// Errors raised by catalog operations.
#[derive(Debug, Snafu)]
pub enum CatalogError {
    /// A descriptor field was unusable as a catalog path component.
    #[snafu(display("Catalog path error: {source}"))]
    Layout {
        /// The underlying layout error.
        #[snafu(backtrace)]
        source: LayoutError,
    },

    /// The backing store failed.
    #[snafu(display("Catalog storage error: {source}"))]
    Storage {
        /// The underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// A descriptor could not be serialized.
    #[snafu(display("Cannot encode catalog entry: {source}"))]
    Encode {
        /// The underlying JSON error.
        source: serde_json::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A stored entry could not be parsed.
    #[snafu(display("Corrupt catalog entry at {}: {source}", path.display()))]
    Decode {
        /// Root-relative path of the corrupt entry.
        path: PathBuf,
        /// The underlying JSON error.
        source: serde_json::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A key reported as occupied could not be read back.
    #[snafu(display(
        "Catalog entry for {data_source} {interval} partition {partition_index} \
         exists but cannot be read back"
    ))]
    EntryVanished {
        /// Data source of the key.
        data_source: String,
        /// Bucket interval of the key.
        interval: TimeInterval,
        /// Partition index of the key.
        partition_index: u32,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A different segment is already published under the same key.
    #[snafu(display(
        "A different segment is already published for {data_source} {interval} \
         partition {partition_index}"
    ))]
    Conflict {
        /// Data source of the contested key.
        data_source: String,
        /// Bucket interval of the contested key.
        interval: TimeInterval,
        /// Partition index of the contested key.
        partition_index: u32,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

/// Result of an insert-if-absent attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// The key was free and the entry was created.
    Created,
    /// The key was already occupied; nothing was written.
    KeyExists,
}

/// Result of a [`publish`] call that did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The descriptor was newly recorded.
    Published,
    /// An identical descriptor was already recorded.
    AlreadyPublished,
}

/// Append-only descriptor store keyed by
/// `(dataSource, interval, partitionIndex)`.
#[async_trait]
pub trait DescriptorCatalog: Send + Sync {
    /// Record the descriptor under its key if the key is free. Never
    /// overwrites; losing a race leaves the existing entry intact.
    async fn put_if_absent(
        &self,
        descriptor: &SegmentDescriptor,
    ) -> Result<PutOutcome, CatalogError>;

    /// Fetch the entry under a key, if any.
    async fn get(
        &self,
        data_source: &str,
        interval: &TimeInterval,
        partition_index: u32,
    ) -> Result<Option<SegmentDescriptor>, CatalogError>;

    /// Every descriptor recorded for a data source, sorted by bucket
    /// interval and partition index.
    async fn scan(&self, data_source: &str) -> Result<Vec<SegmentDescriptor>, CatalogError>;
}

/// Descriptors a specific job run published for a data source, i.e.
/// the [`DescriptorCatalog::scan`] result narrowed to one version.
pub async fn list_published(
    catalog: &dyn DescriptorCatalog,
    data_source: &str,
    version: &str,
) -> Result<Vec<SegmentDescriptor>, CatalogError> {
    let mut descriptors = catalog.scan(data_source).await?;
    descriptors.retain(|d| d.version == version);
    Ok(descriptors)
}

/// Publish a descriptor with idempotent-retry semantics.
///
/// A key occupied by a byte-for-byte identical descriptor means a
/// previous run already got this far; that is reported as
/// [`PublishOutcome::AlreadyPublished`] with a warning. A key occupied
/// by anything else is a conflict and fails the unit.
pub async fn publish(
    catalog: &dyn DescriptorCatalog,
    descriptor: &SegmentDescriptor,
) -> Result<PublishOutcome, CatalogError> {
    match catalog.put_if_absent(descriptor).await? {
        PutOutcome::Created => Ok(PublishOutcome::Published),
        PutOutcome::KeyExists => {
            let data_source = &descriptor.data_source;
            let interval = &descriptor.interval;
            let partition_index = descriptor.shard_spec.partition_index;

            let existing = catalog
                .get(data_source, interval, partition_index)
                .await?
                .ok_or_else(|| {
                    EntryVanishedSnafu {
                        data_source,
                        interval: *interval,
                        partition_index,
                    }
                    .build()
                })?;

            if existing == *descriptor {
                log::warn!(
                    "Segment {data_source} {interval} partition {partition_index} \
                     is already published; keeping the existing entry"
                );
                Ok(PublishOutcome::AlreadyPublished)
            } else {
                ConflictSnafu {
                    data_source,
                    interval: *interval,
                    partition_index,
                }
                .fail()
            }
        }
    }
}

/// Catalog entries as JSON files under `_segment_catalog/` in the
/// output root.
#[derive(Clone, Debug)]
pub struct FileDescriptorCatalog {
    location: OutputLocation,
}

impl FileDescriptorCatalog {
    /// A catalog rooted at the given output location.
    pub fn new(location: OutputLocation) -> Self {
        Self { location }
    }
}

#[async_trait]
impl DescriptorCatalog for FileDescriptorCatalog {
    async fn put_if_absent(
        &self,
        descriptor: &SegmentDescriptor,
    ) -> Result<PutOutcome, CatalogError> {
        let rel = layout::catalog_entry_rel_path(
            &descriptor.data_source,
            &descriptor.interval,
            descriptor.shard_spec.partition_index,
        )
        .context(LayoutSnafu)?;
        let bytes = serde_json::to_vec_pretty(descriptor).context(EncodeSnafu)?;

        match storage::write_new_atomic(&self.location, &rel, &bytes).await {
            Ok(()) => Ok(PutOutcome::Created),
            Err(StorageError::AlreadyExists { .. }) => Ok(PutOutcome::KeyExists),
            Err(e) => Err(e).context(StorageSnafu),
        }
    }

    async fn get(
        &self,
        data_source: &str,
        interval: &TimeInterval,
        partition_index: u32,
    ) -> Result<Option<SegmentDescriptor>, CatalogError> {
        let rel = layout::catalog_entry_rel_path(data_source, interval, partition_index)
            .context(LayoutSnafu)?;

        match storage::read_to_string(&self.location, &rel).await {
            Ok(text) => {
                let descriptor =
                    serde_json::from_str(&text).context(DecodeSnafu { path: rel })?;
                Ok(Some(descriptor))
            }
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e).context(StorageSnafu),
        }
    }

    async fn scan(&self, data_source: &str) -> Result<Vec<SegmentDescriptor>, CatalogError> {
        let dir = layout::catalog_rel_dir(data_source).context(LayoutSnafu)?;
        let files = storage::list_files(&self.location, &dir)
            .await
            .context(StorageSnafu)?;

        let mut descriptors = Vec::new();
        for rel in files {
            // Only committed entries count; staged temp files and other
            // debris are not part of the catalog.
            if rel.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = storage::read_to_string(&self.location, &rel)
                .await
                .context(StorageSnafu)?;
            let descriptor: SegmentDescriptor =
                serde_json::from_str(&text).context(DecodeSnafu { path: rel })?;
            descriptors.push(descriptor);
        }

        descriptors.sort_by_key(|d| (d.interval, d.shard_spec.partition_index));
        Ok(descriptors)
    }
}
