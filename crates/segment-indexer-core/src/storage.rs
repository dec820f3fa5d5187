//! Local filesystem backend for segment output.
//!
//! All output (segment archives, descriptor sidecars, catalog entries)
//! lives under one [`OutputLocation`] root, addressed by root-relative
//! paths built in [`crate::layout`]. Two write primitives cover every
//! publication need:
//!
//! - [`write_atomic`]: stage to a temp file in the destination
//!   directory, fsync it, then rename over the final path. Readers see either
//!   the old complete file or the new complete file, never a partial
//!   write. Re-running a producer is harmless.
//! - [`write_new_atomic`]: stage the same way, then hard-link the temp
//!   file to the final path. The link either creates the final path
//!   with its complete content or fails with
//!   [`StorageError::AlreadyExists`], making it a put-if-absent with
//!   atomic content visibility. The loser's bytes never land.
//!
//! Temp files carry a process-unique `.tmp` suffix and are removed by a
//! drop guard whether the write succeeds, fails, or the task is
//! cancelled mid-await; at worst an abandoned `.tmp` file survives a
//! crash, and readers never look at those.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use snafu::{Backtrace, IntoError, Snafu};
use tokio::io::AsyncWriteExt;

/// Root under which one job's output tree lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputLocation {
    /// A directory on the local filesystem.
    Local {
        /// Absolute or working-directory-relative root path.
        root: PathBuf,
    },
}

impl OutputLocation {
    /// A local filesystem root.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        OutputLocation::Local { root: root.into() }
    }
}

/// Errors raised by storage operations, classified so callers can act
/// on the cases that carry meaning (absent entry, lost publish race).
#[derive(Debug, Snafu)]
pub enum StorageError {
    /// The path does not exist.
    #[snafu(display("Path not found: {}", path.display()))]
    NotFound {
        /// The missing path.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The path already exists and the operation required creating it.
    #[snafu(display("Path already exists: {}", path.display()))]
    AlreadyExists {
        /// The contested path.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Any other I/O failure.
    #[snafu(display("I/O error at {}: {source}", path.display()))]
    OtherIo {
        /// The path being operated on.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

/// Convenience alias for storage results.
pub type StorageResult<T> = Result<T, StorageError>;

fn classify_io(path: PathBuf, source: io::Error) -> StorageError {
    match source.kind() {
        io::ErrorKind::NotFound => NotFoundSnafu { path }.into_error(source),
        io::ErrorKind::AlreadyExists => AlreadyExistsSnafu { path }.into_error(source),
        _ => OtherIoSnafu { path }.into_error(source),
    }
}

/// Resolve a root-relative path to its full filesystem path.
pub fn join_rel(location: &OutputLocation, rel: &Path) -> PathBuf {
    let OutputLocation::Local { root } = location;
    root.join(rel)
}

async fn create_parent_dir(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| classify_io(parent.to_path_buf(), e))?;
    }
    Ok(())
}

/// Removes a staged temp file on drop unless disarmed.
#[derive(Debug)]
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Temp path beside `path`, unique within and across processes so two
/// concurrent writers of the same destination never share a stage file.
fn temp_sibling(path: &Path) -> PathBuf {
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stage".to_string());
    path.with_file_name(format!("{base}.{}.{seq}.tmp", std::process::id()))
}

async fn stage_bytes(tmp: &Path, bytes: &[u8]) -> StorageResult<()> {
    let mut file = tokio::fs::File::create(tmp)
        .await
        .map_err(|e| classify_io(tmp.to_path_buf(), e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| classify_io(tmp.to_path_buf(), e))?;
    file.sync_all()
        .await
        .map_err(|e| classify_io(tmp.to_path_buf(), e))?;
    Ok(())
}

/// Write `bytes` to `rel`, atomically replacing any previous content.
pub async fn write_atomic(
    location: &OutputLocation,
    rel: &Path,
    bytes: &[u8],
) -> StorageResult<()> {
    let path = join_rel(location, rel);
    create_parent_dir(&path).await?;

    let tmp = temp_sibling(&path);
    let mut guard = TempFileGuard::new(tmp.clone());
    stage_bytes(&tmp, bytes).await?;

    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|e| classify_io(path.clone(), e))?;
    guard.disarm();
    Ok(())
}

/// Write `bytes` to `rel` only if the path does not exist yet.
///
/// The final path appears with its complete content or not at all;
/// a lost race surfaces as [`StorageError::AlreadyExists`] and leaves
/// the winner's bytes untouched.
pub async fn write_new_atomic(
    location: &OutputLocation,
    rel: &Path,
    bytes: &[u8],
) -> StorageResult<()> {
    let path = join_rel(location, rel);
    create_parent_dir(&path).await?;

    let tmp = temp_sibling(&path);
    // The guard stays armed: after a successful link the temp path is a
    // second name for the same inode and still needs removing.
    let _guard = TempFileGuard::new(tmp.clone());
    stage_bytes(&tmp, bytes).await?;

    tokio::fs::hard_link(&tmp, &path)
        .await
        .map_err(|e| classify_io(path.clone(), e))?;
    Ok(())
}

/// Read the full contents of `rel`.
pub async fn read_all_bytes(location: &OutputLocation, rel: &Path) -> StorageResult<Vec<u8>> {
    let path = join_rel(location, rel);
    tokio::fs::read(&path)
        .await
        .map_err(|e| classify_io(path.clone(), e))
}

/// Read `rel` as UTF-8 text.
pub async fn read_to_string(location: &OutputLocation, rel: &Path) -> StorageResult<String> {
    let path = join_rel(location, rel);
    tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| classify_io(path.clone(), e))
}

/// Recursively list regular files under `rel_dir`, returned as sorted
/// root-relative paths. A directory that was never created lists as
/// empty rather than an error.
pub async fn list_files(location: &OutputLocation, rel_dir: &Path) -> StorageResult<Vec<PathBuf>> {
    let OutputLocation::Local { root } = location;
    let base = join_rel(location, rel_dir);

    let mut pending = vec![base.clone()];
    let mut files = Vec::new();
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound && dir == base => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(classify_io(dir, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| classify_io(dir.clone(), e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| classify_io(entry.path(), e))?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if let Ok(rel) = entry.path().strip_prefix(root) {
                files.push(rel.to_path_buf());
            } else {
                debug_assert!(false, "listed entry escaped the output root");
            }
        }
    }

    files.sort();
    Ok(files)
}
