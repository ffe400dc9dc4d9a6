//! Filesystem access for the engine and its consumer.
//!
//! All paths crossing this API are root-relative and slash-separated; see
//! [`normalize_path`]. Missing files are ordinary outcomes here: `stat`
//! returns `None` and `read_content` returns [`ReadOutcome::Missing`] rather
//! than an error, because a file vanishing between detection and read is
//! routine for a poller.

mod path;
mod touched;
mod trash;
mod walk;

use std::future::Future;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use crate::config::WatchConfig;
use crate::error::{Result, WatchError};
use crate::keyed_lock::KeyedMutex;
use crate::types::FileStub;

pub use path::{join_root, normalize_path, path_is_ignored, relative_to_root};
pub use touched::TouchedRegistry;
pub use trash::trash_file_name;
pub use walk::{list_dir, walk_tree, WalkData};

/// Result of reading a file's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Content(Vec<u8>),
    /// The file did not exist at read time.
    Missing,
    Failed(String),
}

impl ReadOutcome {
    pub fn into_content(self) -> Option<Vec<u8>> {
        match self {
            Self::Content(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Result of moving a path to the trash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrashOutcome {
    /// Renamed to this absolute destination.
    Moved(PathBuf),
    /// Rename failed and the path was deleted instead.
    Deleted,
    /// Nothing existed at the path.
    Missing,
}

/// Options for [`StorageAdapter::write_atomic`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Modification time to stamp, in Unix milliseconds.
    pub mtime: Option<u64>,
    /// Creation time to stamp, in Unix milliseconds. Ignored where the
    /// platform cannot set it.
    pub ctime: Option<u64>,
    /// Record the write as self-induced so it is not echoed as a local change.
    pub mark_touched: bool,
}

#[derive(Debug)]
pub struct StorageAdapter {
    root: PathBuf,
    trash_dir: PathBuf,
    /// Trash directory plus configured ignored roots.
    ignored_roots: Vec<PathBuf>,
    locks: KeyedMutex,
    touched: TouchedRegistry,
}

impl StorageAdapter {
    pub fn new(
        root: PathBuf,
        trash_dir: PathBuf,
        mut ignored_roots: Vec<PathBuf>,
        touched_ttl: Duration,
    ) -> Self {
        ignored_roots.push(trash_dir.clone());
        ignored_roots.sort();
        ignored_roots.dedup();
        Self {
            root,
            trash_dir,
            ignored_roots,
            locks: KeyedMutex::new(),
            touched: TouchedRegistry::new(touched_ttl),
        }
    }

    pub fn from_config(config: &WatchConfig) -> Self {
        Self::new(
            config.root.clone(),
            config.trash_dir(),
            config.ignored_roots.clone(),
            config.touched_ttl(),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn trash_dir(&self) -> &Path {
        &self.trash_dir
    }

    pub fn ignored_roots(&self) -> &[PathBuf] {
        &self.ignored_roots
    }

    /// The keyed lock behind [`exclusive_scope`](Self::exclusive_scope).
    pub fn locks(&self) -> &KeyedMutex {
        &self.locks
    }

    /// Normalizes a file path and resolves it against the root.
    pub fn resolve(&self, path: &str) -> Result<(String, PathBuf)> {
        let normalized = normalize_path(path)?;
        if normalized.is_empty() {
            return Err(WatchError::InvalidPath(format!(
                "path refers to the root: {path:?}"
            )));
        }
        let absolute = join_root(&self.root, &normalized);
        Ok((normalized, absolute))
    }

    pub async fn stat(&self, path: &str) -> Option<FileStub> {
        let (normalized, absolute) = match self.resolve(path) {
            Ok(resolved) => resolved,
            Err(error) => {
                log::debug!("stat rejected {path}: {error}");
                return None;
            }
        };
        match tokio::fs::symlink_metadata(&absolute).await {
            Ok(metadata) => Some(FileStub::from_metadata(normalized, &metadata)),
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    log::debug!("stat failed for {}: {error}", absolute.display());
                }
                None
            }
        }
    }

    pub async fn read_content(&self, path: &str) -> ReadOutcome {
        let absolute = match self.resolve(path) {
            Ok((_, absolute)) => absolute,
            Err(error) => return ReadOutcome::Failed(error.to_string()),
        };
        match tokio::fs::read(&absolute).await {
            Ok(bytes) => ReadOutcome::Content(bytes),
            Err(error) if error.kind() == ErrorKind::NotFound => ReadOutcome::Missing,
            Err(error) => ReadOutcome::Failed(format!(
                "failed to read {}: {error}",
                absolute.display()
            )),
        }
    }

    /// Writes `bytes` through a temp file in the target directory and renames
    /// it into place, creating parent directories as needed.
    pub async fn write_atomic(
        &self,
        path: &str,
        bytes: &[u8],
        options: WriteOptions,
    ) -> Result<FileStub> {
        let (normalized, absolute) = self.resolve(path)?;
        if options.mark_touched {
            // Marked before the write so a concurrent poll cannot observe the
            // new content unmarked.
            self.touched.mark(&normalized);
        }
        let bytes = bytes.to_vec();
        let target = absolute.clone();
        let metadata =
            tokio::task::spawn_blocking(move || write_file_blocking(&target, &bytes, options))
                .await
                .map_err(|error| WatchError::Internal(format!("write task failed: {error}")))??;
        Ok(FileStub::from_metadata(normalized, &metadata))
    }

    /// Removes a file, or a directory recursively.
    ///
    /// A missing target is an error unless `force` is set.
    pub async fn delete(&self, path: &str, force: bool) -> Result<()> {
        let (_, absolute) = self.resolve(path)?;
        let metadata = match tokio::fs::symlink_metadata(&absolute).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return if force {
                    Ok(())
                } else {
                    Err(WatchError::PathNotFound(absolute))
                };
            }
            Err(error) => return Err(error.into()),
        };
        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&absolute).await
        } else {
            tokio::fs::remove_file(&absolute).await
        };
        match removed {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound && force => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(WatchError::PathNotFound(absolute))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Renames a path into the trash directory, falling back to a forced
    /// delete when the rename fails (for example across devices).
    pub async fn move_to_trash(&self, path: &str) -> Result<TrashOutcome> {
        let (normalized, absolute) = self.resolve(path)?;
        match tokio::fs::symlink_metadata(&absolute).await {
            Ok(_) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(TrashOutcome::Missing),
            Err(error) => return Err(error.into()),
        }

        if let Err(error) = tokio::fs::create_dir_all(&self.trash_dir).await {
            log::warn!(
                "trash directory {} unavailable, deleting {normalized}: {error}",
                self.trash_dir.display()
            );
            self.delete(&normalized, true).await?;
            return Ok(TrashOutcome::Deleted);
        }

        let mut destination = self.trash_dir.join(trash_file_name(&normalized));
        while tokio::fs::try_exists(&destination).await.unwrap_or(false) {
            destination = self.trash_dir.join(trash_file_name(&normalized));
        }

        match tokio::fs::rename(&absolute, &destination).await {
            Ok(()) => {
                log::debug!("trashed {normalized} -> {}", destination.display());
                Ok(TrashOutcome::Moved(destination))
            }
            Err(error) => {
                log::warn!("trash rename failed for {normalized}, deleting instead: {error}");
                self.delete(&normalized, true).await?;
                Ok(TrashOutcome::Deleted)
            }
        }
    }

    /// Recursively lists every regular file under `dir` ("" for the root).
    ///
    /// Blocking; the poll loop calls it from the blocking pool.
    pub fn enumerate(&self, dir: &str) -> Result<Vec<FileStub>> {
        let normalized = normalize_path(dir)?;
        let start = join_root(&self.root, &normalized);
        let walk_data = WalkData::new(&self.root, &self.ignored_roots);
        walk_tree(&walk_data, &start)
    }

    /// Lists the direct children of `dir` ("" for the root), files and folders.
    pub fn list(&self, dir: &str) -> Result<Vec<FileStub>> {
        let normalized = normalize_path(dir)?;
        let start = join_root(&self.root, &normalized);
        let mut stubs = list_dir(&self.root, &start)?;
        stubs.retain(|stub| {
            !path_is_ignored(&self.ignored_roots, &join_root(&self.root, &stub.path))
        });
        Ok(stubs)
    }

    /// Runs `op` with exclusive access to `path`.
    ///
    /// Shares its lock with the event queue's per-path dispatch, so a direct
    /// read-then-write cannot interleave with a background dispatch of the
    /// same path.
    pub async fn exclusive_scope<F, Fut, T>(&self, path: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let normalized = normalize_path(path)?;
        Ok(self.locks.run(&normalized, op).await)
    }

    pub fn mark_touched(&self, path: &str) {
        match normalize_path(path) {
            Ok(normalized) => self.touched.mark(&normalized),
            Err(error) => log::debug!("mark_touched rejected {path}: {error}"),
        }
    }

    pub fn was_recently_touched(&self, path: &str) -> bool {
        normalize_path(path)
            .map(|normalized| self.touched.was_recently_touched(&normalized))
            .unwrap_or(false)
    }

    pub fn touched(&self) -> &TouchedRegistry {
        &self.touched
    }
}

fn write_file_blocking(
    target: &Path,
    bytes: &[u8],
    options: WriteOptions,
) -> Result<std::fs::Metadata> {
    let parent = target
        .parent()
        .ok_or_else(|| WatchError::InvalidPath(format!("no parent for {}", target.display())))?;
    std::fs::create_dir_all(parent).map_err(|error| {
        WatchError::Internal(format!(
            "failed to create directory {}: {error}",
            parent.display()
        ))
    })?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;

    let mut times = std::fs::FileTimes::new();
    let mut stamp = false;
    if let Some(mtime) = options.mtime {
        times = times.set_modified(UNIX_EPOCH + Duration::from_millis(mtime));
        stamp = true;
    }
    if let Some(ctime) = options.ctime {
        if let Some(updated) = with_created(times, ctime) {
            times = updated;
            stamp = true;
        }
    }
    if stamp {
        temp.as_file().set_times(times)?;
    }

    temp.persist(target).map_err(|error| {
        WatchError::Internal(format!(
            "failed to move temp file into {}: {}",
            target.display(),
            error.error
        ))
    })?;
    Ok(std::fs::symlink_metadata(target)?)
}

#[cfg(target_os = "macos")]
fn with_created(times: std::fs::FileTimes, ctime: u64) -> Option<std::fs::FileTimes> {
    use std::os::macos::fs::FileTimesExt;
    Some(times.set_created(UNIX_EPOCH + Duration::from_millis(ctime)))
}

#[cfg(target_os = "windows")]
fn with_created(times: std::fs::FileTimes, ctime: u64) -> Option<std::fs::FileTimes> {
    use std::os::windows::fs::FileTimesExt;
    Some(times.set_created(UNIX_EPOCH + Duration::from_millis(ctime)))
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn with_created(_times: std::fs::FileTimes, _ctime: u64) -> Option<std::fs::FileTimes> {
    None
}
