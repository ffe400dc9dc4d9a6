//! Snapshot cache read/write.
//!
//! The last snapshot is stored between runs so the first tick after a restart
//! reports what changed while the engine was stopped. Format: postcard
//! encoding inside a zstd stream, written to a temp file and renamed into
//! place.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::Snapshot;
use crate::error::{Result, WatchError};
use crate::types::{unix_now_secs, FileStub};

/// Cache format version - increment when changing the format.
pub const SNAPSHOT_CACHE_VERSION: u32 = 1;

const ZSTD_LEVEL: i32 = 3;

#[derive(Serialize, Deserialize)]
struct PersistentSnapshot {
    version: u32,
    /// Root the snapshot was taken under.
    root: PathBuf,
    saved_at: u64,
    entries: Vec<FileStub>,
}

/// Writes `snapshot` to `cache_path`.
pub fn write_snapshot_cache(cache_path: &Path, root: &Path, snapshot: &Snapshot) -> Result<()> {
    let storage = PersistentSnapshot {
        version: SNAPSHOT_CACHE_VERSION,
        root: root.to_path_buf(),
        saved_at: unix_now_secs(),
        entries: snapshot.to_sorted_vec(),
    };

    if let Some(parent) = cache_path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            WatchError::Cache(format!(
                "failed to create snapshot cache directory {}: {error}",
                parent.display()
            ))
        })?;
    }

    // Write to temp file first for atomic operation
    let tmp_path = cache_path.with_extension("tmp");
    let written = write_encoded(&tmp_path, &storage).and_then(|()| {
        fs::rename(&tmp_path, cache_path).map_err(|error| {
            WatchError::Cache(format!(
                "failed to finalize snapshot cache {}: {error}",
                cache_path.display()
            ))
        })
    });
    if let Err(error) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(error);
    }

    log::debug!(
        "wrote snapshot cache to {} ({} files)",
        cache_path.display(),
        snapshot.len()
    );
    Ok(())
}

/// Encodes `storage` into `path` and returns only once the zstd frame is
/// complete and the file is synced.
fn write_encoded(path: &Path, storage: &PersistentSnapshot) -> Result<()> {
    let output = File::create(path).map_err(|error| {
        WatchError::Cache(format!(
            "failed to create cache file {}: {error}",
            path.display()
        ))
    })?;

    let encoder = zstd::Encoder::new(output, ZSTD_LEVEL)
        .map_err(|error| WatchError::Cache(format!("failed to create zstd encoder: {error}")))?;
    let mut output = BufWriter::new(encoder);

    postcard::to_io(storage, &mut output).map_err(|error| {
        WatchError::Cache(format!("failed to encode snapshot with postcard: {error}"))
    })?;

    let encoder = output.into_inner().map_err(|error| {
        WatchError::Cache(format!("failed to flush snapshot cache: {}", error.error()))
    })?;
    let file = encoder
        .finish()
        .map_err(|error| WatchError::Cache(format!("failed to finish zstd stream: {error}")))?;
    file.sync_all().map_err(|error| {
        WatchError::Cache(format!(
            "failed to sync cache file {}: {error}",
            path.display()
        ))
    })
}

/// Loads a snapshot saved for `root`.
///
/// Any problem (missing file, corrupt data, version or root mismatch) yields
/// `None`; the caller rebuilds from disk.
pub fn load_snapshot_cache(cache_path: &Path, root: &Path) -> Option<Snapshot> {
    let input = match File::open(cache_path) {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => return None,
        Err(error) => {
            log::warn!(
                "snapshot cache read failed for {}: {}",
                cache_path.display(),
                error
            );
            return None;
        }
    };

    let decoder = match zstd::Decoder::new(input) {
        Ok(d) => d,
        Err(error) => {
            log::warn!(
                "snapshot cache decompress failed for {}: {}",
                cache_path.display(),
                error
            );
            return None;
        }
    };

    let mut input = BufReader::new(decoder);
    let mut scratch = vec![0u8; 4 * 1024];

    let storage: PersistentSnapshot = match postcard::from_io((&mut input, &mut scratch)) {
        Ok((s, _)) => s,
        Err(error) => {
            log::warn!(
                "snapshot cache decode failed for {}: {}",
                cache_path.display(),
                error
            );
            return None;
        }
    };

    if storage.version != SNAPSHOT_CACHE_VERSION {
        log::debug!(
            "snapshot cache version mismatch: {} != {}",
            storage.version,
            SNAPSHOT_CACHE_VERSION
        );
        return None;
    }

    if storage.root != root {
        log::debug!(
            "snapshot cache root mismatch: {:?} != {:?}",
            storage.root,
            root
        );
        return None;
    }

    let snapshot = Snapshot::from_stubs(storage.entries);
    log::debug!(
        "loaded snapshot cache from {} ({} files, saved_at={})",
        cache_path.display(),
        snapshot.len(),
        storage.saved_at
    );
    Some(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::tests::stub;
    use tempfile::TempDir;

    #[test]
    fn cache_restores_written_snapshot() {
        let temp = TempDir::new().expect("tempdir");
        let cache = temp.path().join("state/snapshot.bin.zst");
        let root = Path::new("/vault");
        let snapshot = Snapshot::from_stubs(vec![stub("a.md", 1, 10), stub("b/c.md", 20, 11)]);

        write_snapshot_cache(&cache, root, &snapshot).expect("write");
        let loaded = load_snapshot_cache(&cache, root).expect("load");
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn written_cache_is_a_complete_zstd_frame() {
        let temp = TempDir::new().expect("tempdir");
        let cache = temp.path().join("snapshot.bin.zst");
        let snapshot = Snapshot::from_stubs(vec![stub("a.md", 1, 10)]);

        write_snapshot_cache(&cache, Path::new("/vault"), &snapshot).expect("write");
        let bytes = fs::read(&cache).expect("read");
        let decoded = zstd::decode_all(bytes.as_slice()).expect("complete frame");
        assert!(!decoded.is_empty());
        assert!(!temp.path().join("snapshot.bin.tmp").exists());
    }

    #[test]
    fn failed_write_leaves_no_temp_file() {
        let temp = TempDir::new().expect("tempdir");
        // A non-empty directory in the way makes the final rename fail.
        let cache = temp.path().join("snapshot.bin.zst");
        fs::create_dir_all(cache.join("occupied")).expect("mkdir");
        let snapshot = Snapshot::from_stubs(vec![stub("a.md", 1, 10)]);

        let result = write_snapshot_cache(&cache, Path::new("/vault"), &snapshot);
        assert!(matches!(result, Err(WatchError::Cache(_))));
        assert!(!temp.path().join("snapshot.bin.tmp").exists());
        assert!(cache.is_dir());
    }

    #[test]
    fn cache_for_other_root_is_ignored() {
        let temp = TempDir::new().expect("tempdir");
        let cache = temp.path().join("snapshot.bin.zst");
        let snapshot = Snapshot::from_stubs(vec![stub("a.md", 1, 10)]);

        write_snapshot_cache(&cache, Path::new("/vault"), &snapshot).expect("write");
        assert!(load_snapshot_cache(&cache, Path::new("/elsewhere")).is_none());
    }

    #[test]
    fn corrupt_cache_is_ignored() {
        let temp = TempDir::new().expect("tempdir");
        let cache = temp.path().join("snapshot.bin.zst");
        fs::write(&cache, b"definitely not zstd").expect("write");
        assert!(load_snapshot_cache(&cache, Path::new("/vault")).is_none());
        assert!(load_snapshot_cache(&temp.path().join("missing"), Path::new("/vault")).is_none());
    }
}
