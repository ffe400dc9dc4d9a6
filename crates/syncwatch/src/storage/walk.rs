//! Parallel recursive walk producing flat `FileStub` lists.
//!
//! Directories are read with rayon, one task per child directory, and the
//! per-directory results are concatenated and sorted by path at the end so
//! the output order is deterministic regardless of thread scheduling.
//!
//! A directory that exists but cannot be read fails the whole walk: a
//! listing with a silently missing subtree would diff as a mass deletion.
//! Entries that vanish between readdir and stat are skipped.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use rayon::prelude::*;

use super::path::{path_is_ignored, relative_to_root};
use crate::error::{Result, WatchError};
use crate::types::FileStub;

/// Data passed to the parallel walker.
#[derive(Debug)]
pub struct WalkData<'a> {
    /// Number of files recorded.
    pub num_files: AtomicUsize,
    /// Number of directories descended into.
    pub num_dirs: AtomicUsize,
    /// Directories or directory entries that could not be read.
    pub errors: AtomicUsize,
    /// Entries that disappeared mid-walk.
    pub vanished: AtomicUsize,
    /// Cancellation flag (checked per directory entry).
    pub cancel: Option<&'a AtomicBool>,
    /// Root the emitted paths are relative to.
    pub root_path: &'a Path,
    /// Paths to skip entirely.
    pub ignore_directories: &'a [PathBuf],
    /// Whether folders are emitted alongside files.
    pub include_folders: bool,
}

impl<'a> WalkData<'a> {
    pub fn new(root_path: &'a Path, ignore_directories: &'a [PathBuf]) -> Self {
        Self {
            num_files: AtomicUsize::new(0),
            num_dirs: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            vanished: AtomicUsize::new(0),
            cancel: None,
            root_path,
            ignore_directories,
            include_folders: false,
        }
    }

    pub fn with_cancel(mut self, cancel: &'a AtomicBool) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_folders(mut self) -> Self {
        self.include_folders = true;
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

/// Walks `start` recursively.
///
/// Fails if any directory under `start` (or `start` itself) cannot be read,
/// or the walk was cancelled; a partial listing is never returned, since
/// callers diff it against a previous full listing.
pub fn walk_tree(walk_data: &WalkData, start: &Path) -> Result<Vec<FileStub>> {
    let read_dir = fs::read_dir(start).map_err(|error| {
        WatchError::Internal(format!("failed to read {}: {error}", start.display()))
    })?;
    let entries = collect_entries(read_dir, walk_data);
    let mut stubs = walk_entries(entries, walk_data);

    if walk_data.is_cancelled() {
        return Err(WatchError::Internal(format!(
            "walk of {} cancelled",
            start.display()
        )));
    }

    let errors = walk_data.errors.load(Ordering::Relaxed);
    if errors > 0 {
        return Err(WatchError::Internal(format!(
            "walk of {} incomplete: {errors} unreadable entries",
            start.display()
        )));
    }

    stubs.sort_unstable_by(|a, b| a.path.cmp(&b.path));
    Ok(stubs)
}

fn collect_entries(read_dir: fs::ReadDir, walk_data: &WalkData) -> Vec<fs::DirEntry> {
    let mut entries = Vec::new();
    for entry in read_dir {
        match entry {
            Ok(entry) => entries.push(entry),
            Err(_) => {
                walk_data.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    entries
}

/// Reads the children of `dir`, recording a failure unless `dir` vanished.
fn read_children(dir: &Path, walk_data: &WalkData) -> Vec<fs::DirEntry> {
    match fs::read_dir(dir) {
        Ok(read_dir) => collect_entries(read_dir, walk_data),
        Err(error) if error.kind() == ErrorKind::NotFound => {
            walk_data.vanished.fetch_add(1, Ordering::Relaxed);
            Vec::new()
        }
        Err(error) => {
            log::warn!("walk cannot read {}: {error}", dir.display());
            walk_data.errors.fetch_add(1, Ordering::Relaxed);
            Vec::new()
        }
    }
}

fn walk_entries(entries: Vec<fs::DirEntry>, walk_data: &WalkData) -> Vec<FileStub> {
    entries
        .into_par_iter()
        .flat_map_iter(|entry| walk_entry(entry, walk_data))
        .collect()
}

fn walk_entry(entry: fs::DirEntry, walk_data: &WalkData) -> Vec<FileStub> {
    if walk_data.is_cancelled() {
        return Vec::new();
    }

    let path = entry.path();
    if path_is_ignored(walk_data.ignore_directories, &path) {
        return Vec::new();
    }

    let Some(relative) = relative_to_root(walk_data.root_path, &path) else {
        return Vec::new();
    };

    // Get metadata without following symlinks
    let metadata = match entry.metadata() {
        Ok(metadata) => metadata,
        Err(_) => {
            // Vanished between readdir and stat
            walk_data.vanished.fetch_add(1, Ordering::Relaxed);
            return Vec::new();
        }
    };

    let file_type = metadata.file_type();
    if file_type.is_dir() {
        walk_data.num_dirs.fetch_add(1, Ordering::Relaxed);
        let mut stubs = Vec::new();
        if walk_data.include_folders {
            stubs.push(FileStub::from_metadata(relative, &metadata));
        }
        let children = read_children(&path, walk_data);
        stubs.extend(walk_entries(children, walk_data));
        stubs
    } else if file_type.is_file() {
        walk_data.num_files.fetch_add(1, Ordering::Relaxed);
        vec![FileStub::from_metadata(relative, &metadata)]
    } else {
        log::trace!("walk skipping non-regular entry {}", path.display());
        Vec::new()
    }
}

/// Lists the direct children of `dir`, files and folders, sorted by path.
pub fn list_dir(root: &Path, dir: &Path) -> Result<Vec<FileStub>> {
    let read_dir = fs::read_dir(dir).map_err(|error| {
        if error.kind() == std::io::ErrorKind::NotFound {
            WatchError::PathNotFound(dir.to_path_buf())
        } else {
            WatchError::Io(error)
        }
    })?;
    let mut stubs: Vec<FileStub> = read_dir
        .filter_map(std::result::Result::ok)
        .filter_map(|entry| {
            let relative = relative_to_root(root, &entry.path())?;
            let metadata = entry.metadata().ok()?;
            (metadata.is_file() || metadata.is_dir())
                .then(|| FileStub::from_metadata(relative, &metadata))
        })
        .collect();
    stubs.sort_unstable_by(|a, b| a.path.cmp(&b.path));
    Ok(stubs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileKind;
    use std::fs::{self, File};
    use tempfile::TempDir;

    #[test]
    fn walk_empty_directory() {
        let temp = TempDir::new().unwrap();
        let walk_data = WalkData::new(temp.path(), &[]);
        let result = walk_tree(&walk_data, temp.path()).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn walk_flattens_nested_files_sorted() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("b/inner")).unwrap();
        File::create(temp.path().join("c.md")).unwrap();
        File::create(temp.path().join("a.md")).unwrap();
        fs::write(temp.path().join("b/inner/deep.md"), b"deep").unwrap();

        let walk_data = WalkData::new(temp.path(), &[]);
        let result = walk_tree(&walk_data, temp.path()).unwrap();
        let paths: Vec<_> = result.iter().map(|stub| stub.path.as_str()).collect();

        assert_eq!(paths, vec!["a.md", "b/inner/deep.md", "c.md"]);
        assert_eq!(result[1].size, 4);
        assert_eq!(walk_data.num_files.load(Ordering::Relaxed), 3);
        assert_eq!(walk_data.num_dirs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn walk_can_include_folders() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("dir")).unwrap();
        File::create(temp.path().join("dir/a.md")).unwrap();

        let walk_data = WalkData::new(temp.path(), &[]).with_folders();
        let result = walk_tree(&walk_data, temp.path()).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].path, "dir");
        assert_eq!(result[0].kind, FileKind::Folder);
        assert_eq!(result[1].path, "dir/a.md");
    }

    #[test]
    fn walk_ignores_paths() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("include")).unwrap();
        fs::create_dir(temp.path().join("exclude")).unwrap();
        File::create(temp.path().join("include/a.txt")).unwrap();
        File::create(temp.path().join("exclude/b.txt")).unwrap();

        let ignore = vec![temp.path().join("exclude")];
        let walk_data = WalkData::new(temp.path(), &ignore);
        let result = walk_tree(&walk_data, temp.path()).unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].path, "include/a.txt");
    }

    #[test]
    fn walk_cancellation() {
        let temp = TempDir::new().unwrap();
        File::create(temp.path().join("file.txt")).unwrap();

        let cancel = AtomicBool::new(true); // Pre-cancelled
        let walk_data = WalkData::new(temp.path(), &[]).with_cancel(&cancel);
        assert!(walk_tree(&walk_data, temp.path()).is_err());
    }

    #[test]
    fn unreadable_directory_is_recorded() {
        let temp = TempDir::new().unwrap();
        let not_a_dir = temp.path().join("file.md");
        File::create(&not_a_dir).unwrap();
        let walk_data = WalkData::new(temp.path(), &[]);

        assert!(read_children(&not_a_dir, &walk_data).is_empty());
        assert_eq!(walk_data.errors.load(Ordering::Relaxed), 1);

        assert!(read_children(&temp.path().join("gone"), &walk_data).is_empty());
        assert_eq!(walk_data.errors.load(Ordering::Relaxed), 1);
        assert_eq!(walk_data.vanished.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn walk_with_read_errors_fails_instead_of_dropping_subtree() {
        let temp = TempDir::new().unwrap();
        File::create(temp.path().join("a.md")).unwrap();
        let walk_data = WalkData::new(temp.path(), &[]);
        walk_data.errors.fetch_add(1, Ordering::Relaxed);
        assert!(walk_tree(&walk_data, temp.path()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn walk_fails_on_unreadable_subdirectory() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let locked = temp.path().join("locked");
        fs::create_dir(&locked).unwrap();
        File::create(locked.join("inside.md")).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Privileged users read through mode bits; nothing to check then.
        let readable = fs::read_dir(&locked).is_ok();
        let walk_data = WalkData::new(temp.path(), &[]);
        let result = walk_tree(&walk_data, temp.path());
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        if !readable {
            assert!(result.is_err());
        }
    }

    #[test]
    fn walk_missing_start_fails() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("gone");
        let walk_data = WalkData::new(temp.path(), &[]);
        assert!(walk_tree(&walk_data, &missing).is_err());
    }

    #[test]
    fn list_dir_is_one_level() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("sub")).unwrap();
        File::create(temp.path().join("sub/nested.md")).unwrap();
        File::create(temp.path().join("top.md")).unwrap();

        let result = list_dir(temp.path(), temp.path()).unwrap();
        let paths: Vec<_> = result.iter().map(|stub| stub.path.as_str()).collect();
        assert_eq!(paths, vec!["sub", "top.md"]);
    }
}
