//! Snapshot-based change detection.

use std::sync::Arc;

use crate::error::{Result, WatchError};
use crate::snapshot::{Snapshot, SnapshotDiff};
use crate::storage::StorageAdapter;

/// Produces full-tree snapshots and diffs each against the one before it.
#[derive(Debug)]
pub struct ChangeDetector {
    storage: Arc<StorageAdapter>,
    previous: Option<Snapshot>,
}

impl ChangeDetector {
    pub fn new(storage: Arc<StorageAdapter>) -> Self {
        Self {
            storage,
            previous: None,
        }
    }

    pub fn has_baseline(&self) -> bool {
        self.previous.is_some()
    }

    /// The snapshot the next tick will be diffed against.
    pub fn baseline(&self) -> Option<&Snapshot> {
        self.previous.as_ref()
    }

    pub fn set_baseline(&mut self, snapshot: Snapshot) {
        self.previous = Some(snapshot);
    }

    /// Walks the root on the blocking pool.
    pub async fn capture(&self) -> Result<Snapshot> {
        capture_snapshot(self.storage.clone()).await
    }

    /// Replaces the baseline with `next`, returning what changed.
    ///
    /// Without a baseline `next` simply becomes the baseline and nothing is
    /// reported, so files that already exist never produce events.
    pub fn advance(&mut self, next: Snapshot) -> SnapshotDiff {
        let diff = match &self.previous {
            Some(previous) => previous.diff(&next),
            None => SnapshotDiff::default(),
        };
        self.previous = Some(next);
        diff
    }
}

/// Enumerates the storage root into a snapshot without holding any detector
/// state, so the caller can release its locks while the walk runs.
pub async fn capture_snapshot(storage: Arc<StorageAdapter>) -> Result<Snapshot> {
    tokio::task::spawn_blocking(move || storage.enumerate("").map(Snapshot::from_stubs))
        .await
        .map_err(|error| WatchError::Internal(format!("snapshot task failed: {error}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchConfig;
    use tempfile::TempDir;

    fn detector(temp: &TempDir) -> ChangeDetector {
        let storage = StorageAdapter::from_config(&WatchConfig::new(temp.path()));
        ChangeDetector::new(Arc::new(storage))
    }

    #[tokio::test]
    async fn first_capture_becomes_baseline_silently() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("existing.md"), b"x").unwrap();
        let mut detector = detector(&temp);

        let snapshot = detector.capture().await.unwrap();
        assert!(detector.advance(snapshot).is_empty());
        assert!(detector.has_baseline());
        assert_eq!(detector.baseline().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn detects_create_and_delete_between_captures() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("old.md"), b"x").unwrap();
        let mut detector = detector(&temp);
        let baseline = detector.capture().await.unwrap();
        detector.advance(baseline);

        std::fs::remove_file(temp.path().join("old.md")).unwrap();
        std::fs::create_dir(temp.path().join("sub")).unwrap();
        std::fs::write(temp.path().join("sub/new.md"), b"y").unwrap();

        let next = detector.capture().await.unwrap();
        let diff = detector.advance(next);
        assert_eq!(diff.created, vec!["sub/new.md"]);
        assert_eq!(diff.deleted.len(), 1);
        assert_eq!(diff.deleted[0].path, "old.md");
    }

    #[tokio::test]
    async fn failed_capture_leaves_baseline_untouched() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("vault");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("a.md"), b"x").unwrap();
        let storage = StorageAdapter::from_config(&WatchConfig::new(&root));
        let mut detector = ChangeDetector::new(Arc::new(storage));
        let baseline = detector.capture().await.unwrap();
        detector.advance(baseline);

        std::fs::remove_dir_all(&root).unwrap();
        assert!(detector.capture().await.is_err());
        assert_eq!(detector.baseline().unwrap().len(), 1);
    }
}
