//! Full-tree snapshots and their diff.
//!
//! A snapshot maps every regular file under the root to its stub. Snapshots
//! are built from one complete walk and never patched: the detector replaces
//! the previous snapshot wholesale after diffing against it.

mod persistence;

use fnv::FnvHashMap;

use crate::types::FileStub;

pub use persistence::{load_snapshot_cache, write_snapshot_cache, SNAPSHOT_CACHE_VERSION};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: FnvHashMap<String, FileStub>,
}

impl Snapshot {
    /// Builds a snapshot from a walk. Folders are dropped: their mtime moves
    /// whenever a child changes, which would surface as spurious changes.
    pub fn from_stubs(stubs: impl IntoIterator<Item = FileStub>) -> Self {
        let entries = stubs
            .into_iter()
            .filter(FileStub::is_file)
            .map(|stub| (stub.path.clone(), stub))
            .collect();
        Self { entries }
    }

    pub fn get(&self, path: &str) -> Option<&FileStub> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileStub> {
        self.entries.values()
    }

    /// Stubs sorted by path.
    pub fn to_sorted_vec(&self) -> Vec<FileStub> {
        let mut stubs: Vec<FileStub> = self.entries.values().cloned().collect();
        stubs.sort_unstable_by(|a, b| a.path.cmp(&b.path));
        stubs
    }

    /// Classifies every difference between `self` (older) and `next`.
    pub fn diff(&self, next: &Snapshot) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();
        for (path, stub) in &next.entries {
            match self.entries.get(path) {
                None => diff.created.push(path.clone()),
                Some(previous) if !previous.same_state(stub) => diff.changed.push(path.clone()),
                Some(_) => {}
            }
        }
        for (path, stub) in &self.entries {
            if !next.entries.contains_key(path) {
                diff.deleted.push(stub.clone());
            }
        }
        diff.created.sort_unstable();
        diff.changed.sort_unstable();
        diff.deleted.sort_unstable_by(|a, b| a.path.cmp(&b.path));
        diff
    }
}

/// Differences between two consecutive snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    /// Paths absent before and present now.
    pub created: Vec<String>,
    /// Paths present in both whose mtime or size moved.
    pub changed: Vec<String>,
    /// Stubs from the older snapshot that are gone now.
    pub deleted: Vec<FileStub>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.changed.len() + self.deleted.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::FileKind;

    pub(crate) fn stub(path: &str, size: u64, mtime: u64) -> FileStub {
        FileStub {
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap().to_string(),
            size,
            ctime: 0,
            mtime,
            kind: FileKind::File,
            deleted: false,
        }
    }

    #[test]
    fn folders_are_not_tracked() {
        let mut folder = stub("dir", 0, 1);
        folder.kind = FileKind::Folder;
        let snapshot = Snapshot::from_stubs(vec![folder, stub("dir/a.md", 1, 1)]);
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains("dir/a.md"));
    }

    #[test]
    fn diff_classifies_each_case() {
        let before = Snapshot::from_stubs(vec![
            stub("same.md", 1, 10),
            stub("grown.md", 1, 10),
            stub("touched.md", 1, 10),
            stub("gone.md", 1, 10),
        ]);
        let after = Snapshot::from_stubs(vec![
            stub("same.md", 1, 10),
            stub("grown.md", 2, 10),
            stub("touched.md", 1, 11),
            stub("new.md", 0, 12),
        ]);
        let diff = before.diff(&after);
        assert_eq!(diff.created, vec!["new.md"]);
        assert_eq!(diff.changed, vec!["grown.md", "touched.md"]);
        assert_eq!(diff.deleted.len(), 1);
        assert_eq!(diff.deleted[0].path, "gone.md");
        assert_eq!(diff.len(), 4);
    }

    #[test]
    fn identical_snapshots_diff_empty() {
        let snapshot = Snapshot::from_stubs(vec![stub("a.md", 1, 1)]);
        assert!(snapshot.diff(&snapshot.clone()).is_empty());
    }
}
