//! Write stabilization.
//!
//! A path that appears or changes is held in the pending table until its
//! mtime and size stop moving for the quiet window. Rapid successive writes
//! therefore coalesce into one event carrying the final state. Per path:
//!
//! ```text
//! UNSEEN -> PENDING -> STABLE (event released, entry removed)
//!              |
//!              +----> VANISHED (entry dropped, no event)
//! ```
//!
//! Zero-byte creations get an extra hold measured from first sight, because
//! editors and shells routinely create an empty file before writing to it.
//!
//! An entry remembers whether the path carried a live touched marker when it
//! was first seen or last moved. Such an entry is dropped when it becomes
//! stable, even if the marker has expired by then.
//!
//! Time is passed in by the caller so the state machine is deterministic.

use std::time::{Duration, Instant};

use fnv::FnvHashMap;

use crate::snapshot::{Snapshot, SnapshotDiff};
use crate::types::{EventKind, FileEvent, FileStub};

/// A path under observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    /// `Create` or `Changed`; a pending create stays a create.
    pub kind: EventKind,
    pub mtime: u64,
    pub size: u64,
    /// When mtime or size last moved.
    pub last_changed: Instant,
    pub first_seen: Instant,
    /// The path was marked touched when last seen moving.
    pub self_written: bool,
}

impl PendingWrite {
    fn new(kind: EventKind, stub: &FileStub, now: Instant, self_written: bool) -> Self {
        Self {
            kind,
            mtime: stub.mtime,
            size: stub.size,
            last_changed: now,
            first_seen: now,
            self_written,
        }
    }

    fn matches(&self, stub: &FileStub) -> bool {
        self.mtime == stub.mtime && self.size == stub.size
    }

    fn update(&mut self, stub: &FileStub, now: Instant, self_written: bool) {
        self.mtime = stub.mtime;
        self.size = stub.size;
        self.last_changed = now;
        self.self_written = self_written;
    }
}

#[derive(Debug)]
pub struct WriteStabilizer {
    quiet_window: Duration,
    empty_file_hold: Duration,
    pending: FnvHashMap<String, PendingWrite>,
    suppressed: usize,
}

impl WriteStabilizer {
    pub fn new(quiet_window: Duration, empty_file_hold: Duration) -> Self {
        Self {
            quiet_window,
            empty_file_hold,
            pending: FnvHashMap::default(),
            suppressed: 0,
        }
    }

    /// Folds one tick's diff into the pending table and returns the events
    /// released by it: deletions immediately, creates and changes once stable.
    ///
    /// `snapshot` must be the snapshot `diff` was computed against.
    /// `is_touched` reports whether a path currently carries a live touched
    /// marker; creates and changes of such paths are never released.
    pub fn observe(
        &mut self,
        diff: &SnapshotDiff,
        snapshot: &Snapshot,
        now: Instant,
        is_touched: impl Fn(&str) -> bool,
    ) -> Vec<FileEvent> {
        let mut released = Vec::new();

        for stub in &diff.deleted {
            match self.pending.remove(&stub.path) {
                Some(pending) if pending.kind == EventKind::Create => {
                    // Downstream never saw this file.
                    log::debug!("dropping {} (vanished before stable)", stub.path);
                }
                _ => released.push(FileEvent::deleted(stub.clone())),
            }
        }

        for path in &diff.created {
            if let Some(stub) = snapshot.get(path) {
                let touched = is_touched(path);
                self.pending
                    .entry(path.clone())
                    .and_modify(|pending| {
                        pending.kind = EventKind::Create;
                        pending.self_written |= touched;
                    })
                    .or_insert_with(|| PendingWrite::new(EventKind::Create, stub, now, touched));
            }
        }

        for path in &diff.changed {
            if let Some(stub) = snapshot.get(path) {
                let touched = is_touched(path);
                self.pending
                    .entry(path.clone())
                    .and_modify(|pending| pending.self_written |= touched)
                    .or_insert_with(|| PendingWrite::new(EventKind::Changed, stub, now, touched));
            }
        }

        let quiet_window = self.quiet_window;
        let empty_file_hold = self.empty_file_hold;
        let mut stable = Vec::new();
        let mut suppressed = 0;
        self.pending.retain(|path, pending| {
            let Some(stub) = snapshot.get(path) else {
                log::debug!("dropping {path} (vanished before stable)");
                return false;
            };
            if !pending.matches(stub) {
                pending.update(stub, now, is_touched(path));
                return true;
            }
            if now.saturating_duration_since(pending.last_changed) < quiet_window {
                return true;
            }
            if pending.kind == EventKind::Create
                && pending.size == 0
                && now.saturating_duration_since(pending.first_seen) < empty_file_hold
            {
                return true;
            }
            if pending.self_written {
                log::debug!("suppressing {} {path} (own write)", pending.kind.as_str());
                suppressed += 1;
                return false;
            }
            stable.push(FileEvent::new(pending.kind, stub.clone()));
            false
        });
        self.suppressed += suppressed;

        stable.sort_unstable_by(|a, b| a.file.path.cmp(&b.file.path));
        for event in &stable {
            log::debug!(
                "stabilized {} {} size={}",
                event.kind.as_str(),
                event.file.path,
                event.file.size
            );
        }
        released.extend(stable);
        released
    }

    /// Returns and resets the number of stable entries dropped as own writes.
    pub fn take_suppressed(&mut self) -> usize {
        std::mem::take(&mut self.suppressed)
    }

    pub fn pending(&self, path: &str) -> Option<&PendingWrite> {
        self.pending.get(path)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drops every pending entry, e.g. when the baseline is rebuilt.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
