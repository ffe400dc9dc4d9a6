//! Value types shared by the detector, stabilizer and queue.
//!
//! Everything here is an immutable snapshot value: a `FileStub` is rebuilt on
//! every stat or walk rather than mutated in place.

use std::fs::Metadata;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Whether a stub describes a regular file or a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Folder,
}

impl FileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Folder => "folder",
        }
    }
}

/// Minimal identity and metadata for one path under the watched root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStub {
    /// Slash-normalized path relative to the root.
    pub path: String,
    /// Final path segment.
    pub name: String,
    pub size: u64,
    /// Creation time in Unix milliseconds (0 when the platform has none).
    pub ctime: u64,
    /// Modification time in Unix milliseconds.
    pub mtime: u64,
    pub kind: FileKind,
    pub deleted: bool,
}

impl FileStub {
    /// Builds a stub from filesystem metadata for an already-normalized path.
    pub fn from_metadata(path: String, metadata: &Metadata) -> Self {
        let kind = if metadata.is_dir() {
            FileKind::Folder
        } else {
            FileKind::File
        };
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        Self {
            name,
            size: if kind == FileKind::Folder { 0 } else { metadata.len() },
            ctime: metadata.created().map(unix_millis).unwrap_or(0),
            mtime: metadata.modified().map(unix_millis).unwrap_or(0),
            kind,
            deleted: false,
            path,
        }
    }

    /// Returns true if this is a regular file.
    #[inline]
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    /// Two stubs describe the same on-disk state when mtime and size agree.
    #[inline]
    pub fn same_state(&self, other: &FileStub) -> bool {
        self.mtime == other.mtime && self.size == other.size
    }

    /// Returns a copy flagged as deleted.
    pub fn into_deleted(mut self) -> Self {
        self.deleted = true;
        self
    }
}

/// Semantic change classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Create,
    Changed,
    Delete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Changed => "changed",
            Self::Delete => "delete",
        }
    }

    /// Create and change events carry content the consumer will read.
    pub fn carries_content(self) -> bool {
        !matches!(self, Self::Delete)
    }
}

/// A change submitted to the event queue.
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub kind: EventKind,
    pub file: FileStub,
    /// Old path when the producer knows this event is half of a rename.
    pub previous_path: Option<String>,
    /// Content the producer already read, handed through to the consumer.
    pub payload: Option<Vec<u8>>,
    /// Dispatch without waiting out the configured batch delay.
    pub skip_batch_wait: bool,
}

impl FileEvent {
    pub fn new(kind: EventKind, file: FileStub) -> Self {
        Self {
            kind,
            file,
            previous_path: None,
            payload: None,
            skip_batch_wait: false,
        }
    }

    pub fn created(file: FileStub) -> Self {
        Self::new(EventKind::Create, file)
    }

    pub fn changed(file: FileStub) -> Self {
        Self::new(EventKind::Changed, file)
    }

    pub fn deleted(file: FileStub) -> Self {
        Self::new(EventKind::Delete, file.into_deleted())
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_previous_path(mut self, previous: impl Into<String>) -> Self {
        self.previous_path = Some(previous.into());
        self
    }

    pub fn skipping_batch_wait(mut self) -> Self {
        self.skip_batch_wait = true;
        self
    }

    pub fn path(&self) -> &str {
        &self.file.path
    }
}

/// An accepted event waiting in (or taken from) the dispatch FIFO.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    /// Submission order; strictly increasing per queue.
    pub seq: u64,
    /// Serialization key, always the event's path.
    pub key: String,
    pub queued_at: Instant,
    pub event: FileEvent,
}

impl QueuedEvent {
    pub fn kind(&self) -> EventKind {
        self.event.kind
    }

    pub fn file(&self) -> &FileStub {
        &self.event.file
    }
}

/// Converts a `SystemTime` into Unix milliseconds, clamping pre-epoch values to 0.
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|value| value.as_millis() as u64)
        .unwrap_or(0)
}

/// Returns the current Unix timestamp in seconds.
pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_secs())
        .unwrap_or(0)
}
