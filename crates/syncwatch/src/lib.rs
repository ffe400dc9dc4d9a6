//! Polling change detection and event dispatch for a directory tree.
//!
//! This crate provides:
//! - Storage access with atomic writes, trash and per-path exclusive scopes
//! - Full-tree snapshots diffed tick by tick
//! - Write stabilization that coalesces bursts of writes into one event
//! - A FIFO event queue with bounded concurrency and per-path ordering
//! - Snapshot persistence so restarts pick up offline changes

pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod filter;
pub mod keyed_lock;
pub mod queue;
pub mod snapshot;
pub mod stabilizer;
pub mod status;
pub mod storage;
pub mod types;

// Re-export main types
pub use config::WatchConfig;
pub use detector::ChangeDetector;
pub use engine::{TickReport, WatchEngine};
pub use error::{Result, WatchError};
pub use filter::{AcceptAll, EventConsumer, EventFilter, PatternFilter};
pub use keyed_lock::KeyedMutex;
pub use queue::{EventQueue, QueueOptions, WaitHandle, WaitOutcome};
pub use snapshot::{Snapshot, SnapshotDiff};
pub use stabilizer::WriteStabilizer;
pub use status::WatchStatus;
pub use storage::{ReadOutcome, StorageAdapter, TrashOutcome, WriteOptions};
pub use types::{EventKind, FileEvent, FileKind, FileStub, QueuedEvent};
