//! The watch engine: a periodic poll loop feeding the event queue.
//!
//! Each tick captures a snapshot of the root, diffs it against the previous
//! one, folds the diff into the write stabilizer and submits whatever the
//! stabilizer releases. Ticks never overlap; a failed tick keeps the previous
//! snapshot and is retried on the next one.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::WatchConfig;
use crate::detector::{capture_snapshot, ChangeDetector};
use crate::error::{canonicalize_existing_path, Result};
use crate::filter::{EventConsumer, EventFilter};
use crate::queue::{EventQueue, QueueOptions, WaitHandle};
use crate::snapshot::{load_snapshot_cache, write_snapshot_cache};
use crate::stabilizer::WriteStabilizer;
use crate::status::{WatchStats, WatchStatus};
use crate::storage::StorageAdapter;
use crate::types::{unix_now_secs, FileEvent};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// The tick established the baseline instead of diffing.
    pub baseline: bool,
    pub created: usize,
    pub changed: usize,
    pub deleted: usize,
    /// Events released by the stabilizer.
    pub released: usize,
    /// Released events the queue accepted.
    pub accepted: usize,
    /// Stable events dropped because the consumer wrote them.
    pub suppressed: usize,
    /// Paths still waiting to stabilize.
    pub pending: usize,
}

struct TickState {
    detector: ChangeDetector,
    stabilizer: WriteStabilizer,
}

struct EngineInner {
    config: WatchConfig,
    storage: Arc<StorageAdapter>,
    queue: EventQueue,
    state: Mutex<TickState>,
    stats: Arc<WatchStats>,
}

impl EngineInner {
    async fn poll_once(&self) -> Result<TickReport> {
        let mut state = self.state.lock().await;
        let snapshot = match capture_snapshot(self.storage.clone()).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                WatchStats::bump(&self.stats.tick_errors);
                return Err(error);
            }
        };

        let tracked = snapshot.len();
        let TickState {
            detector,
            stabilizer,
        } = &mut *state;
        let baseline = !detector.has_baseline();
        let diff = detector.advance(snapshot);
        let touched = self.storage.touched();
        let now = Instant::now();
        let released = match detector.baseline() {
            Some(current) => {
                stabilizer.observe(&diff, current, now, |path| touched.is_live_at(path, now))
            }
            None => Vec::new(),
        };
        let suppressed = stabilizer.take_suppressed();

        let report = TickReport {
            baseline,
            created: diff.created.len(),
            changed: diff.changed.len(),
            deleted: diff.deleted.len(),
            released: released.len(),
            accepted: 0,
            suppressed,
            pending: stabilizer.len(),
        };

        // Submitted under the state lock so consecutive ticks queue in order.
        let accepted = if released.is_empty() {
            0
        } else {
            self.queue.submit(released)
        };
        drop(state);

        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        self.stats
            .released
            .fetch_add(report.released as u64, Ordering::Relaxed);
        self.stats
            .suppressed
            .fetch_add(suppressed as u64, Ordering::Relaxed);
        self.stats.tracked_files.store(tracked, Ordering::Relaxed);
        self.stats
            .pending_writes
            .store(report.pending, Ordering::Relaxed);
        self.stats
            .last_tick_at
            .store(unix_now_secs(), Ordering::Relaxed);

        if !diff.is_empty() || report.released > 0 || suppressed > 0 {
            log::debug!(
                "tick created={} changed={} deleted={} released={} accepted={} suppressed={} pending={}",
                report.created,
                report.changed,
                report.deleted,
                report.released,
                accepted,
                suppressed,
                report.pending
            );
        }
        Ok(TickReport { accepted, ..report })
    }

    async fn restore_state(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.stabilizer.clear();

        let root = self.storage.root().to_path_buf();
        let cached = match self.config.snapshot_cache.clone() {
            Some(cache_path) => {
                let root = root.clone();
                tokio::task::spawn_blocking(move || load_snapshot_cache(&cache_path, &root))
                    .await
                    .unwrap_or_else(|error| {
                        log::warn!("snapshot cache load task failed: {error}");
                        None
                    })
            }
            None => None,
        };

        let (snapshot, source) = match cached {
            Some(snapshot) => (snapshot, "cache"),
            None => (capture_snapshot(self.storage.clone()).await?, "disk"),
        };
        let files = snapshot.len();
        state.detector.set_baseline(snapshot);
        self.stats.tracked_files.store(files, Ordering::Relaxed);
        self.stats.pending_writes.store(0, Ordering::Relaxed);

        log::info!(
            "watch state restored root={} files={} source={}",
            root.display(),
            files,
            source
        );
        Ok(files)
    }

    async fn persist_snapshot(&self) {
        let Some(cache_path) = self.config.snapshot_cache.clone() else {
            return;
        };
        let Some(snapshot) = self.state.lock().await.detector.baseline().cloned() else {
            return;
        };
        let root = self.storage.root().to_path_buf();
        let result = tokio::task::spawn_blocking(move || {
            write_snapshot_cache(&cache_path, &root, &snapshot)
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(error)) => log::warn!("snapshot cache write failed: {error}"),
            Err(error) => log::warn!("snapshot cache write task failed: {error}"),
        }
    }
}

struct WatchTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Polls a directory tree and dispatches stabilized changes to a consumer.
pub struct WatchEngine {
    inner: Arc<EngineInner>,
    watch_task: parking_lot::Mutex<Option<WatchTask>>,
}

impl WatchEngine {
    /// Builds the engine and starts its dispatcher. Must be called inside a
    /// tokio runtime. Nothing is polled until [`begin_watch`](Self::begin_watch)
    /// or [`poll_once`](Self::poll_once).
    pub fn new(
        mut config: WatchConfig,
        filter: Arc<dyn EventFilter>,
        consumer: Arc<dyn EventConsumer>,
    ) -> Result<Self> {
        config.validate()?;
        config.root = canonicalize_existing_path(config.root);
        config.ignored_roots = config
            .ignored_roots
            .into_iter()
            .map(canonicalize_existing_path)
            .collect();

        let storage = Arc::new(StorageAdapter::from_config(&config));
        let stats = Arc::new(WatchStats::new());
        let queue = EventQueue::new(
            storage.clone(),
            filter,
            consumer,
            QueueOptions {
                concurrency: config.concurrency,
                batch_delay: config.batch_delay(),
            },
            stats.clone(),
        );
        let state = TickState {
            detector: ChangeDetector::new(storage.clone()),
            stabilizer: WriteStabilizer::new(config.quiet_window(), config.empty_file_hold()),
        };

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                storage,
                queue,
                state: Mutex::new(state),
                stats,
            }),
            watch_task: parking_lot::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &WatchConfig {
        &self.inner.config
    }

    /// The storage adapter the engine polls, shared with the consumer.
    pub fn storage(&self) -> &Arc<StorageAdapter> {
        &self.inner.storage
    }

    /// Rebuilds the baseline from the snapshot cache or, failing that, from
    /// disk, and drops every pending write. Returns the number of tracked files.
    pub async fn restore_state(&self) -> Result<usize> {
        self.inner.restore_state().await
    }

    /// Starts the poll loop. A no-op if it is already running.
    pub async fn begin_watch(&self) -> Result<()> {
        if self.is_watching() {
            log::debug!("watch already running");
            return Ok(());
        }
        let needs_baseline = !self.inner.state.lock().await.detector.has_baseline();
        if needs_baseline {
            self.restore_state().await?;
        }

        let mut slot = self.watch_task.lock();
        if slot.is_some() {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_poll_loop(self.inner.clone(), cancel.clone()));
        *slot = Some(WatchTask { cancel, handle });
        log::info!(
            "watch started root={} interval_ms={}",
            self.inner.storage.root().display(),
            self.inner.config.poll_interval_ms
        );
        Ok(())
    }

    /// Stops the poll loop after the current tick and saves the snapshot cache.
    /// Queued and in-flight dispatches continue.
    pub async fn stop(&self) {
        let task = self.watch_task.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(error) = task.handle.await {
                log::warn!("poll loop ended abnormally: {error}");
            }
            log::info!(
                "watch stopped root={}",
                self.inner.storage.root().display()
            );
        }
        self.inner.persist_snapshot().await;
    }

    /// Stops watching, drains the queue and waits for in-flight dispatches.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.inner.queue.shutdown().await;
        self.inner.queue.wait_for_idle().await;
    }

    pub fn is_watching(&self) -> bool {
        self.watch_task.lock().is_some()
    }

    /// Runs one detection tick.
    pub async fn poll_once(&self) -> Result<TickReport> {
        self.inner.poll_once().await
    }

    /// Submits events directly, bypassing detection. Returns how many were
    /// accepted.
    pub fn submit(&self, events: Vec<FileEvent>) -> usize {
        self.inner.queue.submit(events)
    }

    pub fn is_waiting(&self, path: &str) -> bool {
        self.inner.queue.is_waiting(path)
    }

    pub fn wait_handle(&self, path: &str) -> Option<WaitHandle> {
        self.inner.queue.wait_handle(path)
    }

    pub async fn wait_for_idle(&self) {
        self.inner.queue.wait_for_idle().await
    }

    pub fn status(&self) -> WatchStatus {
        self.inner
            .stats
            .snapshot(self.is_watching(), self.inner.queue.in_flight())
    }
}

impl Drop for WatchEngine {
    fn drop(&mut self) {
        if let Some(task) = self.watch_task.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

async fn run_poll_loop(inner: Arc<EngineInner>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(inner.config.poll_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(error) = inner.poll_once().await {
                    log::warn!(
                        "poll tick failed root={} error={}",
                        inner.storage.root().display(),
                        error
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::AcceptAll;
    use crate::types::{EventKind, QueuedEvent};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Collect {
        events: parking_lot::Mutex<Vec<(EventKind, String, u64)>>,
    }

    #[async_trait]
    impl EventConsumer for Collect {
        async fn process_event(&self, event: &QueuedEvent) -> crate::error::Result<()> {
            self.events
                .lock()
                .push((event.kind(), event.key.clone(), event.file().size));
            Ok(())
        }
    }

    fn engine(temp: &TempDir, consumer: Arc<Collect>) -> WatchEngine {
        let mut config = WatchConfig::new(temp.path());
        config.quiet_window_ms = 0;
        config.empty_file_hold_ms = 0;
        WatchEngine::new(config, Arc::new(AcceptAll), consumer).expect("engine")
    }

    #[tokio::test]
    async fn first_tick_is_silent_then_reports_changes() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("old.md"), b"old").unwrap();
        let consumer = Arc::new(Collect::default());
        let engine = engine(&temp, consumer.clone());

        let first = engine.poll_once().await.unwrap();
        assert!(first.baseline);
        assert_eq!(first.released, 0);

        std::fs::write(temp.path().join("new.md"), b"hello").unwrap();
        std::fs::remove_file(temp.path().join("old.md")).unwrap();
        let second = engine.poll_once().await.unwrap();
        assert_eq!((second.created, second.deleted), (1, 1));
        // A zero quiet window releases the create on the tick that saw it.
        assert_eq!(second.accepted, 2);
        assert_eq!(second.pending, 0);
        engine.wait_for_idle().await;

        let mut events = consumer.events.lock().clone();
        events.sort();
        assert_eq!(
            events,
            vec![
                (EventKind::Create, "new.md".to_string(), 5),
                (EventKind::Delete, "old.md".to_string(), 3),
            ]
        );
        let status = engine.status();
        assert_eq!(status.ticks, 2);
        assert_eq!(status.dispatched, 2);
        assert_eq!(status.tracked_files, 1);
    }

    #[tokio::test]
    async fn missing_root_fails_tick_without_losing_baseline() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("vault");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("a.md"), b"x").unwrap();
        let consumer = Arc::new(Collect::default());
        let mut config = WatchConfig::new(&root);
        config.quiet_window_ms = 0;
        let engine = WatchEngine::new(config, Arc::new(AcceptAll), consumer.clone()).unwrap();
        assert_eq!(engine.restore_state().await.unwrap(), 1);

        let canonical_root = engine.storage().root().to_path_buf();
        std::fs::rename(&canonical_root, temp.path().join("moved")).unwrap();
        assert!(engine.poll_once().await.is_err());
        assert_eq!(engine.status().tick_errors, 1);

        std::fs::rename(temp.path().join("moved"), &canonical_root).unwrap();
        let report = engine.poll_once().await.unwrap();
        assert_eq!(report.deleted, 0);
        assert!(consumer.events.lock().is_empty());
    }

    #[tokio::test]
    async fn begin_and_stop_toggle_watching() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp, Arc::new(Collect::default()));
        engine.begin_watch().await.unwrap();
        engine.begin_watch().await.unwrap();
        assert!(engine.is_watching());
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.stop().await;
        assert!(!engine.is_watching());
        assert!(!engine.status().watching);
    }
}
