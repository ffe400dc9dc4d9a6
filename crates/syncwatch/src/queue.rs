//! Event queue and dispatcher.
//!
//! `submit` filters events and appends the accepted ones to an unbounded FIFO
//! channel. A single dispatcher task pops them in order, takes one of the
//! concurrency slots, reserves the path's lock (in pop order, so same-path
//! events stay sequential), registers a wait handle and spawns the consumer
//! call. Consumer failures are logged and recorded on the wait handle only.

mod wait;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

use crate::filter::{EventConsumer, EventFilter};
use crate::status::WatchStats;
use crate::storage::{normalize_path, StorageAdapter};
use crate::types::{FileEvent, QueuedEvent};

pub use wait::{Registration, WaitHandle, WaitOutcome, WaitRegistry};

#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    /// Maximum simultaneous consumer calls. Values below 1 are treated as 1.
    pub concurrency: usize,
    /// Hold applied to events that do not skip batching.
    pub batch_delay: Duration,
}

/// Why `submit` turned an event away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    InvalidPath,
    Filtered,
    TooLarge,
    Suppressed,
}

struct QueueShared {
    storage: Arc<StorageAdapter>,
    filter: Arc<dyn EventFilter>,
    consumer: Arc<dyn EventConsumer>,
    slots: Arc<Semaphore>,
    waits: WaitRegistry,
    /// Events accepted but not yet finished dispatching.
    outstanding: watch::Sender<usize>,
    next_seq: AtomicU64,
    batch_delay: Duration,
    stats: Arc<WatchStats>,
}

impl QueueShared {
    fn accept(&self, event: &FileEvent) -> Result<String, Rejection> {
        let key = normalize_path(event.path()).map_err(|_| Rejection::InvalidPath)?;
        if key.is_empty() {
            return Err(Rejection::InvalidPath);
        }
        if !self.filter.is_eligible(&key) {
            return Err(Rejection::Filtered);
        }
        if event.kind.carries_content() {
            if self.filter.is_too_large(event.file.size) {
                return Err(Rejection::TooLarge);
            }
            if self.storage.touched().was_recently_touched(&key) {
                return Err(Rejection::Suppressed);
            }
        }
        Ok(key)
    }

    fn record_rejection(&self, rejection: Rejection) {
        let counter = match rejection {
            Rejection::InvalidPath | Rejection::Filtered => &self.stats.filtered,
            Rejection::TooLarge => &self.stats.too_large,
            Rejection::Suppressed => &self.stats.suppressed,
        };
        WatchStats::bump(counter);
    }

    fn begin_one(&self) {
        self.outstanding.send_modify(|count| *count += 1);
    }

    fn finish_one(&self) {
        self.outstanding
            .send_modify(|count| *count = count.saturating_sub(1));
    }

    async fn dispatch(&self, queued: &QueuedEvent) -> WaitOutcome {
        match self.consumer.process_event(queued).await {
            Ok(()) => {
                WatchStats::bump(&self.stats.dispatched);
                WaitOutcome::Completed
            }
            Err(error) => {
                WatchStats::bump(&self.stats.failed);
                log::warn!(
                    "event dispatch failed seq={} kind={} path={} error={}",
                    queued.seq,
                    queued.kind().as_str(),
                    queued.key,
                    error
                );
                WaitOutcome::Failed(error.to_string())
            }
        }
    }
}

/// Decrements the outstanding count when a dispatch ends, even by panic.
struct InFlight(Arc<QueueShared>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.finish_one();
    }
}

pub struct EventQueue {
    shared: Arc<QueueShared>,
    sender: Mutex<Option<mpsc::UnboundedSender<QueuedEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventQueue {
    /// Creates the queue and spawns its dispatcher. Must be called inside a
    /// tokio runtime.
    pub fn new(
        storage: Arc<StorageAdapter>,
        filter: Arc<dyn EventFilter>,
        consumer: Arc<dyn EventConsumer>,
        options: QueueOptions,
        stats: Arc<WatchStats>,
    ) -> Self {
        let (outstanding, _) = watch::channel(0usize);
        let shared = Arc::new(QueueShared {
            storage,
            filter,
            consumer,
            slots: Arc::new(Semaphore::new(options.concurrency.max(1))),
            waits: WaitRegistry::new(),
            outstanding,
            next_seq: AtomicU64::new(0),
            batch_delay: options.batch_delay,
            stats,
        });
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_dispatcher(shared.clone(), receiver));
        Self {
            shared,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Filters `events` and queues the accepted ones. Returns how many were
    /// accepted.
    pub fn submit(&self, events: Vec<FileEvent>) -> usize {
        // Held across the loop so sequence numbers match channel order.
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            log::warn!("event queue is shut down; dropping {} events", events.len());
            return 0;
        };

        let mut accepted = 0;
        for event in events {
            let key = match self.shared.accept(&event) {
                Ok(key) => key,
                Err(rejection) => {
                    log::debug!(
                        "event rejected kind={} path={} reason={:?}",
                        event.kind.as_str(),
                        event.path(),
                        rejection
                    );
                    self.shared.record_rejection(rejection);
                    continue;
                }
            };

            let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
            self.shared.begin_one();
            let queued = QueuedEvent {
                seq,
                key,
                queued_at: Instant::now(),
                event,
            };
            if sender.send(queued).is_err() {
                self.shared.finish_one();
                log::warn!("event dispatcher is gone; dropping seq={seq}");
                continue;
            }
            WatchStats::bump(&self.shared.stats.accepted);
            accepted += 1;
        }
        accepted
    }

    /// Whether an event for `path` is currently being processed.
    pub fn is_waiting(&self, path: &str) -> bool {
        normalize_path(path)
            .map(|key| self.shared.waits.is_waiting(&key))
            .unwrap_or(false)
    }

    /// The live wait handle for `path`, if an event for it is being processed.
    pub fn wait_handle(&self, path: &str) -> Option<WaitHandle> {
        let key = normalize_path(path).ok()?;
        self.shared.waits.handle(&key)
    }

    /// Events accepted and not yet finished.
    pub fn in_flight(&self) -> usize {
        *self.shared.outstanding.borrow()
    }

    /// Resolves once nothing is queued or being dispatched.
    pub async fn wait_for_idle(&self) {
        let mut outstanding = self.shared.outstanding.subscribe();
        // The sender lives in `shared`, which `self` keeps alive.
        let _ = outstanding.wait_for(|count| *count == 0).await;
    }

    /// Stops accepting events and waits for the dispatcher to drain what is
    /// already queued. In-flight consumer calls keep running; pair with
    /// `wait_for_idle` to wait for them too.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(error) = worker.await {
                log::warn!("event dispatcher ended abnormally: {error}");
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

async fn run_dispatcher(
    shared: Arc<QueueShared>,
    mut receiver: mpsc::UnboundedReceiver<QueuedEvent>,
) {
    log::debug!("event dispatcher started");
    while let Some(queued) = receiver.recv().await {
        let in_flight = InFlight(shared.clone());

        if !queued.event.skip_batch_wait && !shared.batch_delay.is_zero() {
            let remaining = shared
                .batch_delay
                .saturating_sub(queued.queued_at.elapsed());
            tokio::time::sleep(remaining).await;
        }

        let permit = match shared.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                log::warn!("dispatch slots closed; dropping seq={}", queued.seq);
                continue;
            }
        };
        let ticket = shared.storage.locks().reserve(&queued.key);
        let registration = shared.waits.register(&queued.key);
        let task_shared = shared.clone();

        tokio::spawn(async move {
            let _in_flight = in_flight;
            let _permit = permit;
            let _guard = ticket.acquire().await;
            log::debug!(
                "dispatching seq={} kind={} path={}",
                queued.seq,
                queued.kind().as_str(),
                queued.key
            );
            let outcome = task_shared.dispatch(&queued).await;
            registration.resolve(outcome);
        });
    }
    log::debug!("event dispatcher stopped");
}
