//! Engine counters and status reporting.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Live counters shared by the poll loop and the dispatcher.
#[derive(Debug, Default)]
pub struct WatchStats {
    pub ticks: AtomicU64,
    pub tick_errors: AtomicU64,
    pub tracked_files: AtomicUsize,
    pub pending_writes: AtomicUsize,
    /// Events released by the stabilizer (before acceptance).
    pub released: AtomicU64,
    pub accepted: AtomicU64,
    /// Rejected by the eligibility predicate.
    pub filtered: AtomicU64,
    pub too_large: AtomicU64,
    /// Rejected because the path was recently written by the engine's owner.
    pub suppressed: AtomicU64,
    pub dispatched: AtomicU64,
    pub failed: AtomicU64,
    pub last_tick_at: AtomicU64,
}

impl WatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, watching: bool, in_flight: usize) -> WatchStatus {
        WatchStatus {
            watching,
            ticks: self.ticks.load(Ordering::Relaxed),
            tick_errors: self.tick_errors.load(Ordering::Relaxed),
            tracked_files: self.tracked_files.load(Ordering::Relaxed),
            pending_writes: self.pending_writes.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            too_large: self.too_large.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight,
            last_tick_at: zero_to_none(self.last_tick_at.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchStatus {
    /// Whether the poll loop is running.
    pub watching: bool,
    pub ticks: u64,
    pub tick_errors: u64,
    /// Files in the current snapshot.
    pub tracked_files: usize,
    pub pending_writes: usize,
    pub released: u64,
    pub accepted: u64,
    pub filtered: u64,
    pub too_large: u64,
    pub suppressed: u64,
    pub dispatched: u64,
    pub failed: u64,
    /// Events queued or being dispatched.
    pub in_flight: usize,
    /// Unix timestamp of the last completed tick.
    pub last_tick_at: Option<u64>,
}

/// Converts 0 to None for optional timestamps.
pub fn zero_to_none(value: u64) -> Option<u64> {
    if value == 0 {
        None
    } else {
        Some(value)
    }
}
