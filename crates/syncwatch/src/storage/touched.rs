//! Self-write suppression registry.
//!
//! When the consumer writes a file because a remote change arrived, it marks
//! the path as touched. The stabilizer drops a pending create/change whose
//! path was touched while it was moving, and the queue refuses directly
//! submitted ones until the record expires.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug)]
pub struct TouchedRegistry {
    ttl: Duration,
    records: Mutex<HashMap<String, Instant>>,
}

impl TouchedRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn mark(&self, path: &str) {
        self.mark_at(path, Instant::now());
    }

    pub fn mark_at(&self, path: &str, at: Instant) {
        let mut records = self.records.lock();
        records.retain(|_, marked| at.saturating_duration_since(*marked) < self.ttl);
        records.insert(path.to_string(), at);
    }

    pub fn was_recently_touched(&self, path: &str) -> bool {
        self.is_live_at(path, Instant::now())
    }

    pub fn is_live_at(&self, path: &str, now: Instant) -> bool {
        let mut records = self.records.lock();
        match records.get(path) {
            Some(marked) if now.saturating_duration_since(*marked) < self.ttl => true,
            Some(_) => {
                records.remove(path);
                false
            }
            None => false,
        }
    }

    /// Removes a record before it expires.
    pub fn clear(&self, path: &str) {
        self.records.lock().remove(path);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
