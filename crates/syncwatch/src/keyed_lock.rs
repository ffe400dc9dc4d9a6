//! FIFO keyed mutex.
//!
//! A `KeyedMutex` hands out exclusive access per string key. Reservation is
//! synchronous (`reserve`), so the order in which callers reserve a key is the
//! order in which they are granted it, independent of task scheduling. The
//! dispatcher relies on that to keep same-path events in submission order.
//!
//! Each reservation chains onto the previous holder of the key through a
//! oneshot channel: the next holder waits for the previous sender to drop.
//! A key's slot is removed when its last reservation releases, so the map only
//! holds keys that are currently locked or awaited.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct Slots {
    tails: Mutex<HashMap<String, Tail>>,
    next_generation: AtomicU64,
}

#[derive(Debug)]
struct Tail {
    generation: u64,
    released: oneshot::Receiver<()>,
}

impl Slots {
    fn release(&self, key: &str, generation: u64) {
        let mut tails = self.tails.lock();
        if tails
            .get(key)
            .is_some_and(|tail| tail.generation == generation)
        {
            tails.remove(key);
        }
    }
}

/// Map from key to an exclusive, FIFO-ordered lock.
#[derive(Debug, Clone, Default)]
pub struct KeyedMutex {
    slots: Arc<Slots>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the next place in line for `key`.
    pub fn reserve(&self, key: &str) -> KeyTicket {
        let (release, released) = oneshot::channel();
        let generation = self.slots.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = self.slots.tails.lock().insert(
            key.to_string(),
            Tail {
                generation,
                released,
            },
        );
        KeyTicket {
            key: key.to_string(),
            generation,
            wait_for: previous.map(|tail| tail.released),
            release: Some(release),
            slots: self.slots.clone(),
        }
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        self.reserve(key).acquire().await
    }

    /// Runs `op` while holding `key`.
    pub async fn run<F, Fut, T>(&self, key: &str, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.lock(key).await;
        op().await
    }

    /// Returns true if the key is held or has waiters.
    pub fn is_locked(&self, key: &str) -> bool {
        self.slots.tails.lock().contains_key(key)
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.slots.tails.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A reserved place in line for one key.
///
/// Dropping a ticket without acquiring it passes the turn on only after the
/// previous holder has released.
#[derive(Debug)]
pub struct KeyTicket {
    key: String,
    generation: u64,
    wait_for: Option<oneshot::Receiver<()>>,
    release: Option<oneshot::Sender<()>>,
    slots: Arc<Slots>,
}

impl KeyTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Waits until every earlier reservation for the key has released.
    pub async fn acquire(mut self) -> KeyGuard {
        if let Some(previous) = self.wait_for.as_mut() {
            // A closed channel means the previous holder dropped its sender.
            let _ = previous.await;
        }
        self.wait_for = None;
        self.take_guard()
    }

    fn take_guard(&mut self) -> KeyGuard {
        KeyGuard {
            key: std::mem::take(&mut self.key),
            generation: self.generation,
            release: self.release.take(),
            slots: self.slots.clone(),
        }
    }
}

impl Drop for KeyTicket {
    fn drop(&mut self) {
        if self.release.is_none() {
            return;
        }
        let guard = self.take_guard();
        match (self.wait_for.take(), tokio::runtime::Handle::try_current()) {
            (Some(previous), Ok(handle)) => {
                handle.spawn(async move {
                    let _ = previous.await;
                    drop(guard);
                });
            }
            _ => drop(guard),
        }
    }
}

/// Exclusive access to one key, released on drop.
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    generation: u64,
    release: Option<oneshot::Sender<()>>,
    slots: Arc<Slots>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.slots.release(&self.key, self.generation);
        drop(self.release.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn grants_in_reservation_order() {
        let locks = KeyedMutex::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = locks.reserve("a.md");
        let second = locks.reserve("a.md");
        let third = locks.reserve("a.md");

        let mut tasks = Vec::new();
        // Spawn in reverse so scheduling order cannot explain the result.
        for (label, ticket) in [(3, third), (2, second), (1, first)] {
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = ticket.acquire().await;
                order.lock().push(label);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }
        assert_eq!(*order.lock(), vec![1, 2, 3]);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedMutex::new();
        let _a = locks.lock("a.md").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b.md")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn dropped_ticket_keeps_chain_intact() {
        let locks = KeyedMutex::new();
        let holder = locks.lock("a.md").await;
        let skipped = locks.reserve("a.md");
        let waiter = locks.reserve("a.md");
        drop(skipped);

        let waiting = tokio::spawn(waiter.acquire());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(holder);
        let guard = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("acquired after holder released")
            .expect("join");
        assert_eq!(guard.key(), "a.md");
        drop(guard);
        assert!(!locks.is_locked("a.md"));
    }
}
