//! Per-path processing tickets.
//!
//! A registration is taken when an event for a path starts processing and is
//! always resolved: with the dispatch outcome, or as `Superseded` when a newer
//! event for the same path registers first. Waiters never see an error or a
//! ticket that stays pending forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    Failed(String),
    /// A newer event for the same path took over the ticket.
    Superseded,
}

impl WaitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

type OutcomeSender = Arc<watch::Sender<Option<WaitOutcome>>>;

/// Awaitable view of one registration.
#[derive(Debug, Clone)]
pub struct WaitHandle {
    path: String,
    outcome: watch::Receiver<Option<WaitOutcome>>,
}

impl WaitHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The outcome if already resolved.
    pub fn outcome(&self) -> Option<WaitOutcome> {
        self.outcome.borrow().clone()
    }

    pub async fn wait(mut self) -> WaitOutcome {
        match self.outcome.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or(WaitOutcome::Superseded),
            // Sender gone without a value; registrations resolve on drop, so
            // this only happens if the registry itself was torn down.
            Err(_) => WaitOutcome::Failed("wait handle abandoned".to_string()),
        }
    }
}

#[derive(Debug)]
struct Registered {
    id: u64,
    sender: OutcomeSender,
}

#[derive(Debug, Default)]
struct Handles {
    by_path: Mutex<HashMap<String, Registered>>,
    next_id: AtomicU64,
}

/// Table of live registrations, at most one per path.
#[derive(Debug, Clone, Default)]
pub struct WaitRegistry {
    handles: Arc<Handles>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers processing of `path`, superseding any live registration.
    pub fn register(&self, path: &str) -> Registration {
        let id = self.handles.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, _) = watch::channel(None);
        let sender = Arc::new(sender);
        let previous = self.handles.by_path.lock().insert(
            path.to_string(),
            Registered {
                id,
                sender: sender.clone(),
            },
        );
        if let Some(previous) = previous {
            resolve_once(&previous.sender, WaitOutcome::Superseded);
        }
        Registration {
            path: path.to_string(),
            id,
            sender,
            handles: self.handles.clone(),
            resolved: false,
        }
    }

    pub fn is_waiting(&self, path: &str) -> bool {
        self.handles.by_path.lock().contains_key(path)
    }

    pub fn handle(&self, path: &str) -> Option<WaitHandle> {
        self.handles
            .by_path
            .lock()
            .get(path)
            .map(|registered| WaitHandle {
                path: path.to_string(),
                outcome: registered.sender.subscribe(),
            })
    }

    pub fn len(&self) -> usize {
        self.handles.by_path.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The dispatcher's side of a registration.
#[derive(Debug)]
pub struct Registration {
    path: String,
    id: u64,
    sender: OutcomeSender,
    handles: Arc<Handles>,
    resolved: bool,
}

impl Registration {
    pub fn handle(&self) -> WaitHandle {
        WaitHandle {
            path: self.path.clone(),
            outcome: self.sender.subscribe(),
        }
    }

    pub fn resolve(mut self, outcome: WaitOutcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: WaitOutcome) {
        if self.resolved {
            return;
        }
        self.resolved = true;
        resolve_once(&self.sender, outcome);
        let mut by_path = self.handles.by_path.lock();
        if by_path
            .get(&self.path)
            .is_some_and(|registered| registered.id == self.id)
        {
            by_path.remove(&self.path);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.finish(WaitOutcome::Failed("dispatch abandoned".to_string()));
    }
}

fn resolve_once(sender: &watch::Sender<Option<WaitOutcome>>, outcome: WaitOutcome) {
    sender.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(outcome);
        true
    });
}
