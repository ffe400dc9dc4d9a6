//! Hooks supplied by the engine's owner: which events to accept and what to
//! do with them.

use std::path::Path;

use async_trait::async_trait;
use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::error::{Result, WatchError};
use crate::types::QueuedEvent;

/// Acceptance predicate applied at submission time.
pub trait EventFilter: Send + Sync {
    /// Whether events for this root-relative path should be dispatched.
    fn is_eligible(&self, path: &str) -> bool;

    /// Create/change events above this size are dropped.
    fn is_too_large(&self, size: u64) -> bool;
}

/// Downstream handler for accepted events.
///
/// Called at most once at a time per path. A returned error is logged and
/// recorded on the path's wait handle; it never stops the queue.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    async fn process_event(&self, event: &QueuedEvent) -> Result<()>;
}

/// Accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl EventFilter for AcceptAll {
    fn is_eligible(&self, _path: &str) -> bool {
        true
    }

    fn is_too_large(&self, _size: u64) -> bool {
        false
    }
}

/// Gitignore-style exclusion patterns plus an optional size cap.
#[derive(Debug)]
pub struct PatternFilter {
    matcher: Gitignore,
    max_file_size: Option<u64>,
}

impl PatternFilter {
    pub fn new<I, S>(root: &Path, patterns: I, max_file_size: Option<u64>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GitignoreBuilder::new(root);
        for pattern in patterns {
            let pattern = pattern.as_ref();
            builder.add_line(None, pattern).map_err(|error| {
                WatchError::Config(format!("invalid ignore pattern {pattern:?}: {error}"))
            })?;
        }
        let matcher = builder
            .build()
            .map_err(|error| WatchError::Config(format!("failed to build ignore matcher: {error}")))?;
        Ok(Self {
            matcher,
            max_file_size,
        })
    }

    /// A filter that excludes nothing but still enforces `max_file_size`.
    pub fn size_only(max_file_size: Option<u64>) -> Self {
        Self {
            matcher: Gitignore::empty(),
            max_file_size,
        }
    }

    pub fn max_file_size(&self) -> Option<u64> {
        self.max_file_size
    }
}

impl EventFilter for PatternFilter {
    fn is_eligible(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        !self
            .matcher
            .matched_path_or_any_parents(Path::new(path), false)
            .is_ignore()
    }

    fn is_too_large(&self, size: u64) -> bool {
        self.max_file_size.is_some_and(|limit| size > limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(patterns: &[&str]) -> PatternFilter {
        PatternFilter::new(Path::new("/vault"), patterns, Some(1024)).expect("filter")
    }

    #[test]
    fn patterns_exclude_files_and_directories() {
        let filter = filter(&["*.tmp", ".git/", "drafts/**"]);
        assert!(filter.is_eligible("notes/a.md"));
        assert!(!filter.is_eligible("notes/a.tmp"));
        assert!(!filter.is_eligible(".git/config"));
        assert!(!filter.is_eligible("drafts/x/y.md"));
    }

    #[test]
    fn negated_pattern_reincludes() {
        let filter = filter(&["*.log", "!keep.log"]);
        assert!(!filter.is_eligible("debug.log"));
        assert!(filter.is_eligible("keep.log"));
    }

    #[test]
    fn size_cap_is_inclusive() {
        let filter = filter(&[]);
        assert!(!filter.is_too_large(1024));
        assert!(filter.is_too_large(1025));
        assert!(!PatternFilter::size_only(None).is_too_large(u64::MAX));
    }

    #[test]
    fn invalid_pattern_is_config_error() {
        let result = PatternFilter::new(Path::new("/vault"), ["notes/[z-a].md"], None);
        assert!(matches!(result, Err(WatchError::Config(_))));
    }

    #[test]
    fn accept_all_accepts() {
        assert!(AcceptAll.is_eligible("x"));
        assert!(!AcceptAll.is_too_large(u64::MAX));
    }
}
