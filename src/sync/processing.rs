use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// How to treat a change event on a mirrored entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeDisposition {
    /// Raised by the engine's own writes
    Ignore,
    /// An outside modification of a read-only mirrored entity
    Reject,
    Allow,
}

/// Counts in-flight engine writes so their change events can be told apart
/// from modifications made by anyone else
#[derive(Debug, Clone, Default)]
pub struct ProcessingTracker {
    active: Arc<AtomicUsize>,
}

impl ProcessingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of an engine write. Processing ends when the guard drops.
    pub fn begin(&self) -> ProcessingGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ProcessingGuard {
            active: self.active.clone(),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    pub fn classify(&self, suppress_modifications: bool) -> ChangeDisposition {
        if self.is_processing() {
            ChangeDisposition::Ignore
        } else if suppress_modifications {
            ChangeDisposition::Reject
        } else {
            ChangeDisposition::Allow
        }
    }
}

#[must_use = "processing ends as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ProcessingGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
