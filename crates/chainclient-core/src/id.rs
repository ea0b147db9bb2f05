//! Request identifier generation.
//!
//! Every envelope built by this crate draws its id from an [`IdGenerator`].
//! The default generator is a single process-wide counter shared by all
//! managers, so ids never collide across provider instances. Tests inject a
//! private [`SequentialIds`] to get deterministic values.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of strictly increasing request ids.
pub trait IdGenerator: Send + Sync + 'static {
    fn next_id(&self) -> u64;
}

/// Monotonic counter starting at a chosen value.
#[derive(Debug)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

static PROCESS_IDS: SequentialIds = SequentialIds {
    next: AtomicU64::new(1),
};

/// Handle onto the process-wide counter.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessIds;

impl IdGenerator for ProcessIds {
    fn next_id(&self) -> u64 {
        PROCESS_IDS.next_id()
    }
}

/// The generator used when none is injected.
pub fn process_ids() -> Arc<dyn IdGenerator> {
    Arc::new(ProcessIds)
}
