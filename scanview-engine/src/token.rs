use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one prefetch batch submission.
pub type RunId = u64;

/// Cooperative cancellation shared between a batch and its workers.
///
/// Workers capture the generation when their batch starts, then compare it
/// between tasks and inside every cache-insert guard. `cancel` advances the
/// generation, which both stops the workers at their next task boundary and
/// invalidates any cache write still pending from this batch.
#[derive(Debug, Default)]
pub struct CancelToken {
    generation: AtomicU64,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the associated batch by advancing the generation.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Read the current generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// True once `generation` is no longer the current one.
    pub fn is_stale(&self, generation: u64) -> bool {
        self.generation() != generation
    }
}
