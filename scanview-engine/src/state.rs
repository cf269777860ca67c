use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use scanview_core::ImageId;

/// Observable session flags, shared between the engine's worker threads
/// and whatever surface is polling them.
#[derive(Debug, Default)]
pub struct SessionState {
    loading_dataset: AtomicBool,
    error_loading_dataset: AtomicBool,
    loading_experiment: AtomicBool,
    cached_done: AtomicUsize,
    cached_total: AtomicUsize,
    current_image: Mutex<Option<ImageId>>,
}

impl SessionState {
    /// True while a dataset swap is pending.
    pub fn is_loading_dataset(&self) -> bool {
        self.loading_dataset.load(Ordering::SeqCst)
    }

    pub fn set_loading_dataset(&self, loading: bool) {
        self.loading_dataset.store(loading, Ordering::SeqCst);
    }

    /// True when the most recent dataset swap failed to display.
    pub fn has_dataset_error(&self) -> bool {
        self.error_loading_dataset.load(Ordering::SeqCst)
    }

    pub fn set_dataset_error(&self, error: bool) {
        self.error_loading_dataset.store(error, Ordering::SeqCst);
    }

    /// True while an experiment prefetch batch is outstanding.
    pub fn is_loading_experiment(&self) -> bool {
        self.loading_experiment.load(Ordering::SeqCst)
    }

    pub fn set_loading_experiment(&self, loading: bool) {
        self.loading_experiment.store(loading, Ordering::SeqCst);
    }

    pub fn set_cached_progress(&self, done: usize, total: usize) {
        // Total first so a racing reader never sees done > total.
        self.cached_total.store(total, Ordering::SeqCst);
        self.cached_done.store(done, Ordering::SeqCst);
    }

    pub fn cached_progress(&self) -> (usize, usize) {
        (
            self.cached_done.load(Ordering::SeqCst),
            self.cached_total.load(Ordering::SeqCst),
        )
    }

    /// Fraction of the current prefetch batch that has settled, in `0..=1`.
    /// Zero when no batch has been submitted.
    pub fn cached_fraction(&self) -> f64 {
        let (done, total) = self.cached_progress();
        if total == 0 {
            0.0
        } else {
            done as f64 / total as f64
        }
    }

    pub fn current_image(&self) -> Option<ImageId> {
        self.current_image.lock().clone()
    }

    pub fn set_current_image(&self, image: Option<ImageId>) {
        *self.current_image.lock() = image;
    }
}
