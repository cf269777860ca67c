use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use scanview_core::{
    ExperimentId, ImageDownloader, ImageId, IntensityRange, ScanId, SessionTree, VolumeCodec,
    VolumeRenderer,
};

use crate::cache::{RawFileCache, VolumeCache};
use crate::error::EngineError;
use crate::pool::{default_pool_size, TaskEnv, WorkerPool};
use crate::prefetch;
use crate::ranges::RangeTable;
use crate::state::SessionState;
use crate::swap::Swapper;

/// Engine tuning knobs.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Decode worker count; defaults to half the hardware parallelism,
    /// with a floor of two.
    pub pool_size: Option<usize>,
}

/// One loaded session and every mutable thing that hangs off it: both
/// caches, the cumulative ranges, the prefetch pool, the dataset swapper,
/// and the observable flags.
///
/// The epoch counter versions the whole session. `reset` bumps it, and all
/// deferred cache writes are epoch- or generation-guarded, so work from
/// before a reset can never leak into the state after it.
pub struct SessionContext {
    tree: Arc<SessionTree>,
    env: TaskEnv,
    pool: WorkerPool,
    swapper: Swapper,
    state: Arc<SessionState>,
    epoch: Arc<AtomicU64>,
    latest_prefetch: Arc<AtomicU64>,
    /// Experiment the most recent swap or prefetch targeted. Tracked
    /// separately from the applied current image so rapid navigation
    /// within one experiment does not resubmit its prefetch batch.
    focused_experiment: Mutex<Option<ExperimentId>>,
}

impl SessionContext {
    pub fn new(
        tree: Arc<SessionTree>,
        downloader: Arc<dyn ImageDownloader>,
        codec: Arc<dyn VolumeCodec>,
        renderer: Box<dyn VolumeRenderer>,
        config: EngineConfig,
    ) -> Self {
        let env = TaskEnv {
            raw: Arc::new(RawFileCache::new()),
            volumes: Arc::new(VolumeCache::new()),
            ranges: Arc::new(RangeTable::new()),
            downloader,
            codec,
        };
        let state = Arc::new(SessionState::default());
        let epoch = Arc::new(AtomicU64::new(0));
        let swapper = Swapper::spawn(env.clone(), state.clone(), epoch.clone(), renderer);
        let pool_size = config.pool_size.unwrap_or_else(default_pool_size);
        info!(
            experiments = tree.experiment_count(),
            images = tree.image_count(),
            pool_size,
            "session context created"
        );
        Self {
            tree,
            env,
            pool: WorkerPool::new(pool_size),
            swapper,
            state,
            epoch,
            latest_prefetch: Arc::new(AtomicU64::new(0)),
            focused_experiment: Mutex::new(None),
        }
    }

    pub fn tree(&self) -> &SessionTree {
        &self.tree
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    /// The cumulative intensity range of everything decoded for `scan`
    /// so far this session.
    pub fn cumulative_range(&self, scan: &ScanId) -> IntensityRange {
        self.env.ranges.get(scan)
    }

    /// Make `image` the actively displayed dataset.
    ///
    /// Queues the swap, then runs the experiment-change hook so moving
    /// into a different experiment evicts the old one and prefetches the
    /// new one. Re-selecting the current image is a no-op.
    pub fn swap_to(&self, image: &ImageId) -> Result<(), EngineError> {
        let record = self
            .tree
            .image(image)
            .ok_or_else(|| EngineError::UnknownImage(image.clone()))?;
        if self.state.current_image().as_ref() == Some(image) {
            return Ok(());
        }
        let old_experiment = self.focused_experiment.lock().clone();

        self.state.set_loading_dataset(true);
        self.state.set_dataset_error(false);
        self.swapper.request(
            image.clone(),
            record.scan.clone(),
            self.epoch.load(Ordering::SeqCst),
        );
        self.experiment_changed(old_experiment.as_ref(), Some(&record.experiment));
        Ok(())
    }

    /// Evict the old experiment's cache entries and prefetch the new one.
    /// No-op when `new` is `None` or unchanged.
    pub fn experiment_changed(&self, old: Option<&ExperimentId>, new: Option<&ExperimentId>) {
        prefetch::experiment_changed(self, old, new);
    }

    /// Drop everything mutable: caches, ranges, flags, current image.
    /// In-flight work is cancelled and its late results are discarded.
    pub fn reset(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.pool.cancel_current();
        self.env.raw.clear();
        self.env.volumes.clear();
        self.env.ranges.clear();
        self.state.set_loading_dataset(false);
        self.state.set_dataset_error(false);
        self.state.set_loading_experiment(false);
        self.state.set_cached_progress(0, 0);
        self.state.set_current_image(None);
        *self.focused_experiment.lock() = None;
        info!("session reset");
    }

    pub(crate) fn env(&self) -> &TaskEnv {
        &self.env
    }

    pub(crate) fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub(crate) fn latest_prefetch(&self) -> &Arc<AtomicU64> {
        &self.latest_prefetch
    }

    pub(crate) fn set_focused_experiment(&self, experiment: ExperimentId) {
        *self.focused_experiment.lock() = Some(experiment);
    }

    /// Number of raw entries currently cached, for diagnostics.
    pub fn raw_cache_len(&self) -> usize {
        self.env.raw.len()
    }

    /// Number of decoded volumes currently cached, for diagnostics.
    pub fn volume_cache_len(&self) -> usize {
        self.env.volumes.len()
    }

    /// Whether an image's decoded volume is cached, for diagnostics.
    pub fn volume_cached(&self, image: &ImageId) -> bool {
        self.env.volumes.contains(image)
    }
}
