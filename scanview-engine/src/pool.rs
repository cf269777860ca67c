use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use scanview_core::{
    DecodeError, FetchError, ImageDownloader, ImageId, IntensityRange, ScanId, Volume,
    VolumeCodec,
};

use crate::cache::{CachedVolume, RawFileCache, VolumeCache};
use crate::ranges::RangeTable;
use crate::token::{CancelToken, RunId};

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// One unit of prefetch work: download, decode, and cache a single image.
#[derive(Debug, Clone)]
pub struct DecodeTask {
    pub image: ImageId,
    pub scan: ScanId,
}

/// Why a single task failed. Failures are per-task; the batch carries on.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// The settled result of one [`DecodeTask`].
#[derive(Debug)]
pub struct TaskOutcome {
    pub image: ImageId,
    pub scan: ScanId,
    pub result: Result<IntensityRange, TaskError>,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("a decode worker panicked before the batch settled")]
    WorkerPanicked,
}

/// Everything a decode task needs, shared across workers and the swapper.
#[derive(Clone)]
pub struct TaskEnv {
    pub raw: Arc<RawFileCache>,
    pub volumes: Arc<VolumeCache>,
    pub ranges: Arc<RangeTable>,
    pub downloader: Arc<dyn ImageDownloader>,
    pub codec: Arc<dyn VolumeCodec>,
}

/// Cache-first load of one image: raw bytes, decode, guarded cache insert.
///
/// The cumulative range is widened only when the insert is accepted, so a
/// cancelled or superseded load never leaks into the per-scan ranges. The
/// decoded volume is returned either way so the caller can still use it.
pub(crate) fn load_volume(
    env: &TaskEnv,
    image: &ImageId,
    scan: &ScanId,
    permitted: &dyn Fn() -> bool,
) -> Result<(Arc<Volume>, IntensityRange), TaskError> {
    if let Some(hit) = env.volumes.get(image) {
        trace!(image = %image, "volume cache hit");
        return Ok((hit.volume, hit.range));
    }
    let bytes = env.raw.fetch(image, env.downloader.as_ref())?;
    let volume = Arc::new(env.codec.decode(&bytes)?);
    let range = volume.value_range();
    let stored = env.volumes.insert_if(
        image.clone(),
        CachedVolume {
            volume: volume.clone(),
            range,
        },
        permitted,
    );
    if stored {
        env.ranges.widen(scan, range);
    } else {
        debug!(image = %image, "discarding decode result for cancelled work");
    }
    Ok((volume, range))
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// Picks a worker count from the machine: half the available parallelism,
/// but never fewer than two.
pub fn default_pool_size() -> usize {
    let hardware = thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(2);
    (hardware / 2).max(2)
}

struct ActiveRun {
    run_id: RunId,
    token: Arc<CancelToken>,
}

/// Bounded pool of decode workers fed from a task channel.
///
/// One batch is active at a time; submitting a new batch cancels the old
/// one. Workers are spawned per batch and exit when the task channel
/// drains or the batch is cancelled, mirroring the one-shot lifecycle of
/// the prefetch it serves.
pub struct WorkerPool {
    size: usize,
    next_run: AtomicU64,
    current: Mutex<Option<ActiveRun>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            next_run: AtomicU64::new(0),
            current: Mutex::new(None),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn current_run_id(&self) -> Option<RunId> {
        self.current.lock().as_ref().map(|run| run.run_id)
    }

    /// Cancel the batch identified by `run_id`. A stale or unknown id is
    /// ignored, so a late cancel cannot kill a newer batch.
    pub fn cancel(&self, run_id: RunId) {
        let current = self.current.lock();
        match current.as_ref() {
            Some(active) if active.run_id == run_id => {
                debug!(run_id, "cancelling prefetch batch");
                active.token.cancel();
            }
            _ => debug!(run_id, "ignoring cancel for stale run id"),
        }
    }

    /// Cancel whatever batch is currently active.
    pub fn cancel_current(&self) {
        if let Some(active) = self.current.lock().as_ref() {
            active.token.cancel();
        }
    }

    /// Submit a batch, cancelling and replacing any active one.
    ///
    /// `on_progress(done, total)` fires from the collector thread once per
    /// settled task. The returned [`BatchRun`] identifies the batch and
    /// can be waited on for its outcomes.
    pub fn submit_batch(
        &self,
        env: TaskEnv,
        tasks: Vec<DecodeTask>,
        on_progress: impl Fn(usize, usize) + Send + 'static,
    ) -> BatchRun {
        let run_id = self.next_run.fetch_add(1, Ordering::SeqCst) + 1;
        let token = Arc::new(CancelToken::new());
        let generation = token.generation();
        {
            let mut current = self.current.lock();
            if let Some(previous) = current.take() {
                previous.token.cancel();
            }
            *current = Some(ActiveRun {
                run_id,
                token: token.clone(),
            });
        }

        let total = tasks.len();
        debug!(run_id, tasks = total, workers = self.size, "starting prefetch batch");

        let (task_tx, task_rx) = unbounded::<DecodeTask>();
        let (outcome_tx, outcome_rx) = unbounded::<TaskOutcome>();
        for task in tasks {
            // Receivers outlive this loop; the channel cannot be closed yet.
            let _ = task_tx.send(task);
        }
        drop(task_tx);

        let mut workers = Vec::with_capacity(self.size);
        for worker in 0..self.size {
            let task_rx = task_rx.clone();
            let outcome_tx = outcome_tx.clone();
            let env = env.clone();
            let token = token.clone();
            let handle = thread::Builder::new()
                .name(format!("decode-worker-{worker}"))
                .spawn(move || {
                    while let Ok(task) = task_rx.recv() {
                        // Checked between tasks; a running download is
                        // allowed to finish, its result is discarded at
                        // the cache instead.
                        if token.is_stale(generation) {
                            break;
                        }
                        let result =
                            load_volume(&env, &task.image, &task.scan, &|| {
                                !token.is_stale(generation)
                            })
                            .map(|(_, range)| range);
                        let outcome = TaskOutcome {
                            image: task.image,
                            scan: task.scan,
                            result,
                        };
                        if outcome_tx.send(outcome).is_err() {
                            break;
                        }
                    }
                })
                .expect("failed to spawn decode worker thread");
            workers.push(handle);
        }
        drop(outcome_tx);

        let collector = thread::Builder::new()
            .name("batch-collector".into())
            .spawn(move || {
                let mut outcomes = Vec::with_capacity(total);
                for outcome in outcome_rx.iter() {
                    if let Err(err) = &outcome.result {
                        debug!(image = %outcome.image, error = %err, "prefetch task failed");
                    }
                    outcomes.push(outcome);
                    on_progress(outcomes.len(), total);
                }
                let mut panicked = false;
                for worker in workers {
                    if worker.join().is_err() {
                        panicked = true;
                    }
                }
                if panicked {
                    Err(PoolError::WorkerPanicked)
                } else {
                    Ok(outcomes)
                }
            })
            .expect("failed to spawn batch collector thread");

        BatchRun { run_id, collector }
    }
}

/// Handle to one submitted batch. Cancellation goes through the pool by
/// run id; the handle only identifies and waits.
pub struct BatchRun {
    pub run_id: RunId,
    collector: JoinHandle<Result<Vec<TaskOutcome>, PoolError>>,
}

impl BatchRun {
    /// Block until the batch settles. A cancelled batch settles early with
    /// only the outcomes that finished before the cancel took effect.
    pub fn wait(self) -> Result<Vec<TaskOutcome>, PoolError> {
        self.collector
            .join()
            .unwrap_or(Err(PoolError::WorkerPanicked))
    }
}
