use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use scanview_core::{ImageId, ScanId, VolumeRenderer};

use crate::pool::{load_volume, TaskEnv};
use crate::state::SessionState;

/// A request to make one image the actively displayed dataset.
struct SwapRequest {
    seq: u64,
    epoch: u64,
    image: ImageId,
    scan: ScanId,
}

/// Serializes dataset swaps onto one worker thread that owns the renderer.
///
/// Requests are coalesced two ways: the worker drains its queue and keeps
/// only the newest request before doing any work, and after loading it
/// re-checks a shared latest-sequence counter so a request that was
/// overtaken mid-load never reaches the renderer. Loads here are
/// out-of-band; they never pass through the prefetch pool.
pub struct Swapper {
    tx: Sender<SwapRequest>,
    seq: AtomicU64,
    latest: Arc<AtomicU64>,
}

impl Swapper {
    pub(crate) fn spawn(
        env: TaskEnv,
        state: Arc<SessionState>,
        epoch: Arc<AtomicU64>,
        renderer: Box<dyn VolumeRenderer>,
    ) -> Self {
        let (tx, rx) = unbounded();
        let latest = Arc::new(AtomicU64::new(0));
        let worker_latest = latest.clone();
        std::thread::Builder::new()
            .name("dataset-swap".into())
            .spawn(move || swap_worker(rx, env, state, epoch, worker_latest, renderer))
            .expect("failed to spawn dataset swap thread");
        Self {
            tx,
            seq: AtomicU64::new(0),
            latest,
        }
    }

    pub(crate) fn request(&self, image: ImageId, scan: ScanId, epoch: u64) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.latest.store(seq, Ordering::SeqCst);
        debug!(image = %image, seq, "queueing dataset swap");
        let _ = self.tx.send(SwapRequest {
            seq,
            epoch,
            image,
            scan,
        });
    }
}

fn swap_worker(
    rx: Receiver<SwapRequest>,
    env: TaskEnv,
    state: Arc<SessionState>,
    epoch: Arc<AtomicU64>,
    latest: Arc<AtomicU64>,
    mut renderer: Box<dyn VolumeRenderer>,
) {
    // Scan of the volume currently on the renderer, to detect boundaries.
    let mut displayed_scan: Option<ScanId> = None;

    while let Ok(first) = rx.recv() {
        let request = drain_latest(first, &rx);

        if request.epoch != epoch.load(Ordering::SeqCst) {
            // Session was reset while this request sat in the queue.
            state.set_loading_dataset(false);
            continue;
        }

        let request_epoch = request.epoch;
        let guard_epoch = epoch.clone();
        let result = load_volume(&env, &request.image, &request.scan, &|| {
            guard_epoch.load(Ordering::SeqCst) == request_epoch
        });

        if latest.load(Ordering::SeqCst) != request.seq {
            // Overtaken while loading; the newer request owns the flags.
            debug!(image = %request.image, "dropping superseded dataset swap");
            continue;
        }

        match result {
            Ok((volume, _)) => {
                let scan_changed = displayed_scan.as_ref() != Some(&request.scan);
                renderer.prepare(scan_changed);
                match renderer.display(&volume) {
                    Ok(()) => {
                        displayed_scan = Some(request.scan.clone());
                        info!(image = %request.image, scan_changed, "dataset displayed");
                    }
                    Err(err) => {
                        warn!(image = %request.image, error = %err, "renderer rejected dataset");
                        state.set_dataset_error(true);
                    }
                }
            }
            Err(err) => {
                warn!(image = %request.image, error = %err, "failed to load dataset");
                state.set_dataset_error(true);
            }
        }

        // The image becomes current even on failure, so navigation can
        // continue past a broken file.
        state.set_current_image(Some(request.image.clone()));
        state.set_loading_dataset(false);
    }
}

/// Collapse a burst of requests down to the most recent one.
fn drain_latest(first: SwapRequest, rx: &Receiver<SwapRequest>) -> SwapRequest {
    let mut newest = first;
    while let Ok(request) = rx.try_recv() {
        newest = request;
    }
    newest
}
