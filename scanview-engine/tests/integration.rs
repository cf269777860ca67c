use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use scanview_core::{
    DecodeError, ExperimentId, FetchError, ImageDownloader, ImageId, IntensityRange,
    RendererError, Scan, ScanId, SessionTree, Volume, VolumeCodec, VolumeRenderer,
};
use scanview_engine::{DecodeTask, EngineConfig, SessionContext, TaskEnv, WorkerPool};
use scanview_engine::{RangeTable, RawFileCache, VolumeCache};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Encodes an image as two little-endian f32 values (its min and max).
fn payload(min: f32, max: f32) -> Vec<u8> {
    let mut bytes = min.to_le_bytes().to_vec();
    bytes.extend_from_slice(&max.to_le_bytes());
    bytes
}

/// Serves per-image payloads, counting downloads and optionally failing
/// or blocking on a gate.
struct FakeDownloader {
    payloads: HashMap<ImageId, Vec<u8>>,
    failing: HashSet<ImageId>,
    calls: Mutex<HashMap<ImageId, usize>>,
    gate: AtomicBool,
}

impl FakeDownloader {
    fn new() -> Self {
        Self {
            payloads: HashMap::new(),
            failing: HashSet::new(),
            calls: Mutex::new(HashMap::new()),
            gate: AtomicBool::new(false),
        }
    }

    fn with_image(mut self, id: &str, min: f32, max: f32) -> Self {
        self.payloads.insert(ImageId::from(id), payload(min, max));
        self
    }

    fn with_failing(mut self, id: &str) -> Self {
        self.failing.insert(ImageId::from(id));
        self
    }

    /// Make every subsequent download block until `open_gate`.
    fn close_gate(&self) {
        self.gate.store(true, Ordering::SeqCst);
    }

    fn open_gate(&self) {
        self.gate.store(false, Ordering::SeqCst);
    }

    fn calls_for(&self, id: &str) -> usize {
        *self
            .calls
            .lock()
            .unwrap()
            .get(&ImageId::from(id))
            .unwrap_or(&0)
    }
}

impl ImageDownloader for FakeDownloader {
    fn download(&self, id: &ImageId) -> Result<Vec<u8>, FetchError> {
        *self.calls.lock().unwrap().entry(id.clone()).or_insert(0) += 1;
        while self.gate.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        if self.failing.contains(id) {
            return Err(FetchError::Download {
                id: id.clone(),
                reason: "synthetic failure".into(),
            });
        }
        self.payloads
            .get(id)
            .cloned()
            .ok_or_else(|| FetchError::Http {
                id: id.clone(),
                status: 404,
            })
    }
}

/// Decodes the two-f32 payload into a two-voxel volume, counting calls.
struct FakeCodec {
    calls: AtomicUsize,
}

impl FakeCodec {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

impl VolumeCodec for FakeCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Volume, DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if bytes.len() != 8 {
            return Err(DecodeError::TruncatedData {
                expected: 8,
                actual: bytes.len(),
            });
        }
        let min = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let max = f32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Volume::new([2, 1, 1], [1.0; 3], vec![min, max]).unwrap())
    }
}

#[derive(Debug, PartialEq)]
struct DisplayEvent {
    first_voxel: f32,
    scan_changed: bool,
}

/// Records every displayed volume; optionally rejects them all.
struct RecordingRenderer {
    events: Arc<Mutex<Vec<DisplayEvent>>>,
    reject: bool,
    prepared: bool,
}

impl RecordingRenderer {
    fn new(events: Arc<Mutex<Vec<DisplayEvent>>>) -> Self {
        Self {
            events,
            reject: false,
            prepared: false,
        }
    }
}

impl VolumeRenderer for RecordingRenderer {
    fn prepare(&mut self, scan_changed: bool) {
        self.prepared = scan_changed;
    }

    fn display(&mut self, volume: &Volume) -> Result<(), RendererError> {
        if self.reject {
            return Err(RendererError::Incompatible {
                reason: "rejecting everything".into(),
            });
        }
        self.events.lock().unwrap().push(DisplayEvent {
            first_voxel: volume.data[0],
            scan_changed: self.prepared,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn scan(id: &str, experiment: &str) -> Scan {
    Scan {
        id: ScanId::from(id),
        name: id.to_owned(),
        experiment: ExperimentId::from(experiment),
        image_count: 0,
        site: None,
        notes: Vec::new(),
        decisions: Vec::new(),
    }
}

/// Two experiments: e1 has two scans of two images, e2 one scan of one.
fn sample_tree() -> Arc<SessionTree> {
    let mut builder = SessionTree::builder();
    builder
        .add_experiment(ExperimentId::from("e1"), "e1")
        .unwrap();
    for s in ["s1", "s2"] {
        builder.add_scan(scan(s, "e1")).unwrap();
        for k in 0..2 {
            builder
                .add_image(&ScanId::from(s), ImageId::from(format!("{s}-i{k}")))
                .unwrap();
        }
    }
    builder
        .add_experiment(ExperimentId::from("e2"), "e2")
        .unwrap();
    builder.add_scan(scan("s3", "e2")).unwrap();
    builder
        .add_image(&ScanId::from("s3"), ImageId::from("s3-i0"))
        .unwrap();
    Arc::new(builder.build())
}

fn standard_downloader() -> FakeDownloader {
    FakeDownloader::new()
        .with_image("s1-i0", 0.0, 10.0)
        .with_image("s1-i1", 5.0, 20.0)
        .with_image("s2-i0", -5.0, 8.0)
        .with_image("s2-i1", 1.0, 2.0)
        .with_image("s3-i0", 100.0, 200.0)
}

struct Harness {
    ctx: SessionContext,
    downloader: Arc<FakeDownloader>,
    codec: Arc<FakeCodec>,
    events: Arc<Mutex<Vec<DisplayEvent>>>,
}

fn harness_with(downloader: FakeDownloader, reject_display: bool) -> Harness {
    let downloader = Arc::new(downloader);
    let codec = Arc::new(FakeCodec::new());
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut renderer = RecordingRenderer::new(events.clone());
    renderer.reject = reject_display;
    let ctx = SessionContext::new(
        sample_tree(),
        downloader.clone(),
        codec.clone(),
        Box::new(renderer),
        EngineConfig { pool_size: Some(2) },
    );
    Harness {
        ctx,
        downloader,
        codec,
        events,
    }
}

fn harness() -> Harness {
    harness_with(standard_downloader(), false)
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn env_for(h: &Harness) -> TaskEnv {
    TaskEnv {
        raw: Arc::new(RawFileCache::new()),
        volumes: Arc::new(VolumeCache::new()),
        ranges: Arc::new(RangeTable::new()),
        downloader: h.downloader.clone(),
        codec: h.codec.clone(),
    }
}

// ---------------------------------------------------------------------------
// Prefetch and caching
// ---------------------------------------------------------------------------

#[test]
fn prefetch_caches_the_whole_experiment() {
    let h = harness();
    h.ctx.experiment_changed(None, Some(&ExperimentId::from("e1")));

    wait_until("prefetch to settle", || {
        !h.ctx.state().is_loading_experiment()
    });

    for id in ["s1-i0", "s1-i1", "s2-i0", "s2-i1"] {
        assert!(h.ctx.volume_cached(&ImageId::from(id)), "{id} not cached");
        assert_eq!(h.downloader.calls_for(id), 1);
    }
    assert_eq!(h.ctx.state().cached_progress(), (4, 4));
    assert_eq!(h.ctx.state().cached_fraction(), 1.0);
}

#[test]
fn cumulative_range_is_monotone_union_of_scan_images() {
    let h = harness();
    h.ctx.experiment_changed(None, Some(&ExperimentId::from("e1")));
    wait_until("prefetch to settle", || {
        !h.ctx.state().is_loading_experiment()
    });

    // s1 images: [0,10] and [5,20]; s2 images: [-5,8] and [1,2].
    assert_eq!(
        h.ctx.cumulative_range(&ScanId::from("s1")),
        IntensityRange::new(0.0, 20.0)
    );
    assert_eq!(
        h.ctx.cumulative_range(&ScanId::from("s2")),
        IntensityRange::new(-5.0, 8.0)
    );
    assert!(h.ctx.cumulative_range(&ScanId::from("s3")).is_empty());
}

#[test]
fn swap_after_prefetch_reuses_cached_volume() {
    let h = harness();
    h.ctx.experiment_changed(None, Some(&ExperimentId::from("e1")));
    wait_until("prefetch to settle", || {
        !h.ctx.state().is_loading_experiment()
    });
    let decodes_before = h.codec.calls.load(Ordering::SeqCst);

    h.ctx.swap_to(&ImageId::from("s1-i0")).unwrap();
    wait_until("swap to apply", || !h.ctx.state().is_loading_dataset());

    assert_eq!(h.ctx.state().current_image(), Some(ImageId::from("s1-i0")));
    assert_eq!(h.downloader.calls_for("s1-i0"), 1);
    assert_eq!(h.codec.calls.load(Ordering::SeqCst), decodes_before);
    let events = h.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].first_voxel, 0.0);
    assert!(events[0].scan_changed, "first display is a scan boundary");
}

#[test]
fn failed_downloads_are_cached_and_not_retried() {
    let downloader = standard_downloader().with_failing("s1-i1");
    let h = harness_with(downloader, false);
    h.ctx.experiment_changed(None, Some(&ExperimentId::from("e1")));
    wait_until("prefetch to settle", || {
        !h.ctx.state().is_loading_experiment()
    });

    assert!(!h.ctx.volume_cached(&ImageId::from("s1-i1")));
    assert_eq!(h.ctx.state().cached_progress(), (4, 4));
    // The failure still covers later requests for the same image.
    h.ctx.swap_to(&ImageId::from("s1-i1")).unwrap();
    wait_until("swap to settle", || !h.ctx.state().is_loading_dataset());

    assert_eq!(h.downloader.calls_for("s1-i1"), 1);
    assert!(h.ctx.state().has_dataset_error());
    // Navigation advances past the broken file.
    assert_eq!(h.ctx.state().current_image(), Some(ImageId::from("s1-i1")));
    assert!(h.events.lock().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Eviction
// ---------------------------------------------------------------------------

#[test]
fn changing_experiment_evicts_the_departed_one() {
    let h = harness();
    h.ctx.experiment_changed(None, Some(&ExperimentId::from("e1")));
    wait_until("first prefetch", || !h.ctx.state().is_loading_experiment());
    assert_eq!(h.ctx.volume_cache_len(), 4);

    h.ctx.experiment_changed(
        Some(&ExperimentId::from("e1")),
        Some(&ExperimentId::from("e2")),
    );
    wait_until("second prefetch", || {
        !h.ctx.state().is_loading_experiment()
    });

    for id in ["s1-i0", "s1-i1", "s2-i0", "s2-i1"] {
        assert!(!h.ctx.volume_cached(&ImageId::from(id)), "{id} survived");
    }
    assert!(h.ctx.volume_cached(&ImageId::from("s3-i0")));
    assert_eq!(h.ctx.raw_cache_len(), 1);
    // The departed scans' cumulative ranges survive; only caches are evicted.
    assert_eq!(
        h.ctx.cumulative_range(&ScanId::from("s3")),
        IntensityRange::new(100.0, 200.0)
    );
}

#[test]
fn unchanged_experiment_is_a_no_op() {
    let h = harness();
    h.ctx.experiment_changed(None, Some(&ExperimentId::from("e1")));
    wait_until("prefetch", || !h.ctx.state().is_loading_experiment());

    h.ctx.experiment_changed(
        Some(&ExperimentId::from("e1")),
        Some(&ExperimentId::from("e1")),
    );
    assert!(!h.ctx.state().is_loading_experiment());
    for id in ["s1-i0", "s1-i1", "s2-i0", "s2-i1"] {
        assert_eq!(h.downloader.calls_for(id), 1);
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[test]
fn stale_cancel_does_not_touch_the_newer_batch() {
    let h = harness();
    let env = env_for(&h);
    let tasks = |ids: &[&str]| -> Vec<DecodeTask> {
        ids.iter()
            .map(|id| DecodeTask {
                image: ImageId::from(*id),
                scan: ScanId::from("s1"),
            })
            .collect()
    };

    let pool = WorkerPool::new(2);
    h.downloader.close_gate();
    let first = pool.submit_batch(env.clone(), tasks(&["s1-i0"]), |_, _| {});
    let stale_id = first.run_id;

    let second = pool.submit_batch(env.clone(), tasks(&["s1-i1", "s2-i0"]), |_, _| {});
    // Submitting the second batch already cancelled the first.
    pool.cancel(stale_id);
    h.downloader.open_gate();

    let outcomes = second.wait().unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.result.is_ok()));
    assert!(first.wait().is_ok());
}

#[test]
fn batch_progress_reaches_total_in_order() {
    let h = harness();
    let env = env_for(&h);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    let tasks: Vec<DecodeTask> = ["s1-i0", "s1-i1", "s2-i0", "s2-i1"]
        .iter()
        .map(|id| DecodeTask {
            image: ImageId::from(*id),
            scan: ScanId::from("s1"),
        })
        .collect();

    let pool = WorkerPool::new(2);
    let run = pool.submit_batch(env, tasks, move |done, total| {
        seen_cb.lock().unwrap().push((done, total));
    });
    let outcomes = run.wait().unwrap();

    assert_eq!(outcomes.len(), 4);
    let seen = seen.lock().unwrap();
    assert_eq!(*seen.last().unwrap(), (4, 4));
    assert!(seen.windows(2).all(|w| w[0].0 < w[1].0), "progress monotone");
}

// ---------------------------------------------------------------------------
// Swapping
// ---------------------------------------------------------------------------

#[test]
fn rapid_swaps_apply_only_the_last_request() {
    let h = harness();
    // Warm the cache first so swaps resolve quickly and deterministically,
    // then gate downloads so the two swap requests pile up.
    h.ctx.experiment_changed(None, Some(&ExperimentId::from("e1")));
    wait_until("prefetch", || !h.ctx.state().is_loading_experiment());

    h.ctx.swap_to(&ImageId::from("s1-i0")).unwrap();
    h.ctx.swap_to(&ImageId::from("s2-i1")).unwrap();
    wait_until("swaps to settle", || !h.ctx.state().is_loading_dataset());
    wait_until("last swap to apply", || {
        h.ctx.state().current_image() == Some(ImageId::from("s2-i1"))
    });

    let events = h.events.lock().unwrap();
    // The first request may or may not reach the renderer depending on
    // timing, but the final displayed volume is always the second one.
    assert_eq!(events.last().unwrap().first_voxel, 1.0);
    assert!(!h.ctx.state().has_dataset_error());
}

#[test]
fn swap_superseded_mid_load_is_never_displayed() {
    let h = harness();
    h.downloader.close_gate();
    h.ctx.swap_to(&ImageId::from("s1-i0")).unwrap();
    // Give the swap worker time to start loading the first request.
    wait_until("first download to start", || {
        h.downloader.calls_for("s1-i0") > 0
    });
    h.ctx.swap_to(&ImageId::from("s2-i1")).unwrap();
    h.downloader.open_gate();

    wait_until("second swap to apply", || {
        h.ctx.state().current_image() == Some(ImageId::from("s2-i1"))
    });
    let events = h.events.lock().unwrap();
    assert_eq!(events.len(), 1, "superseded swap reached the renderer");
    assert_eq!(events[0].first_voxel, 1.0);
}

#[test]
fn swap_to_unknown_image_is_an_error() {
    let h = harness();
    assert!(h.ctx.swap_to(&ImageId::from("nope")).is_err());
    assert!(!h.ctx.state().is_loading_dataset());
}

#[test]
fn reselecting_the_current_image_is_a_no_op() {
    let h = harness();
    h.ctx.swap_to(&ImageId::from("s1-i0")).unwrap();
    wait_until("swap", || !h.ctx.state().is_loading_dataset());
    assert_eq!(h.events.lock().unwrap().len(), 1);

    h.ctx.swap_to(&ImageId::from("s1-i0")).unwrap();
    assert!(!h.ctx.state().is_loading_dataset());
    assert_eq!(h.events.lock().unwrap().len(), 1);
}

#[test]
fn scan_boundary_is_reported_to_the_renderer() {
    let h = harness();
    h.ctx.experiment_changed(None, Some(&ExperimentId::from("e1")));
    wait_until("prefetch", || !h.ctx.state().is_loading_experiment());

    for (id, expect_changed) in [("s1-i0", true), ("s1-i1", false), ("s2-i0", true)] {
        h.ctx.swap_to(&ImageId::from(id)).unwrap();
        wait_until("swap", || {
            h.ctx.state().current_image() == Some(ImageId::from(id))
        });
        let events = h.events.lock().unwrap();
        assert_eq!(
            events.last().unwrap().scan_changed,
            expect_changed,
            "wrong boundary flag for {id}"
        );
    }
}

#[test]
fn renderer_failure_sets_the_error_flag_but_advances() {
    let h = harness_with(standard_downloader(), true);
    h.ctx.swap_to(&ImageId::from("s1-i0")).unwrap();
    wait_until("swap", || !h.ctx.state().is_loading_dataset());

    assert!(h.ctx.state().has_dataset_error());
    assert_eq!(h.ctx.state().current_image(), Some(ImageId::from("s1-i0")));
    assert!(h.events.lock().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Reset
// ---------------------------------------------------------------------------

#[test]
fn reset_clears_all_session_state() {
    let h = harness();
    h.ctx.experiment_changed(None, Some(&ExperimentId::from("e1")));
    wait_until("prefetch", || !h.ctx.state().is_loading_experiment());
    h.ctx.swap_to(&ImageId::from("s1-i0")).unwrap();
    wait_until("swap", || !h.ctx.state().is_loading_dataset());

    h.ctx.reset();

    assert_eq!(h.ctx.volume_cache_len(), 0);
    assert_eq!(h.ctx.raw_cache_len(), 0);
    assert!(h.ctx.cumulative_range(&ScanId::from("s1")).is_empty());
    assert_eq!(h.ctx.state().current_image(), None);
    assert_eq!(h.ctx.state().cached_progress(), (0, 0));
    assert!(!h.ctx.state().is_loading_experiment());
}

#[test]
fn work_settling_after_reset_is_discarded() {
    let h = harness();
    h.downloader.close_gate();
    h.ctx.experiment_changed(None, Some(&ExperimentId::from("e1")));

    // Workers are now blocked inside their downloads.
    wait_until("downloads to start", || h.downloader.calls_for("s1-i0") > 0);
    h.ctx.reset();
    h.downloader.open_gate();

    // Give stragglers time to settle; none of their results may land.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(h.ctx.volume_cache_len(), 0);
    assert_eq!(h.ctx.raw_cache_len(), 0);
    assert!(h.ctx.cumulative_range(&ScanId::from("s1")).is_empty());
}
