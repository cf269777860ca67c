use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use scanview_core::{FetchError, ImageDownloader, ImageId, IntensityRange, Volume};

// ---------------------------------------------------------------------------
// Raw file cache
// ---------------------------------------------------------------------------

type FetchResult = Result<Arc<[u8]>, FetchError>;

enum RawEntry {
    /// A download is in flight; waiters park a sender here. The era marks
    /// which owner inserted the entry, so a download that outlives an
    /// eviction cannot claim an entry re-created by a later fetch.
    Pending {
        era: u64,
        waiters: Vec<Sender<FetchResult>>,
    },
    Ready(Arc<[u8]>),
    /// The download failed. Kept so repeat requests fail fast instead of
    /// hammering the server; retry requires an explicit `forget`.
    Failed(FetchError),
}

/// Caches raw image bytes keyed by image id, deduplicating concurrent
/// downloads of the same image.
///
/// The first caller of `fetch` for an id becomes the download owner; any
/// caller arriving while the download is in flight blocks on a waiter
/// channel and receives a clone of the owner's result. If the entry is
/// evicted mid-download, the owner still gets its bytes but the slot is
/// not repopulated, and waiters see the download as abandoned.
pub struct RawFileCache {
    entries: Mutex<HashMap<ImageId, RawEntry>>,
    next_era: AtomicU64,
}

impl RawFileCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_era: AtomicU64::new(0),
        }
    }

    pub fn fetch(&self, id: &ImageId, downloader: &dyn ImageDownloader) -> FetchResult {
        let era = {
            let mut entries = self.entries.lock();
            match entries.entry(id.clone()) {
                Entry::Occupied(mut occupied) => match occupied.get_mut() {
                    RawEntry::Ready(bytes) => {
                        trace!(image = %id, "raw cache hit");
                        return Ok(bytes.clone());
                    }
                    RawEntry::Failed(err) => {
                        trace!(image = %id, "raw cache holds cached failure");
                        return Err(err.clone());
                    }
                    RawEntry::Pending { waiters, .. } => {
                        let (tx, rx) = bounded(1);
                        waiters.push(tx);
                        drop(entries);
                        // Sender dropped without sending means the entry
                        // was evicted while the download was in flight.
                        return rx
                            .recv()
                            .unwrap_or_else(|_| Err(FetchError::Abandoned(id.clone())));
                    }
                },
                Entry::Vacant(vacant) => {
                    let era = self.next_era.fetch_add(1, Ordering::Relaxed);
                    vacant.insert(RawEntry::Pending {
                        era,
                        waiters: Vec::new(),
                    });
                    era
                }
            }
        };

        // This thread owns the download; the lock is not held while the
        // bytes travel over the network.
        let result: FetchResult = downloader.download(id).map(Arc::from);

        let waiters = {
            let mut entries = self.entries.lock();
            match entries.entry(id.clone()) {
                Entry::Occupied(mut occupied) => {
                    // Only the entry this owner inserted may be settled by
                    // it. A Pending with a different era (or a Ready/Failed)
                    // means the id was evicted and a later fetch owns the
                    // slot now; that owner's result wins.
                    let owned = matches!(
                        occupied.get_mut(),
                        RawEntry::Pending { era: entry_era, .. } if *entry_era == era
                    );
                    if owned {
                        let waiters = match occupied.get_mut() {
                            RawEntry::Pending { waiters, .. } => std::mem::take(waiters),
                            _ => Vec::new(),
                        };
                        match &result {
                            Ok(bytes) => occupied.insert(RawEntry::Ready(bytes.clone())),
                            Err(err) => occupied.insert(RawEntry::Failed(err.clone())),
                        };
                        waiters
                    } else {
                        debug!(image = %id, "discarding download result for superseded entry");
                        Vec::new()
                    }
                }
                // Evicted mid-download: do not resurrect the entry.
                Entry::Vacant(_) => {
                    debug!(image = %id, "discarding download result for evicted entry");
                    Vec::new()
                }
            }
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        result
    }

    pub fn contains(&self, id: &ImageId) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Drop entries for the given ids, including cached failures and
    /// in-flight downloads.
    pub fn evict<'a>(&self, ids: impl IntoIterator<Item = &'a ImageId>) {
        let mut entries = self.entries.lock();
        for id in ids {
            entries.remove(id);
        }
    }

    /// Drop a single entry, e.g. to allow a retry after a cached failure.
    pub fn forget(&self, id: &ImageId) {
        self.entries.lock().remove(id);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for RawFileCache {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Volume cache
// ---------------------------------------------------------------------------

/// A decoded volume and the intensity range observed when it was decoded.
#[derive(Clone)]
pub struct CachedVolume {
    pub volume: Arc<Volume>,
    pub range: IntensityRange,
}

/// Caches decoded volumes keyed by image id.
///
/// Inserts go through [`insert_if`](Self::insert_if), which re-checks a
/// caller-supplied guard under the cache lock. Eviction, cancellation, and
/// session reset all invalidate their guards first, so work that settles
/// late cannot repopulate a slot that was just cleared.
pub struct VolumeCache {
    entries: Mutex<HashMap<ImageId, CachedVolume>>,
}

impl VolumeCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &ImageId) -> Option<CachedVolume> {
        self.entries.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &ImageId) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Insert `cached` under `id` only if `permitted` still holds once the
    /// lock is taken. Returns whether the insert happened.
    pub fn insert_if(
        &self,
        id: ImageId,
        cached: CachedVolume,
        permitted: impl FnOnce() -> bool,
    ) -> bool {
        let mut entries = self.entries.lock();
        if !permitted() {
            return false;
        }
        entries.insert(id, cached);
        true
    }

    pub fn evict<'a>(&self, ids: impl IntoIterator<Item = &'a ImageId>) {
        let mut entries = self.entries.lock();
        for id in ids {
            entries.remove(id);
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for VolumeCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_for(flag: &AtomicBool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !flag.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "flag never set");
            thread::sleep(Duration::from_millis(1));
        }
    }

    struct CountingDownloader {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingDownloader {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    impl ImageDownloader for CountingDownloader {
        fn download(&self, id: &ImageId) -> Result<Vec<u8>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(FetchError::Download {
                    id: id.clone(),
                    reason: "boom".into(),
                })
            } else {
                Ok(vec![1, 2, 3])
            }
        }
    }

    #[test]
    fn fetch_caches_bytes() {
        let cache = RawFileCache::new();
        let downloader = CountingDownloader::new(false);
        let id = ImageId::from("a");
        let bytes = cache.fetch(&id, &downloader).unwrap();
        assert_eq!(&bytes[..], &[1, 2, 3]);
        cache.fetch(&id, &downloader).unwrap();
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failures_are_cached_without_retry() {
        let cache = RawFileCache::new();
        let downloader = CountingDownloader::new(true);
        let id = ImageId::from("a");
        assert!(cache.fetch(&id, &downloader).is_err());
        assert!(cache.fetch(&id, &downloader).is_err());
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 1);

        cache.forget(&id);
        assert!(cache.fetch(&id, &downloader).is_err());
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_fetches_share_one_download() {
        struct SlowDownloader {
            calls: AtomicUsize,
        }
        impl ImageDownloader for SlowDownloader {
            fn download(&self, _id: &ImageId) -> Result<Vec<u8>, FetchError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                thread::sleep(std::time::Duration::from_millis(50));
                Ok(vec![9])
            }
        }

        let cache = Arc::new(RawFileCache::new());
        let downloader = Arc::new(SlowDownloader {
            calls: AtomicUsize::new(0),
        });
        let id = ImageId::from("shared");

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let downloader = downloader.clone();
                let id = id.clone();
                thread::spawn(move || cache.fetch(&id, downloader.as_ref()))
            })
            .collect();
        for handle in handles {
            let bytes = handle.join().unwrap().unwrap();
            assert_eq!(&bytes[..], &[9]);
        }
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn eviction_removes_selected_ids_only() {
        let cache = RawFileCache::new();
        let downloader = CountingDownloader::new(false);
        cache.fetch(&ImageId::from("a"), &downloader).unwrap();
        cache.fetch(&ImageId::from("b"), &downloader).unwrap();
        cache.evict([&ImageId::from("a")]);
        assert!(!cache.contains(&ImageId::from("a")));
        assert!(cache.contains(&ImageId::from("b")));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn evicted_owner_cannot_claim_a_replacement_download() {
        /// First download blocks on its release flag and fails; the second
        /// blocks on its own flag and succeeds with `[42]`.
        struct ScriptedDownloader {
            calls: AtomicUsize,
            started: [AtomicBool; 2],
            release: [AtomicBool; 2],
        }

        impl ImageDownloader for ScriptedDownloader {
            fn download(&self, id: &ImageId) -> Result<Vec<u8>, FetchError> {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                self.started[call].store(true, Ordering::SeqCst);
                while !self.release[call].load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
                if call == 0 {
                    Err(FetchError::Download {
                        id: id.clone(),
                        reason: "first attempt".into(),
                    })
                } else {
                    Ok(vec![42])
                }
            }
        }

        let cache = Arc::new(RawFileCache::new());
        let downloader = Arc::new(ScriptedDownloader {
            calls: AtomicUsize::new(0),
            started: Default::default(),
            release: Default::default(),
        });
        let id = ImageId::from("contested");
        let fetcher = |cache: &Arc<RawFileCache>, downloader: &Arc<ScriptedDownloader>| {
            let cache = cache.clone();
            let downloader = downloader.clone();
            let id = id.clone();
            thread::spawn(move || cache.fetch(&id, downloader.as_ref()))
        };

        // First owner blocks mid-download, then its id is evicted.
        let first = fetcher(&cache, &downloader);
        wait_for(&downloader.started[0]);
        cache.evict([&id]);

        // A later fetch re-creates the entry and a third caller attaches
        // to that fresh download.
        let second = fetcher(&cache, &downloader);
        wait_for(&downloader.started[1]);
        let third = fetcher(&cache, &downloader);
        thread::sleep(Duration::from_millis(50));

        // The evicted owner settles first, against the live entry.
        downloader.release[0].store(true, Ordering::SeqCst);
        assert!(first.join().unwrap().is_err());
        downloader.release[1].store(true, Ordering::SeqCst);

        // Both callers on the replacement download get its bytes, not the
        // evicted owner's failure.
        assert_eq!(&second.join().unwrap().unwrap()[..], &[42]);
        assert_eq!(&third.join().unwrap().unwrap()[..], &[42]);
        // And the slot keeps the replacement's result.
        assert_eq!(&cache.fetch(&id, downloader.as_ref()).unwrap()[..], &[42]);
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 2);
    }

    fn cached(value: f32) -> CachedVolume {
        let volume = Volume::new([1, 1, 1], [1.0; 3], vec![value]).unwrap();
        let range = volume.value_range();
        CachedVolume {
            volume: Arc::new(volume),
            range,
        }
    }

    #[test]
    fn guarded_insert_respects_guard() {
        let cache = VolumeCache::new();
        let id = ImageId::from("v");
        assert!(cache.insert_if(id.clone(), cached(1.0), || true));
        assert!(cache.contains(&id));
        cache.clear();
        assert!(!cache.insert_if(id.clone(), cached(2.0), || false));
        assert!(!cache.contains(&id));
        assert!(cache.is_empty());
    }
}
