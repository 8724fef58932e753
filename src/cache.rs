use crate::fetch::{ArtifactMetadata, MetadataFetcher};
use crate::InventoryError;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: usize,
    pub misses: usize,
}

#[derive(Debug, Default)]
pub struct PrefetchReport {
    pub fetched: usize,
    pub already_cached: usize,
    pub failed: BTreeMap<String, String>,
}

/// Path -> metadata memo that survives across runs.
///
/// Loaded once by [`MetadataCache::open`], written back once by
/// [`MetadataCache::close`]. Dropping an unclosed cache flushes it as well, so an
/// early return still persists whatever was fetched.
pub struct MetadataCache {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, ArtifactMetadata>>,
    in_flight: Mutex<FxHashMap<String, Arc<Mutex<()>>>>,
    flushed: AtomicBool,
    /// Set by `insert`; a clean cache is never rewritten.
    dirty: AtomicBool,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl MetadataCache {
    /// Absent or malformed cache files yield an empty cache.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(text) => match serde_yaml::from_str::<Option<BTreeMap<String, ArtifactMetadata>>>(&text) {
                Ok(entries) => entries.unwrap_or_default(),
                Err(e) => {
                    warn!("[cache] Ignoring malformed cache {}: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!("[cache] Could not read cache {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };
        info!("[cache] Loaded {} entries from {}", entries.len(), path.display());
        Self {
            path,
            entries: RwLock::new(entries),
            in_flight: Mutex::new(FxHashMap::default()),
            flushed: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Opens the cache, runs `f`, and closes the cache whether or not `f` failed.
    pub fn scoped<T, E, F>(path: impl Into<PathBuf>, f: F) -> Result<T, E>
    where
        E: From<InventoryError>,
        F: FnOnce(&MetadataCache) -> Result<T, E>,
    {
        let cache = Self::open(path);
        let result = f(&cache);
        match (result, cache.close()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(flush_err)) => Err(E::from(flush_err)),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(flush_err)) => {
                warn!("[cache] Flush after failed run also failed: {}", flush_err);
                Err(e)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, path: &str) -> Option<ArtifactMetadata> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(path)
    }

    pub fn insert(&self, path: &str, metadata: ArtifactMetadata) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), metadata);
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Cached metadata for `path`, fetching and storing it on a miss.
    ///
    /// Concurrent callers asking for the same path wait on one fetch.
    pub fn get_or_fetch(&self, path: &str, fetcher: &dyn MetadataFetcher) -> Result<ArtifactMetadata, InventoryError> {
        if let Some(hit) = self.get(path) {
            debug!("[cache] HIT {}", path);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }

        let slot = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(in_flight.entry(path.to_string()).or_default())
        };
        let _guard = slot.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(hit) = self.get(path) {
            debug!("[cache] HIT {} (fetched concurrently)", path);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }

        debug!("[cache] MISS {}", path);
        self.misses.fetch_add(1, Ordering::Relaxed);
        let fetched = fetcher.fetch_metadata(path);
        if let Ok(metadata) = &fetched {
            self.insert(path, metadata.clone());
        }
        self.release_slot(path, &slot);
        fetched
    }

    /// Drops the in-flight slot for `path` unless a newer one replaced it.
    fn release_slot(&self, path: &str, slot: &Arc<Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if in_flight.get(path).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            in_flight.remove(path);
        }
    }

    /// Warms the cache for `paths` on a bounded pool of `workers` threads.
    ///
    /// Failures are collected, not propagated; a later `get_or_fetch` for a
    /// failed path tries again and surfaces the error.
    pub fn prefetch<I>(&self, paths: I, fetcher: &dyn MetadataFetcher, workers: usize) -> PrefetchReport
    where
        I: IntoIterator<Item = String>,
    {
        let unique: BTreeSet<String> = paths.into_iter().collect();
        let mut report = PrefetchReport::default();
        let pending: Vec<String> = unique
            .into_iter()
            .filter(|p| {
                let cached = self.contains(p);
                if cached {
                    report.already_cached += 1;
                }
                !cached
            })
            .collect();
        if pending.is_empty() {
            return report;
        }

        let workers = workers.clamp(1, pending.len());
        info!("[cache] Prefetching {} paths with {} workers", pending.len(), workers);
        let (job_tx, job_rx) = crossbeam_channel::bounded::<String>(workers * 2);
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<(String, Result<(), String>)>();

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                scope.spawn(move || {
                    for path in job_rx.iter() {
                        let outcome = self
                            .get_or_fetch(&path, fetcher)
                            .map(|_| ())
                            .map_err(|e| e.to_string());
                        if done_tx.send((path, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(job_rx);
            drop(done_tx);
            for path in pending {
                if job_tx.send(path).is_err() {
                    break;
                }
            }
            drop(job_tx);
        });

        for (path, outcome) in done_rx.try_iter() {
            match outcome {
                Ok(()) => report.fetched += 1,
                Err(e) => {
                    warn!("[cache] Prefetch failed for {}: {}", path, e);
                    report.failed.insert(path, e);
                }
            }
        }
        report
    }

    /// Writes every entry to disk if anything was inserted. Later calls are no-ops.
    pub fn flush(&self) -> Result<(), InventoryError> {
        if self.flushed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.dirty.load(Ordering::SeqCst) {
            debug!("[cache] Nothing new, leaving {} untouched", self.path.display());
            return Ok(());
        }
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let text = serde_yaml::to_string(&*entries)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        info!("[cache] Wrote {} entries to {}", entries.len(), self.path.display());
        Ok(())
    }

    pub fn close(self) -> Result<(), InventoryError> {
        self.flush()
    }
}

impl Drop for MetadataCache {
    fn drop(&mut self) {
        if !self.flushed.load(Ordering::SeqCst) {
            if let Err(e) = self.flush() {
                warn!("[cache] Failed to write cache {}: {}", self.path.display(), e);
            }
        }
    }
}
