//! Bounded LRU cache of chunk-metadata lists.
//!
//! Keyed by `"{file-path}.{device}{measurement}"`. Entry sizes are
//! estimated by sampling the first inserted lists to derive an average
//! per-chunk-metadata byte size; one entry is re-sampled every 100k
//! inserts to adapt. With a zero budget the cache is disabled and every
//! lookup goes to disk, but still consults the file's bloom filter first.

use crate::dts::{ChunkMetadata, DtsReader};
use crate::engine::TsFileResource;
use crate::error::Result;
use lru::LruCache;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Inserts sampled to seed the average entry size.
const SIZE_SAMPLE_COUNT: u64 = 10;

/// Inserts between re-samplings of the average entry size.
const RESAMPLE_INTERVAL: u64 = 100_000;

struct CacheState {
    lru: LruCache<String, Arc<Vec<ChunkMetadata>>>,
    bytes: usize,
    inserts: u64,
    average_chunk_size: usize,
}

impl CacheState {
    fn entry_size(&self, key: &str, value: &[ChunkMetadata]) -> usize {
        key.len() + self.average_chunk_size * value.len()
    }
}

/// LRU cache from `(file, device, measurement)` to chunk-metadata lists.
pub struct ChunkMetadataCache {
    budget: usize,
    state: RwLock<CacheState>,
    requests: AtomicU64,
    hits: AtomicU64,
}

impl ChunkMetadataCache {
    /// Creates a cache with the given byte budget; zero disables caching.
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            state: RwLock::new(CacheState {
                lru: LruCache::unbounded(),
                bytes: 0,
                inserts: 0,
                average_chunk_size: 0,
            }),
            requests: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    /// Whether caching is enabled.
    pub fn is_enabled(&self) -> bool {
        self.budget > 0
    }

    fn key(resource: &TsFileResource, device: &str, measurement: &str) -> String {
        format!("{}.{}{}", resource.path().display(), device, measurement)
    }

    /// Chunk metadata of one series in one sealed file.
    ///
    /// Misses read through the file's metadata index; an absent path
    /// yields an empty list. The file's bloom filter is consulted first
    /// whenever the index would otherwise be touched.
    pub fn get(
        &self,
        resource: &TsFileResource,
        device: &str,
        measurement: &str,
    ) -> Result<Arc<Vec<ChunkMetadata>>> {
        if !self.is_enabled() {
            return load_with_bloom(resource, device, measurement);
        }

        let key = Self::key(resource, device, measurement);
        self.requests.fetch_add(1, Ordering::Relaxed);

        // shared fast path; peek leaves the recency order untouched
        {
            let state = self.state.read();
            if let Some(value) = state.lru.peek(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value.clone());
            }
        }

        // exclusive section: re-check under the write lock, then load
        let mut state = self.state.write();
        if let Some(value) = state.lru.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value.clone());
        }
        let value = load_with_bloom(resource, device, measurement)?;
        self.insert_locked(&mut state, key, value.clone());
        Ok(value)
    }

    fn insert_locked(
        &self,
        state: &mut CacheState,
        key: String,
        value: Arc<Vec<ChunkMetadata>>,
    ) {
        state.inserts += 1;
        let sample_now = state.inserts <= SIZE_SAMPLE_COUNT
            || state.inserts % RESAMPLE_INTERVAL == 0;
        if sample_now {
            if let Some(first) = value.first() {
                let measured = first.approx_heap_size();
                if state.inserts <= SIZE_SAMPLE_COUNT {
                    let n = state.inserts as usize;
                    state.average_chunk_size =
                        (state.average_chunk_size * (n - 1) + measured) / n;
                } else {
                    state.average_chunk_size = measured;
                }
            }
        }

        let size = state.entry_size(&key, &value);
        state.bytes += size;
        state.lru.put(key, value);

        while state.bytes > self.budget {
            match state.lru.pop_lru() {
                Some((evicted_key, evicted)) => {
                    let evicted_size = state.entry_size(&evicted_key, &evicted);
                    state.bytes = state.bytes.saturating_sub(evicted_size);
                }
                None => break,
            }
        }
    }

    /// Drops every entry of one file; called when the file is deleted or
    /// replaced by a merge.
    pub fn remove(&self, resource: &TsFileResource) {
        let prefix = format!("{}.", resource.path().display());
        let mut state = self.state.write();
        let keys: Vec<String> = state
            .lru
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(value) = state.lru.pop(&key) {
                let size = state.entry_size(&key, &value);
                state.bytes = state.bytes.saturating_sub(size);
            }
        }
    }

    /// Drops everything.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.lru.clear();
        state.bytes = 0;
    }

    /// Fraction of lookups served from the cache.
    pub fn hit_ratio(&self) -> f64 {
        let requests = self.requests.load(Ordering::Relaxed);
        if requests == 0 {
            return 0.0;
        }
        self.hits.load(Ordering::Relaxed) as f64 / requests as f64
    }

    /// Current estimated byte usage.
    pub fn bytes(&self) -> usize {
        self.state.read().bytes
    }
}

fn load_with_bloom(
    resource: &TsFileResource,
    device: &str,
    measurement: &str,
) -> Result<Arc<Vec<ChunkMetadata>>> {
    let reader = DtsReader::open(resource.path())?;
    if let Some(bloom) = reader.bloom_filter()? {
        if !bloom.maybe_contains(&format!("{device}.{measurement}")) {
            debug!(
                file = %resource.path().display(),
                "path rejected by bloom filter: {device}.{measurement}"
            );
            return Ok(Arc::new(Vec::new()));
        }
    }
    Ok(Arc::new(reader.chunk_metadata_list(device, measurement)?))
}
