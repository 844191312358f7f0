//! Content-Addressable Cache
//!
//! Avoids re-transforming identical bytes and coalesces concurrent producers targeting the same
//! [`CacheKey`] into a single execution. Backed by an in-memory `quick_cache` LRU
//! in front of a flat directory of `<hex>.bin` / `<hex>.meta` files on disk.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quick_cache::sync::Cache;
use quick_cache::Weighter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::CacheError;
use crate::metrics::Metrics;

/// Default in-memory budget.
const DEFAULT_MEMORY_CAPACITY_BYTES: u64 = 256 * 1024 * 1024;
const DEFAULT_MEMORY_MAX_ENTRIES: usize = 4096;
const DISK_SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
const DISK_ENTRY_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// 32-byte deterministic fingerprint of `method, normalized_url, content_kind, active_flags`.
///
/// SHA-256 rather than BLAKE2b: both are 32-byte deterministic digests and this workspace's
/// stack already carries `sha2`/`hex` for exactly this role elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(pub [u8; 32]);

impl CacheKey {
    pub fn new(method: &str, normalized_url: &str, content_kind: &str, active_flags: u16) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(method.as_bytes());
        hasher.update(b"\0");
        hasher.update(normalized_url.as_bytes());
        hasher.update(b"\0");
        hasher.update(content_kind.as_bytes());
        hasher.update(b"\0");
        hasher.update(active_flags.to_le_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        CacheKey(bytes)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

/// A cached artifact plus enough metadata to serve it without re-deriving headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub content_type: String,
    pub body: Arc<Vec<u8>>,
    pub stored_at_unix: u64,
    pub encoding: Option<String>,
    pub url: String,
}

#[derive(Clone)]
struct BodyWeighter;

impl Weighter<CacheKey, CacheEntry> for BodyWeighter {
    fn weight(&self, _key: &CacheKey, entry: &CacheEntry) -> u64 {
        (entry.body.len() as u64).max(1)
    }
}

/// On-disk sidecar, serialized next to the body as `<hex>.meta`.
#[derive(Debug, Serialize, Deserialize)]
struct DiskMeta {
    url: String,
    content_type: String,
    timestamp: u64,
    encoding: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub memory_entries: u64,
    pub memory_size_bytes: u64,
}

/// Tracks a production in flight so concurrent callers for the same key coalesce onto one
/// `produce_fn` execution.
struct PendingProduction {
    notify: broadcast::Sender<Result<CacheEntry, String>>,
}

pub struct ContentCache {
    memory: Cache<CacheKey, CacheEntry, BodyWeighter>,
    cache_dir: PathBuf,
    enabled: bool,
    pending: Mutex<HashMap<CacheKey, Arc<PendingProduction>>>,
    entries_written: AtomicU64,
    metrics: Arc<Metrics>,
}

impl ContentCache {
    pub fn new(cache_dir: impl Into<PathBuf>, enabled: bool, metrics: Arc<Metrics>) -> Self {
        let memory = Cache::with_weighter(
            DEFAULT_MEMORY_MAX_ENTRIES,
            DEFAULT_MEMORY_CAPACITY_BYTES,
            BodyWeighter,
        );
        Self {
            memory,
            cache_dir: cache_dir.into(),
            enabled,
            pending: Mutex::new(HashMap::new()),
            entries_written: AtomicU64::new(0),
            metrics,
        }
    }

    fn sync_gauges(&self) {
        self.metrics.cache_entries.set(self.memory.len() as f64);
        self.metrics.cache_size_bytes.set(self.memory.weight() as f64);
    }

    /// Fetch `key` from memory, then disk, then produce via `produce_fn` with single-flight
    /// coalescing. If caching is disabled, `produce_fn` runs unconditionally and nothing is
    /// stored.
    pub async fn get_or_produce<F, Fut>(
        &self,
        key: CacheKey,
        produce_fn: F,
    ) -> Result<CacheEntry, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheEntry, CacheError>>,
    {
        if !self.enabled {
            return produce_fn().await;
        }

        if let Some(entry) = self.memory.get(&key) {
            debug!(key = %key.to_hex(), "cache hit (memory)");
            self.metrics.cache_hits_total.inc();
            return Ok(entry);
        }

        if let Some(entry) = self.read_disk(key).await? {
            debug!(key = %key.to_hex(), "cache hit (disk)");
            self.metrics.cache_hits_total.inc();
            self.memory.insert(key, entry.clone());
            self.sync_gauges();
            return Ok(entry);
        }

        self.metrics.cache_misses_total.inc();

        // Either join an in-flight production or become its producer.
        let (is_producer, mut rx) = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            if let Some(existing) = pending.get(&key) {
                (false, existing.notify.subscribe())
            } else {
                let (tx, rx) = broadcast::channel(1);
                pending.insert(key, Arc::new(PendingProduction { notify: tx }));
                (true, rx)
            }
        };

        if !is_producer {
            return match rx.recv().await {
                Ok(Ok(entry)) => Ok(entry),
                Ok(Err(message)) => Err(CacheError::CorruptMetadata(message)),
                Err(_) => Err(CacheError::CorruptMetadata(
                    "producer dropped without completing".to_string(),
                )),
            };
        }

        let result = produce_fn().await;
        let broadcast_result = match &result {
            Ok(entry) => Ok(entry.clone()),
            Err(e) => Err(e.to_string()),
        };

        if let Ok(entry) = &result {
            self.memory.insert(key, entry.clone());
            self.sync_gauges();
            if let Err(e) = self.write_disk(key, entry).await {
                warn!(key = %key.to_hex(), error = %e, "failed to persist cache entry to disk");
            } else {
                self.entries_written.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut pending = self.pending.lock().expect("pending map poisoned");
        if let Some(slot) = pending.remove(&key) {
            let _ = slot.notify.send(broadcast_result);
        }
        drop(pending);

        result
    }

    pub fn invalidate(&self, key: CacheKey) {
        self.memory.remove(&key);
        self.sync_gauges();
        let bin = self.cache_dir.join(format!("{}.bin", key.to_hex()));
        let meta = self.cache_dir.join(format!("{}.meta", key.to_hex()));
        let _ = std::fs::remove_file(bin);
        let _ = std::fs::remove_file(meta);
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.memory.clear();
        self.sync_gauges();
        let dir = std::fs::read_dir(&self.cache_dir).map_err(|source| CacheError::Io {
            path: self.cache_dir.display().to_string(),
            source,
        })?;
        for entry in dir.flatten() {
            let _ = std::fs::remove_file(entry.path());
        }
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_entries: self.memory.len() as u64,
            memory_size_bytes: self.memory.weight(),
        }
    }

    async fn read_disk(&self, key: CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let bin_path = self.cache_dir.join(format!("{}.bin", key.to_hex()));
        let meta_path = self.cache_dir.join(format!("{}.meta", key.to_hex()));

        if !bin_path.exists() || !meta_path.exists() {
            return Ok(None);
        }

        let bin_path_clone = bin_path.clone();
        let meta_path_clone = meta_path.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            let body = std::fs::read(&bin_path_clone).map_err(|source| CacheError::Io {
                path: bin_path_clone.display().to_string(),
                source,
            })?;
            let meta_raw = std::fs::read_to_string(&meta_path_clone).map_err(|source| {
                CacheError::Io {
                    path: meta_path_clone.display().to_string(),
                    source,
                }
            })?;
            let meta: DiskMeta = serde_json::from_str(&meta_raw)
                .map_err(|e| CacheError::CorruptMetadata(e.to_string()))?;
            Ok::<_, CacheError>((body, meta))
        })
        .await
        .map_err(|e| CacheError::CorruptMetadata(e.to_string()))??;

        let (body, meta) = loaded;
        Ok(Some(CacheEntry {
            content_type: meta.content_type,
            body: Arc::new(body),
            stored_at_unix: meta.timestamp,
            encoding: meta.encoding,
            url: meta.url,
        }))
    }

    async fn write_disk(&self, key: CacheKey, entry: &CacheEntry) -> Result<(), CacheError> {
        std::fs::create_dir_all(&self.cache_dir).map_err(|source| CacheError::Io {
            path: self.cache_dir.display().to_string(),
            source,
        })?;

        let hex_key = key.to_hex();
        let bin_path = self.cache_dir.join(format!("{hex_key}.bin"));
        let meta_path = self.cache_dir.join(format!("{hex_key}.meta"));
        let bin_tmp = self.cache_dir.join(format!("{hex_key}.bin.tmp"));
        let meta_tmp = self.cache_dir.join(format!("{hex_key}.meta.tmp"));

        let meta = DiskMeta {
            url: entry.url.clone(),
            content_type: entry.content_type.clone(),
            timestamp: entry.stored_at_unix,
            encoding: entry.encoding.clone(),
        };
        let meta_json =
            serde_json::to_vec(&meta).map_err(|e| CacheError::CorruptMetadata(e.to_string()))?;
        let body = entry.body.clone();

        tokio::task::spawn_blocking(move || {
            std::fs::write(&bin_tmp, body.as_slice()).map_err(|source| CacheError::Io {
                path: bin_tmp.display().to_string(),
                source,
            })?;
            std::fs::rename(&bin_tmp, &bin_path).map_err(|source| CacheError::Io {
                path: bin_path.display().to_string(),
                source,
            })?;

            std::fs::write(&meta_tmp, &meta_json).map_err(|source| CacheError::Io {
                path: meta_tmp.display().to_string(),
                source,
            })?;
            std::fs::rename(&meta_tmp, &meta_path).map_err(|source| CacheError::Io {
                path: meta_path.display().to_string(),
                source,
            })?;
            Ok::<_, CacheError>(())
        })
        .await
        .map_err(|e| CacheError::CorruptMetadata(e.to_string()))??;

        Ok(())
    }

    /// Sweep disk entries older than [`DISK_ENTRY_MAX_AGE`]. Intended to run on a
    /// `tokio::time::interval` background task started at process startup.
    pub async fn sweep_expired(&self) {
        let cache_dir = self.cache_dir.clone();
        let removed = tokio::task::spawn_blocking(move || sweep_dir(&cache_dir))
            .await
            .unwrap_or(0);
        if removed > 0 {
            info!(removed, "swept expired cache entries from disk");
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DISK_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                cache.sweep_expired().await;
            }
        });
    }
}

fn sweep_dir(cache_dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(cache_dir) else {
        return 0;
    };
    let now = match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => d,
        Err(_) => return 0,
    };
    let mut removed = 0u64;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("meta") {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let Ok(age) = now.checked_sub(
            modified
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default(),
        ) else {
            continue;
        };
        if age > DISK_ENTRY_MAX_AGE {
            let bin = path.with_extension("bin");
            if std::fs::remove_file(&bin).is_ok() {
                removed += 1;
            }
            let _ = std::fs::remove_file(&path);
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tempfile::tempdir;

    fn entry(body: &str) -> CacheEntry {
        CacheEntry {
            content_type: "text/plain".to_string(),
            body: Arc::new(body.as_bytes().to_vec()),
            stored_at_unix: 1_700_000_000,
            encoding: None,
            url: "http://example.com/".to_string(),
        }
    }

    #[test]
    fn cache_key_is_deterministic_and_sensitive_to_each_component() {
        let a = CacheKey::new("GET", "http://example.com/", "html", 0);
        let b = CacheKey::new("GET", "http://example.com/", "html", 0);
        assert_eq!(a.0, b.0);

        let c = CacheKey::new("GET", "http://example.com/", "js", 0);
        assert_ne!(a.0, c.0);

        let d = CacheKey::new("GET", "http://example.com/", "html", 1);
        assert_ne!(a.0, d.0);
    }

    #[tokio::test]
    async fn disabled_cache_always_calls_producer_and_stores_nothing() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::new(dir.path(), false, Arc::new(Metrics::new().unwrap()));
        let key = CacheKey::new("GET", "http://example.com/", "html", 0);
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let result = cache
                .get_or_produce(key, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(entry("hello"))
                })
                .await
                .unwrap();
            assert_eq!(result.body.as_slice(), b"hello");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.stats().memory_entries, 0);
    }

    #[tokio::test]
    async fn enabled_cache_hits_memory_on_second_call() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::new(dir.path(), true, Arc::new(Metrics::new().unwrap()));
        let key = CacheKey::new("GET", "http://example.com/", "html", 0);
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            cache
                .get_or_produce(key, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(entry("hello"))
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn enabled_cache_persists_to_disk_and_survives_memory_eviction() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::new(dir.path(), true, Arc::new(Metrics::new().unwrap()));
        let key = CacheKey::new("GET", "http://example.com/", "html", 0);

        cache
            .get_or_produce(key, || async { Ok(entry("hello")) })
            .await
            .unwrap();

        cache.memory.remove(&key);
        assert!(cache.memory.get(&key).is_none());

        let result = cache
            .get_or_produce(key, || async {
                panic!("should not reproduce: disk copy must satisfy the request")
            })
            .await
            .unwrap();
        assert_eq!(result.body.as_slice(), b"hello");
    }

    #[tokio::test]
    async fn invalidate_removes_memory_and_disk_copies() {
        let dir = tempdir().unwrap();
        let cache = ContentCache::new(dir.path(), true, Arc::new(Metrics::new().unwrap()));
        let key = CacheKey::new("GET", "http://example.com/", "html", 0);

        cache
            .get_or_produce(key, || async { Ok(entry("hello")) })
            .await
            .unwrap();
        cache.invalidate(key);

        assert!(cache.memory.get(&key).is_none());
        assert!(!dir.path().join(format!("{}.bin", key.to_hex())).exists());
    }

    #[tokio::test]
    async fn concurrent_producers_for_the_same_key_coalesce() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(ContentCache::new(dir.path(), true, Arc::new(Metrics::new().unwrap())));
        let key = CacheKey::new("GET", "http://example.com/", "html", 0);
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_produce(key, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(entry("coalesced"))
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap();
            assert_eq!(result.body.as_slice(), b"coalesced");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
