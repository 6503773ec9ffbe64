//! Capacity- and TTL-bounded LRU cache with statistics, a background
//! maintenance task, and an optional disk-backed variant that snapshots
//! atomically and compacts tombstones.
//!
//! Recency and O(1) eviction come from [`lru::LruCache`]; this module layers
//! expiry, counters, and persistence on top.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Entries and statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: u64,
    pub expires_at: u64,
    pub access_count: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub cleanups: u64,
    pub expired_entries: u64,
}

/// Point-in-time view of the cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsView {
    pub size: usize,
    pub capacity: usize,
    pub hit_rate: f64,
    pub total_requests: u64,
    #[serde(flatten)]
    pub counters: CacheStats,
}

// ---------------------------------------------------------------------------
// In-memory TTL-LRU cache
// ---------------------------------------------------------------------------

struct Inner<V> {
    map: lru::LruCache<String, CacheEntry<V>>,
    stats: CacheStats,
}

/// Thread-safe LRU cache with per-entry TTL. All operations are serialised
/// by one mutex held for the duration of the critical section.
pub struct LruTtlCache<V> {
    inner: Mutex<Inner<V>>,
    capacity: usize,
    default_ttl: Duration,
}

impl<V: Clone> LruTtlCache<V> {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                map: lru::LruCache::new(NonZeroUsize::new(capacity).unwrap()),
                stats: CacheStats::default(),
            }),
            capacity,
            default_ttl,
        }
    }

    /// Look up a key, promoting it to most-recently-used. Expired entries are
    /// evicted and reported as misses.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = now_secs();
        let mut inner = self.inner.lock().unwrap();
        let expired = match inner.map.peek(key) {
            None => {
                inner.stats.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            inner.map.pop(key);
            inner.stats.misses += 1;
            inner.stats.expired_entries += 1;
            return None;
        }
        let entry = inner.map.get_mut(key).unwrap();
        entry.access_count += 1;
        let value = entry.value.clone();
        inner.stats.hits += 1;
        Some(value)
    }

    /// Insert or update. On insertion past capacity the least-recently-used
    /// entry is evicted.
    pub fn put(&self, key: &str, value: V, ttl: Option<Duration>) {
        let now = now_secs();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let entry = CacheEntry {
            value,
            created_at: now,
            expires_at: now + ttl.as_secs(),
            access_count: 1,
        };
        let mut inner = self.inner.lock().unwrap();
        if let Some((evicted_key, _)) = inner.map.push(key.to_string(), entry) {
            if evicted_key != key {
                inner.stats.evictions += 1;
            }
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().unwrap().map.pop(key).is_some()
    }

    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.map.len();
        inner.map.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().unwrap().map.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn entries(&self) -> Vec<(String, V)> {
        self.inner
            .lock()
            .unwrap()
            .map
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = now_secs();
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.map.pop(key);
        }
        inner.stats.expired_entries += expired.len() as u64;
        inner.stats.cleanups += 1;
        expired.len()
    }

    pub fn stats(&self) -> CacheStatsView {
        let inner = self.inner.lock().unwrap();
        let total = inner.stats.hits + inner.stats.misses;
        CacheStatsView {
            size: inner.map.len(),
            capacity: self.capacity,
            hit_rate: if total > 0 {
                inner.stats.hits as f64 / total as f64
            } else {
                0.0
            },
            total_requests: total,
            counters: inner.stats.clone(),
        }
    }

    // Snapshot in recency order, most-recently-used first.
    fn snapshot_entries(&self) -> Vec<(String, CacheEntry<V>)> {
        self.inner
            .lock()
            .unwrap()
            .map
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Background maintenance
// ---------------------------------------------------------------------------

/// Handle for a periodic maintenance thread; dropping it stops the thread.
pub struct MaintenanceHandle {
    shutdown: mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Spawn a loop that invokes `tick` every `interval` until the handle is
    /// dropped.
    pub fn spawn(interval: Duration, tick: impl Fn() + Send + 'static) -> Self {
        let (shutdown, rx) = mpsc::channel::<()>();
        let thread = std::thread::spawn(move || loop {
            match rx.recv_timeout(interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => tick(),
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        });
        Self {
            shutdown,
            thread: Some(thread),
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Disk-backed variant
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct Snapshot<V> {
    entries: Vec<(String, CacheEntry<V>)>,
    tombstones: Vec<String>,
}

struct PersistState {
    write_count: u64,
    tombstones: BTreeSet<String>,
    compactions: u64,
}

/// LRU cache whose contents survive restarts through an atomically-replaced
/// snapshot file. Deletions leave tombstones in the snapshot so a stale
/// reload cannot resurrect them; once the write counter crosses
/// `compact_threshold` the snapshot is rewritten without tombstones.
pub struct PersistentCache<V> {
    cache: LruTtlCache<V>,
    path: PathBuf,
    state: Mutex<PersistState>,
    compact_threshold: u64,
}

impl<V: Clone + Serialize + DeserializeOwned> PersistentCache<V> {
    pub fn new(path: &Path, capacity: usize, default_ttl: Duration, compact_threshold: u64) -> Self {
        let cache = LruTtlCache::new(capacity, default_ttl);
        let me = Self {
            cache,
            path: path.to_path_buf(),
            state: Mutex::new(PersistState {
                write_count: 0,
                tombstones: BTreeSet::new(),
                compactions: 0,
            }),
            compact_threshold: compact_threshold.max(1),
        };
        me.load();
        me
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.cache.get(key)
    }

    pub fn put(&self, key: &str, value: V, ttl: Option<Duration>) {
        self.cache.put(key, value, ttl);
        let mut state = self.state.lock().unwrap();
        state.tombstones.remove(key);
        state.write_count += 1;
    }

    pub fn remove(&self, key: &str) -> bool {
        let removed = self.cache.remove(key);
        if removed {
            let mut state = self.state.lock().unwrap();
            state.tombstones.insert(key.to_string());
            state.write_count += 1;
        }
        removed
    }

    pub fn clear(&self) -> usize {
        let count = self.cache.clear();
        let mut state = self.state.lock().unwrap();
        state.tombstones.clear();
        state.write_count += 1;
        count
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn entries(&self) -> Vec<(String, V)> {
        self.cache.entries()
    }

    pub fn stats(&self) -> CacheStatsView {
        self.cache.stats()
    }

    pub fn sweep_expired(&self) -> usize {
        self.cache.sweep_expired()
    }

    pub fn compactions(&self) -> u64 {
        self.state.lock().unwrap().compactions
    }

    /// Write the full snapshot to `<path>.tmp`, then rename over the live
    /// file. Compacts (drops tombstones) when the write counter crosses the
    /// threshold.
    pub fn save(&self) {
        let entries = self.cache.snapshot_entries();
        let tombstones: Vec<String> = {
            let mut state = self.state.lock().unwrap();
            if state.write_count >= self.compact_threshold {
                state.tombstones.clear();
                state.write_count = 0;
                state.compactions += 1;
                debug!(path = %self.path.display(), "Compacted cache persistence file");
            }
            state.tombstones.iter().cloned().collect()
        };
        let snapshot = Snapshot { entries, tombstones };
        let json = match serde_json::to_vec(&snapshot) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "Could not serialize cache snapshot");
                return;
            }
        };
        let tmp = self.path.with_extension("tmp");
        if let Err(e) = fs::write(&tmp, &json).and_then(|_| fs::rename(&tmp, &self.path)) {
            warn!(path = %self.path.display(), error = %e, "Could not persist cache snapshot");
        }
    }

    /// One maintenance pass: sweep expired entries, then persist.
    pub fn maintain(&self) {
        self.cache.sweep_expired();
        self.save();
    }

    // A partially-written `.tmp` file is never read; only the renamed
    // snapshot counts.
    fn load(&self) {
        let Ok(bytes) = fs::read(&self.path) else {
            return;
        };
        let snapshot: Snapshot<V> = match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unreadable cache snapshot");
                return;
            }
        };
        let now = now_secs();
        let mut state = self.state.lock().unwrap();
        state.tombstones = snapshot.tombstones.into_iter().collect();
        // Entries are stored most-recent first; insert oldest first so the
        // recency order survives the reload.
        let mut inner = self.cache.inner.lock().unwrap();
        for (key, entry) in snapshot.entries.into_iter().rev() {
            if entry.is_expired(now) || state.tombstones.contains(&key) {
                continue;
            }
            inner.map.push(key, entry);
        }
    }
}

/// Spawn the standard maintenance loop for a shared persistent cache.
pub fn spawn_cache_maintenance<V>(
    cache: Arc<PersistentCache<V>>,
    interval: Duration,
) -> MaintenanceHandle
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    MaintenanceHandle::spawn(interval, move || cache.maintain())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_bound_and_lru_eviction() {
        let cache: LruTtlCache<i32> = LruTtlCache::new(3, Duration::from_secs(60));
        cache.put("a", 1, None);
        cache.put("b", 2, None);
        cache.put("c", 3, None);
        // touch "a" so "b" becomes least recently used
        assert_eq!(cache.get("a"), Some(1));
        cache.put("d", 4, None);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.stats().counters.evictions, 1);
    }

    #[test]
    fn test_update_does_not_count_as_eviction() {
        let cache: LruTtlCache<i32> = LruTtlCache::new(2, Duration::from_secs(60));
        cache.put("a", 1, None);
        cache.put("a", 2, None);
        assert_eq!(cache.get("a"), Some(2));
        assert_eq!(cache.stats().counters.evictions, 0);
    }

    #[test]
    fn test_ttl_expiry_counts_as_miss() {
        let cache: LruTtlCache<i32> = LruTtlCache::new(8, Duration::from_secs(60));
        cache.put("gone", 1, Some(Duration::from_secs(0)));
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(cache.get("gone"), None);
        let stats = cache.stats();
        assert_eq!(stats.counters.expired_entries, 1);
        assert_eq!(stats.counters.misses, 1);
    }

    #[test]
    fn test_sweep_expired() {
        let cache: LruTtlCache<i32> = LruTtlCache::new(8, Duration::from_secs(60));
        cache.put("short", 1, Some(Duration::from_secs(0)));
        cache.put("long", 2, None);
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("long"), Some(2));
    }

    #[test]
    fn test_hit_rate() {
        let cache: LruTtlCache<i32> = LruTtlCache::new(8, Duration::from_secs(60));
        cache.put("x", 1, None);
        cache.get("x");
        cache.get("x");
        cache.get("missing");
        let stats = cache.stats();
        assert_eq!(stats.total_requests, 3);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_persistent_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cache.json");
        {
            let cache: PersistentCache<String> =
                PersistentCache::new(&path, 10, Duration::from_secs(60), 100);
            cache.put("k1", "v1".to_string(), None);
            cache.put("k2", "v2".to_string(), None);
            cache.remove("k2");
            cache.save();
        }
        let reloaded: PersistentCache<String> =
            PersistentCache::new(&path, 10, Duration::from_secs(60), 100);
        assert_eq!(reloaded.get("k1"), Some("v1".to_string()));
        // tombstoned key must not resurrect
        assert_eq!(reloaded.get("k2"), None);
    }

    #[test]
    fn test_persistent_compaction_drops_tombstones() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cache.json");
        let cache: PersistentCache<i32> =
            PersistentCache::new(&path, 10, Duration::from_secs(60), 3);
        cache.put("a", 1, None);
        cache.remove("a");
        cache.put("b", 2, None);
        cache.save();
        assert_eq!(cache.compactions(), 1);
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("\"a\""));
    }

    #[test]
    fn test_maintenance_handle_runs_and_stops() {
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let c = Arc::clone(&counter);
        let handle = MaintenanceHandle::spawn(Duration::from_millis(10), move || {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(80));
        drop(handle);
        assert!(counter.load(std::sync::atomic::Ordering::SeqCst) >= 2);
    }
}
