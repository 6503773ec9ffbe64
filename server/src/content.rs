//! Lazy file content: deferred loading with chunked reads for large files,
//! scoped memory-mapped access, streaming SHA-256, and a weak-referenced
//! registry that bounds how many contents stay loaded at once.

use dashmap::DashMap;
use memmap2::Mmap;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Files at or above this size are read in chunks instead of one shot.
pub const LARGE_FILE_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Chunk size shared by streaming reads and streaming hashing, so allocator
/// patterns stay aligned between the two.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Streaming primitives
// ---------------------------------------------------------------------------

/// Read a file through fixed-size chunks, recovering decode errors lazily via
/// lossy UTF-8 replacement.
pub fn read_chunked(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut bytes = Vec::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        bytes.extend_from_slice(&buf[..n]);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Stream a file through SHA-256 in fixed-size chunks, never loading the
/// whole file.
pub fn compute_hash(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of an in-memory string, for version records.
pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Scoped memory-mapped reader
// ---------------------------------------------------------------------------

/// Memory-mapped read-only view of a file. The mapping is released when the
/// value drops, so callers get scoped acquisition for free.
pub struct MappedFile {
    map: Mmap,
}

impl MappedFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = fs::File::open(path)?;
        // Safety: the mapping is read-only and private to this process; a
        // concurrent truncation of the underlying file is the usual mmap
        // caveat and acceptable for index reads.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self { map })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Byte offsets of up to `max_results` occurrences of `needle`.
    pub fn search_pattern(&self, needle: &[u8], max_results: usize) -> Vec<usize> {
        if needle.is_empty() {
            return Vec::new();
        }
        memchr::memmem::find_iter(&self.map, needle)
            .take(max_results)
            .collect()
    }

    /// 1-based line number and line content at a byte offset.
    pub fn line_at(&self, byte_pos: usize) -> (usize, String) {
        let pos = byte_pos.min(self.map.len());
        let line_number = memchr::memchr_iter(b'\n', &self.map[..pos]).count() + 1;
        let start = memchr::memrchr(b'\n', &self.map[..pos]).map(|i| i + 1).unwrap_or(0);
        let end = memchr::memchr(b'\n', &self.map[start..])
            .map(|i| start + i)
            .unwrap_or(self.map.len());
        let line = String::from_utf8_lossy(&self.map[start..end]).into_owned();
        (line_number, line)
    }
}

// ---------------------------------------------------------------------------
// Lazy holders
// ---------------------------------------------------------------------------

/// Deferred content holder for one file. Carries its registry key rather
/// than a manager pointer; the manager reaches holders through the registry.
pub struct LazyFileContent {
    rel_path: String,
    abs_path: PathBuf,
    size: u64,
    content: Mutex<Option<Arc<str>>>,
    last_access_ms: AtomicU64,
}

impl LazyFileContent {
    fn new(rel_path: String, abs_path: PathBuf, size: u64) -> Self {
        Self {
            rel_path,
            abs_path,
            size,
            content: Mutex::new(None),
            last_access_ms: AtomicU64::new(0),
        }
    }

    pub fn rel_path(&self) -> &str {
        &self.rel_path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_loaded(&self) -> bool {
        self.content.lock().unwrap().is_some()
    }

    pub fn unload(&self) {
        *self.content.lock().unwrap() = None;
    }

    fn touch(&self) {
        self.last_access_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn last_access(&self) -> u64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }

    // First access loads; large files go through the chunked path.
    fn load(&self) -> io::Result<Arc<str>> {
        self.touch();
        let mut guard = self.content.lock().unwrap();
        if let Some(content) = guard.as_ref() {
            return Ok(Arc::clone(content));
        }
        let text = if self.size >= LARGE_FILE_THRESHOLD {
            debug!(path = self.rel_path.as_str(), size = self.size, "Chunked load");
            read_chunked(&self.abs_path)?
        } else {
            let bytes = fs::read(&self.abs_path)?;
            String::from_utf8_lossy(&bytes).into_owned()
        };
        let content: Arc<str> = Arc::from(text);
        *guard = Some(Arc::clone(&content));
        Ok(content)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registry of lazy holders keyed by project-relative path. Holds weak
/// references so clients control holder lifetime; enforces a cap on how many
/// holders keep content loaded.
pub struct LazyContentManager {
    root: PathBuf,
    registry: DashMap<String, Weak<LazyFileContent>>,
    max_loaded: usize,
}

impl LazyContentManager {
    pub fn new(root: &Path, max_loaded: usize) -> Self {
        Self {
            root: root.to_path_buf(),
            registry: DashMap::new(),
            max_loaded: max_loaded.max(1),
        }
    }

    /// Fetch or create the holder for a path without loading its content.
    pub fn handle(&self, rel_path: &str) -> io::Result<Arc<LazyFileContent>> {
        if let Some(existing) = self.registry.get(rel_path).and_then(|w| w.upgrade()) {
            return Ok(existing);
        }
        let abs = self.root.join(rel_path);
        let size = fs::metadata(&abs)?.len();
        let holder = Arc::new(LazyFileContent::new(rel_path.to_string(), abs, size));
        self.registry
            .insert(rel_path.to_string(), Arc::downgrade(&holder));
        Ok(holder)
    }

    /// Load (or return cached) content for a path, then enforce the loaded
    /// cap over the whole registry.
    pub fn content(&self, rel_path: &str) -> io::Result<Arc<str>> {
        let holder = self.handle(rel_path)?;
        let content = holder.load()?;
        self.enforce_loaded_limit();
        Ok(content)
    }

    /// Unload content from least-recently-accessed holders until the loaded
    /// count fits the cap. Holders stay registered; only bytes are dropped.
    pub fn enforce_loaded_limit(&self) {
        let mut loaded = self.loaded_holders();
        if loaded.len() <= self.max_loaded {
            return;
        }
        loaded.sort_by_key(|h| h.last_access());
        let excess = loaded.len() - self.max_loaded;
        for holder in loaded.into_iter().take(excess) {
            debug!(path = holder.rel_path(), "Unloading least-recently-accessed content");
            holder.unload();
        }
    }

    /// Unload the older half of loaded contents (memory-pressure cleanup).
    pub fn halve_loaded(&self) {
        let mut loaded = self.loaded_holders();
        if loaded.is_empty() {
            return;
        }
        loaded.sort_by_key(|h| h.last_access());
        let drop_count = loaded.len().div_ceil(2);
        for holder in loaded.into_iter().take(drop_count) {
            holder.unload();
        }
    }

    pub fn unload_all(&self) {
        for entry in self.registry.iter() {
            if let Some(holder) = entry.value().upgrade() {
                holder.unload();
            }
        }
    }

    fn loaded_holders(&self) -> Vec<Arc<LazyFileContent>> {
        // Prune dead weak entries on the way through.
        self.registry.retain(|_, w| w.strong_count() > 0);
        self.registry
            .iter()
            .filter_map(|e| e.value().upgrade())
            .filter(|h| h.is_loaded())
            .collect()
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded_holders().len()
    }

    pub fn registered_count(&self) -> usize {
        self.registry.retain(|_, w| w.strong_count() > 0);
        self.registry.len()
    }

    pub fn stats(&self) -> serde_json::Value {
        json!({
            "registered_files": self.registered_count(),
            "loaded_files": self.loaded_count(),
            "max_loaded_files": self.max_loaded,
        })
    }
}
