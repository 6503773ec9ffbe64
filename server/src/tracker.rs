//! Change tracking: per-file (mtime, size, hash) metadata used to classify
//! additions, modifications, and deletions without reading file contents.
//!
//! The map persists through the `metadata.db` key-value store, one JSON
//! record per relative path.

use crate::content;
use crate::errors::Result;
use crate::progress::CancellationToken;
use crate::store::{KeyValueStore, StoredValue};
use code_index_core::types::ChangeSet;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileMeta {
    pub mtime_ms: u64,
    pub size: u64,
    pub hash: Option<String>,
    pub last_checked: String,
}

pub fn mtime_ms(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[derive(Default)]
pub struct ChangeTracker {
    files: HashMap<String, FileMeta>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rehydrate the tracker from its persistent store.
    pub fn load(store: &dyn KeyValueStore) -> Self {
        let mut files = HashMap::new();
        match store.items(None) {
            Ok(items) => {
                for (path, value) in items {
                    match serde_json::from_value::<FileMeta>(value.as_json()) {
                        Ok(meta) => {
                            files.insert(path, meta);
                        }
                        Err(e) => {
                            warn!(path = path.as_str(), error = %e, "Dropping unreadable tracker record")
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "Could not load tracker metadata"),
        }
        debug!(files = files.len(), "Loaded change-tracker metadata");
        Self { files }
    }

    /// Write every record back to the store and flush.
    pub fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
        for (path, meta) in &self.files {
            store.put(
                path,
                StoredValue::Json(serde_json::to_value(meta).unwrap_or(json!({}))),
            )?;
        }
        store.flush()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn meta(&self, rel_path: &str) -> Option<&FileMeta> {
        self.files.get(rel_path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.files.keys()
    }

    pub fn insert(&mut self, rel_path: &str, meta: FileMeta) {
        self.files.insert(rel_path.to_string(), meta);
    }

    /// Drop a record; also deletes it from the store when given one.
    pub fn remove(&mut self, rel_path: &str, store: Option<&dyn KeyValueStore>) {
        self.files.remove(rel_path);
        if let Some(store) = store {
            if let Err(e) = store.delete(rel_path) {
                warn!(path = rel_path, error = %e, "Could not delete tracker record");
            }
        }
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }

    /// Stat-only change check: true when the path is unknown or its mtime or
    /// size differs from the stored record. The hash is not recomputed here.
    pub fn has_changed(&self, rel_path: &str, abs_path: &Path) -> bool {
        let Some(stored) = self.files.get(rel_path) else {
            return true;
        };
        match std::fs::metadata(abs_path) {
            Ok(meta) => mtime_ms(&meta) != stored.mtime_ms || meta.len() != stored.size,
            // Assume changed when the stat fails.
            Err(_) => true,
        }
    }

    /// Compute fresh metadata for a file, including its streamed hash.
    pub fn current_meta(abs_path: &Path) -> std::io::Result<FileMeta> {
        let meta = std::fs::metadata(abs_path)?;
        Ok(FileMeta {
            mtime_ms: mtime_ms(&meta),
            size: meta.len(),
            hash: content::compute_hash(abs_path).ok(),
            last_checked: now_rfc3339(),
        })
    }

    /// Partition the current scan against the known map into disjoint
    /// added / modified / deleted sets.
    pub fn classify(&self, base: &Path, current_paths: &[String]) -> ChangeSet {
        let current: HashSet<&str> = current_paths.iter().map(|s| s.as_str()).collect();

        let deleted: Vec<String> = self
            .files
            .keys()
            .filter(|known| !current.contains(known.as_str()))
            .cloned()
            .collect();

        let mut added = Vec::new();
        let mut modified = Vec::new();
        for path in current_paths {
            if !self.files.contains_key(path) {
                added.push(path.clone());
            } else if self.has_changed(path, &base.join(path)) {
                modified.push(path.clone());
            }
        }

        ChangeSet {
            added,
            modified,
            deleted,
        }
    }

    /// Explicit integrity check: rehash the file and compare to the stored
    /// hash.
    pub fn verify_integrity(&self, rel_path: &str, abs_path: &Path) -> bool {
        let Some(stored_hash) = self.files.get(rel_path).and_then(|m| m.hash.as_deref()) else {
            return false;
        };
        match content::compute_hash(abs_path) {
            Ok(current) => current == stored_hash,
            Err(_) => false,
        }
    }

    /// Stat and hash many files on the given worker pool, reporting progress
    /// fractions and honouring cooperative cancellation at file boundaries.
    /// Per-file failures come back as error strings, never a pool abort.
    pub fn collect_meta_parallel(
        pool: &rayon::ThreadPool,
        base: &Path,
        paths: &[String],
        cancel: &CancellationToken,
        progress: Option<&(dyn Fn(f64) + Sync)>,
    ) -> Vec<(String, std::result::Result<FileMeta, String>)> {
        let done = AtomicUsize::new(0);
        let total = paths.len().max(1);
        pool.install(|| {
            paths
                .par_iter()
                .map(|rel| {
                    let result = if cancel.is_cancelled() {
                        Err("cancelled".to_string())
                    } else {
                        Self::current_meta(&base.join(rel)).map_err(|e| e.to_string())
                    };
                    let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Some(cb) = progress {
                        cb(finished as f64 / total as f64);
                    }
                    (rel.clone(), result)
                })
                .collect()
        })
    }

    pub fn stats(&self) -> serde_json::Value {
        let with_hashes = self.files.values().filter(|m| m.hash.is_some()).count();
        let mut checked: Vec<&str> = self
            .files
            .values()
            .map(|m| m.last_checked.as_str())
            .collect();
        checked.sort_unstable();
        json!({
            "total_files": self.files.len(),
            "files_with_hashes": with_hashes,
            "oldest_check": checked.first().copied(),
            "newest_check": checked.last().copied(),
        })
    }
}
