//! The refresh pipeline: filtered walk, change classification, chunked
//! parallel processing, pruning, and atomic persistence.
//!
//! Per-file errors are collected per chunk and never abort a refresh; a
//! persistence fault aborts with `RefreshFailed` while the previously
//! persisted state stays intact behind the rename-only write.

use crate::config::IndexConfig;
use crate::errors::{Result, ServerError};
use crate::progress::ProgressTracker;
use crate::settings::{write_atomic, ProjectSettings};
use crate::store::KeyValueStore;
use crate::tracker::{mtime_ms, ChangeTracker, FileMeta};
use code_index_core::filter::FilterPolicy;
use code_index_core::ignore::IgnoreMatcher;
use code_index_core::trie::PathTrie;
use code_index_core::types::{extension_of, ChangeSet, FileKind, FileRecord};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Shared index state: the trie and the change tracker move together under
/// one writer lock. Refresh takes the writer; queries take readers.
#[derive(Default)]
pub struct IndexState {
    pub trie: PathTrie,
    pub tracker: ChangeTracker,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub files: usize,
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub elapsed_ms: u64,
    pub errors: Vec<String>,
}

pub struct Indexer {
    root: PathBuf,
    ignore: IgnoreMatcher,
    filter: FilterPolicy,
    supported_extensions: HashSet<String>,
    chunk_size: usize,
    pool: rayon::ThreadPool,
}

impl Indexer {
    pub fn new(root: &Path, config: &IndexConfig) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.performance.max_workers.max(1))
            .thread_name(|i| format!("index-worker-{i}"))
            .build()
            .map_err(|e| ServerError::Config(format!("worker pool: {e}")))?;
        Ok(Self {
            root: root.to_path_buf(),
            ignore: IgnoreMatcher::new(root),
            filter: FilterPolicy::new(config.filter_config()),
            supported_extensions: config
                .file_filtering
                .supported_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            chunk_size: config.performance.chunk_size.max(1),
            pool,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ignore_matcher(&self) -> &IgnoreMatcher {
        &self.ignore
    }

    // -----------------------------------------------------------------------
    // Walk
    // -----------------------------------------------------------------------

    /// Depth-first filtered walk producing the surviving relative paths.
    pub fn collect_files(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.walk_dir(&self.root, "", &mut out);
        out.sort();
        out
    }

    fn walk_dir(&self, abs_dir: &Path, rel_dir: &str, out: &mut Vec<String>) {
        let entries = match fs::read_dir(abs_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %abs_dir.display(), error = %e, "Could not read directory");
                return;
            }
        };

        let mut files: Vec<(String, u64)> = Vec::new();
        let mut dirs: Vec<String> = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                dirs.push(name);
            } else if file_type.is_file() {
                // Hidden-file rule: names starting with '.' are skipped.
                if name.starts_with('.') {
                    continue;
                }
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                files.push((name, size));
            }
        }

        // The directory itself is judged before any of its entries survive.
        if !self.filter.allows_directory(rel_dir, files.len(), dirs.len()) {
            return;
        }

        for (name, size) in files {
            let rel = join_rel(rel_dir, &name);
            if self.ignore.should_ignore(&rel) {
                continue;
            }
            if !self.supported_extensions.is_empty()
                && !self.supported_extensions.contains(&extension_of(&rel))
            {
                continue;
            }
            if !self.filter.allows_file(&rel, size) {
                continue;
            }
            out.push(rel);
        }

        for name in dirs {
            let rel = join_rel(rel_dir, &name);
            // Entries inside an ignored directory are never re-evaluated.
            if self.ignore.should_ignore_directory(&rel) {
                continue;
            }
            self.walk_dir(&abs_dir.join(&name), &rel, out);
        }
    }

    // -----------------------------------------------------------------------
    // Per-file processing
    // -----------------------------------------------------------------------

    fn process_file(&self, rel: &str) -> std::result::Result<FileRecord, String> {
        let abs = self.root.join(rel);
        let meta = fs::metadata(&abs).map_err(|e| format!("{rel}: {e}"))?;
        let hash = crate::content::compute_hash(&abs).ok();
        Ok(FileRecord {
            path: rel.to_string(),
            kind: FileKind::File,
            extension: extension_of(rel),
            mtime_ms: mtime_ms(&meta),
            size: meta.len(),
            hash,
            last_checked: chrono::Utc::now().to_rfc3339(),
        })
    }

    // -----------------------------------------------------------------------
    // Refresh
    // -----------------------------------------------------------------------

    /// Run the full refresh pipeline. The caller holds the per-project
    /// refresh mutex; `force` treats every surviving file as added.
    pub fn refresh(
        &self,
        index: &Arc<RwLock<IndexState>>,
        meta_store: &dyn KeyValueStore,
        settings: &ProjectSettings,
        progress: &Arc<ProgressTracker>,
        force: bool,
    ) -> Result<RefreshOutcome> {
        let started = Instant::now();
        let token = progress.token();
        progress.start();

        // Walk.
        progress.set_stage("walk");
        let current_paths = self.collect_files();
        token.check()?;

        // Classify.
        progress.set_stage("classify");
        let changes = if force {
            let state = index.read().unwrap();
            let mut deleted: Vec<String> = state
                .tracker
                .paths()
                .filter(|p| !current_paths.contains(*p))
                .cloned()
                .collect();
            deleted.sort();
            ChangeSet {
                added: current_paths.clone(),
                modified: Vec::new(),
                deleted,
            }
        } else {
            index.read().unwrap().tracker.classify(&self.root, &current_paths)
        };
        token.check()?;

        // Short-circuit: nothing changed.
        if changes.is_empty() {
            let files = index.read().unwrap().trie.len();
            let outcome = RefreshOutcome {
                files,
                added: 0,
                modified: 0,
                deleted: 0,
                elapsed_ms: started.elapsed().as_millis() as u64,
                errors: Vec::new(),
            };
            progress.complete("no changes detected");
            return Ok(outcome);
        }

        info!(
            added = changes.added.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            "Classified changes"
        );

        // Parallel process added and modified files in chunks, merging each
        // chunk as it completes.
        progress.set_stage("process");
        progress.set_total(changes.touched() as u64);
        let mut to_process: Vec<String> = Vec::with_capacity(changes.touched());
        to_process.extend(changes.added.iter().cloned());
        to_process.extend(changes.modified.iter().cloned());

        let mut errors: Vec<String> = Vec::new();
        let mut processed = 0u64;
        for chunk in to_process.chunks(self.chunk_size) {
            if let Err(e) = token.check() {
                progress.cancel(&e.to_string());
                return Err(e);
            }

            let results: Vec<std::result::Result<FileRecord, String>> = self.pool.install(|| {
                chunk
                    .par_iter()
                    .map(|rel| {
                        // Workers re-check the flag at file boundaries.
                        if token.is_cancelled() {
                            return Err(format!("{rel}: cancelled"));
                        }
                        self.process_file(rel)
                    })
                    .collect()
            });

            let mut state = index.write().unwrap();
            for result in results {
                match result {
                    Ok(record) => {
                        let meta = FileMeta {
                            mtime_ms: record.mtime_ms,
                            size: record.size,
                            hash: record.hash.clone(),
                            last_checked: record.last_checked.clone(),
                        };
                        state.tracker.insert(&record.path, meta);
                        state.trie.add_file(record);
                    }
                    Err(description) => errors.push(description),
                }
            }
            drop(state);

            processed += chunk.len() as u64;
            progress.update(processed, "processing files");
        }

        // Prune deletions.
        progress.set_stage("prune");
        {
            let mut state = index.write().unwrap();
            for path in &changes.deleted {
                state.trie.remove_file(path);
                state.tracker.remove(path, Some(meta_store));
            }
        }
        token.check().map_err(|e| {
            progress.cancel(&e.to_string());
            e
        })?;

        // Persist.
        progress.set_stage("persist");
        let files = {
            let state = index.read().unwrap();
            persist_state(&state, meta_store, settings)?;
            state.trie.len()
        };

        let outcome = RefreshOutcome {
            files,
            added: changes.added.len(),
            modified: changes.modified.len(),
            deleted: changes.deleted.len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            errors,
        };
        progress.complete(&format!(
            "indexed {} files (+{} ~{} -{}) in {} ms",
            outcome.files, outcome.added, outcome.modified, outcome.deleted, outcome.elapsed_ms
        ));
        Ok(outcome)
    }
}

fn join_rel(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Persist the trie and the change-tracker map. The trie goes to a sibling
/// `.tmp` path renamed over the live file; the tracker flushes through its
/// store.
pub fn persist_state(
    state: &IndexState,
    meta_store: &dyn KeyValueStore,
    settings: &ProjectSettings,
) -> Result<()> {
    let json = serde_json::to_vec(&state.trie)
        .map_err(|e| ServerError::RefreshFailed(format!("serialize index: {e}")))?;
    write_atomic(&settings.index_path(), &json)
        .map_err(|e| ServerError::RefreshFailed(format!("write index: {e}")))?;
    state
        .tracker
        .save(meta_store)
        .map_err(|e| ServerError::RefreshFailed(format!("save tracker: {e}")))?;
    debug!(files = state.trie.len(), "Persisted index state");
    Ok(())
}

/// Load the persisted trie, if a readable snapshot exists.
pub fn load_trie(settings: &ProjectSettings) -> Option<PathTrie> {
    let bytes = fs::read(settings.index_path()).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(trie) => Some(trie),
        Err(e) => {
            warn!(error = %e, "Ignoring unreadable index snapshot");
            None
        }
    }
}
