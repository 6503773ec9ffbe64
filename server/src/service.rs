//! Project service: owns the per-project state and implements every
//! user-visible method over it. The RPC layer is a thin JSON shim around
//! this type.

use crate::config::{self, IndexConfig};
use crate::content::LazyContentManager;
use crate::errors::{Result, ServerError};
use crate::history::ChangeHistory;
use crate::indexer::{load_trie, persist_state, IndexState, Indexer};
use crate::memory::{ComponentUsage, MemoryGovernor};
use crate::progress::{OperationRegistry, ProgressTracker};
use crate::search::dispatcher::SearchDispatcher;
use crate::search::SearchQuery;
use crate::settings::ProjectSettings;
use crate::store::{open_store, ProjectStore, StoredValue};
use crate::summary::AnalyzerRegistry;
use crate::tracker::ChangeTracker;
use code_index_core::cache::MaintenanceHandle;
use code_index_core::paths::validate_path;
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{info, warn};

const REFRESH_STAGES: &[&str] = &["walk", "classify", "process", "prune", "persist"];
const OPERATION_RETENTION: Duration = Duration::from_secs(300);

pub struct ProjectState {
    pub root: PathBuf,
    pub config: IndexConfig,
    pub settings: Arc<ProjectSettings>,
    pub store: Arc<dyn ProjectStore>,
    pub meta_store: Arc<dyn ProjectStore>,
    pub history: ChangeHistory,
    pub index: Arc<RwLock<IndexState>>,
    pub content: Arc<LazyContentManager>,
    pub dispatcher: Arc<SearchDispatcher>,
    pub indexer: Indexer,
    pub analyzers: AnalyzerRegistry,
    refresh_lock: Mutex<()>,
    _maintenance: MaintenanceHandle,
}

pub struct ProjectService {
    global_config_path: Option<PathBuf>,
    state: RwLock<Option<Arc<ProjectState>>>,
    governor: Arc<MemoryGovernor>,
    operations: Arc<OperationRegistry>,
}

impl ProjectService {
    pub fn new(global_config_path: Option<PathBuf>) -> Arc<Self> {
        let base_config = config::load(global_config_path.as_deref(), None);
        let governor = MemoryGovernor::new(base_config.memory.clone());
        governor.start_monitoring(Duration::from_secs(
            base_config.memory.monitor_interval_secs.max(1),
        ));
        Arc::new(Self {
            global_config_path,
            state: RwLock::new(None),
            governor,
            operations: Arc::new(OperationRegistry::new(OPERATION_RETENTION)),
        })
    }

    pub fn operations(&self) -> &Arc<OperationRegistry> {
        &self.operations
    }

    pub fn governor(&self) -> &Arc<MemoryGovernor> {
        &self.governor
    }

    fn state(&self) -> Result<Arc<ProjectState>> {
        self.state
            .read()
            .unwrap()
            .as_ref()
            .cloned()
            .ok_or(ServerError::NotConfigured)
    }

    // -----------------------------------------------------------------------
    // set_project
    // -----------------------------------------------------------------------

    pub fn set_project(&self, path: &str) -> Result<serde_json::Value> {
        let root = PathBuf::from(path);
        if !root.is_absolute() {
            return Err(ServerError::Path(format!(
                "project path must be absolute: {path}"
            )));
        }
        let root = root
            .canonicalize()
            .map_err(|_| ServerError::Path(format!("project path not found: {path}")))?;
        if !root.is_dir() {
            return Err(ServerError::Path(format!(
                "project path is not a directory: {path}"
            )));
        }

        let config = config::load(self.global_config_path.as_deref(), Some(&root));
        let settings = Arc::new(ProjectSettings::new(&root)?);

        let store = open_store(&settings.cache_db_path(), true);
        let meta_store = open_store(&settings.metadata_db_path(), false);
        let history = ChangeHistory::new(Arc::clone(&store));

        let tracker = ChangeTracker::load(meta_store.as_kv());
        let trie = load_trie(&settings).unwrap_or_default();
        let loaded_from_disk = !trie.is_empty();
        let index = Arc::new(RwLock::new(IndexState { trie, tracker }));

        let indexer = Indexer::new(&root, &config)?;
        let content = Arc::new(LazyContentManager::new(
            &root,
            config.memory.max_loaded_files,
        ));
        let dispatcher = Arc::new(SearchDispatcher::new(
            &config.search,
            &settings.trigram_index_dir(),
            &settings.query_cache_path(),
            config.memory.max_cached_queries,
        ));

        self.wire_governor(&content, &dispatcher, &index);

        // Background maintenance: stale query-cache eviction, compaction,
        // loaded-content enforcement, and operation GC.
        let maintenance = {
            let dispatcher = Arc::clone(&dispatcher);
            let content = Arc::clone(&content);
            let operations = Arc::clone(&self.operations);
            MaintenanceHandle::spawn(
                Duration::from_secs(config.search.maintenance_interval_secs.max(1)),
                move || {
                    dispatcher.cache_maintain();
                    content.enforce_loaded_limit();
                    operations.gc();
                },
            )
        };

        let state = Arc::new(ProjectState {
            root: root.clone(),
            config,
            settings,
            store,
            meta_store,
            history,
            index,
            content,
            dispatcher,
            indexer,
            analyzers: AnalyzerRegistry::new(),
            refresh_lock: Mutex::new(()),
            _maintenance: maintenance,
        });
        *self.state.write().unwrap() = Some(Arc::clone(&state));

        // First sighting builds the index; a reload skips straight to serving.
        let files = if loaded_from_disk {
            info!(files = state.index.read().unwrap().trie.len(), "Loaded persisted index");
            state.index.read().unwrap().trie.len()
        } else {
            let outcome = self.run_refresh(&state, false)?;
            outcome["files"].as_u64().unwrap_or(0) as usize
        };

        let search_tool = state.dispatcher.active_tool();
        state.settings.save_config(json!({
            "base_path": root.display().to_string(),
            "file_count": files,
            "search_tool": search_tool,
        }))?;

        Ok(json!({ "files": files, "search_tool": search_tool }))
    }

    fn wire_governor(
        &self,
        content: &Arc<LazyContentManager>,
        dispatcher: &Arc<SearchDispatcher>,
        index: &Arc<RwLock<IndexState>>,
    ) {
        {
            let content = Arc::clone(content);
            let dispatcher = Arc::clone(dispatcher);
            let index = Arc::clone(index);
            self.governor.set_usage_source(move || ComponentUsage {
                loaded_files: content.loaded_count(),
                cached_queries: dispatcher.cached_query_count(),
                tracked_objects: index.read().unwrap().trie.len(),
            });
        }

        let cleanup: Vec<Box<dyn Fn() + Send + Sync>> = {
            let content = Arc::clone(content);
            let dispatcher = Arc::clone(dispatcher);
            vec![Box::new(move || {
                dispatcher.cache_maintain();
                content.halve_loaded();
            })]
        };
        let spill: Vec<Box<dyn Fn() + Send + Sync>> = {
            let dispatcher = Arc::clone(dispatcher);
            // Weak: these hooks live inside the governor itself.
            let governor = Arc::downgrade(&self.governor);
            vec![Box::new(move || {
                if let Some(governor) = governor.upgrade() {
                    let contents = dispatcher.cache_contents();
                    if let Err(e) = governor.spill("query_cache", &contents) {
                        warn!(error = %e, "Query-cache spill failed");
                        return;
                    }
                    dispatcher.cache_clear();
                }
            })]
        };
        let limit: Vec<Box<dyn Fn() + Send + Sync>> = {
            let content = Arc::clone(content);
            let dispatcher = Arc::clone(dispatcher);
            vec![Box::new(move || {
                content.unload_all();
                dispatcher.cache_clear();
            })]
        };
        self.governor.set_hooks(cleanup, spill, limit);
    }

    // -----------------------------------------------------------------------
    // File and structure queries
    // -----------------------------------------------------------------------

    pub fn get_file_content(&self, rel_path: &str) -> Result<serde_json::Value> {
        let state = self.state()?;
        validate_path(&state.root, rel_path).map_err(ServerError::Path)?;
        let rel = code_index_core::paths::normalize_rel(rel_path);
        let content = state.content.content(&rel)?;
        Ok(json!({
            "path": rel,
            "size": content.len(),
            "content": &*content,
        }))
    }

    pub fn get_structure(&self) -> Result<serde_json::Value> {
        let state = self.state()?;
        let structure = state.index.read().unwrap().trie.structure();
        Ok(structure)
    }

    pub fn find_files(&self, pattern: &str) -> Result<serde_json::Value> {
        let state = self.state()?;
        let matcher = globset::Glob::new(pattern)
            .map_err(|e| ServerError::Path(format!("invalid glob pattern '{pattern}': {e}")))?
            .compile_matcher();
        let mut files: Vec<String> = state
            .index
            .read()
            .unwrap()
            .trie
            .all_paths()
            .into_iter()
            .filter(|p| matcher.is_match(p))
            .collect();
        files.sort();
        Ok(json!({ "files": files }))
    }

    pub fn get_file_summary(&self, rel_path: &str) -> Result<serde_json::Value> {
        let state = self.state()?;
        validate_path(&state.root, rel_path).map_err(ServerError::Path)?;
        let rel = code_index_core::paths::normalize_rel(rel_path);

        let stored_hash = state
            .index
            .read()
            .unwrap()
            .tracker
            .meta(&rel)
            .and_then(|m| m.hash.clone())
            .unwrap_or_default();
        let cache_key = format!("summary:{rel}:{stored_hash}");
        if let Some(StoredValue::Json(cached)) = state.store.get(&cache_key)? {
            return Ok(cached);
        }

        let content = state.content.content(&rel)?;
        let extension = code_index_core::types::extension_of(&rel);
        let summary = state.analyzers.analyze(&extension, &content);
        let value = json!({
            "path": rel,
            "line_count": content.lines().count(),
            "size_bytes": content.len(),
            "extension": extension,
            "imports": summary.imports,
            "classes": summary.classes,
            "functions": summary.functions,
        });
        state.store.put(&cache_key, StoredValue::Json(value.clone()))?;
        Ok(value)
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn search(
        &self,
        pattern: &str,
        case_sensitive: bool,
        context_lines: usize,
        file_pattern: Option<String>,
        fuzzy: bool,
        page: usize,
        page_size: Option<usize>,
    ) -> Result<serde_json::Value> {
        let state = self.state()?;
        let query = SearchQuery {
            pattern: pattern.to_string(),
            base: state.root.clone(),
            case_sensitive,
            context_lines,
            file_glob: file_pattern,
            fuzzy,
        };
        let result = state.dispatcher.search(&query, page, page_size)?;
        let mut value = serde_json::to_value(&result)
            .map_err(|e| ServerError::Integrity(e.to_string()))?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("tool".to_string(), json!(state.dispatcher.active_tool()));
        }
        Ok(value)
    }

    pub fn search_multiple(
        &self,
        patterns: &[String],
        case_sensitive: bool,
        context_lines: usize,
        file_pattern: Option<String>,
        fuzzy: bool,
    ) -> Result<serde_json::Value> {
        let state = self.state()?;
        let template = SearchQuery {
            pattern: String::new(),
            base: state.root.clone(),
            case_sensitive,
            context_lines,
            file_glob: file_pattern,
            fuzzy,
        };
        let results = state.dispatcher.search_multiple(patterns, &template);
        Ok(json!({ "results": results }))
    }

    pub fn refresh_search_tools(&self) -> Result<serde_json::Value> {
        let state = self.state()?;
        let available = state.dispatcher.probe();
        Ok(json!({
            "available": available,
            "active": state.dispatcher.active_tool(),
        }))
    }

    // -----------------------------------------------------------------------
    // Refresh / force re-index
    // -----------------------------------------------------------------------

    fn run_refresh(&self, state: &Arc<ProjectState>, force: bool) -> Result<serde_json::Value> {
        let Ok(_guard) = state.refresh_lock.try_lock() else {
            return Err(ServerError::AlreadyRunning);
        };

        let name = if force { "force_reindex" } else { "refresh" };
        let progress = ProgressTracker::new(name, 0, REFRESH_STAGES);
        self.operations.register(Arc::clone(&progress));

        // Cancellation between chunks persists whatever partial state merged.
        {
            let index = Arc::clone(&state.index);
            let meta_store = Arc::clone(&state.meta_store);
            let settings = Arc::clone(&state.settings);
            progress.add_cleanup_hook(move || {
                let snapshot = index.read().unwrap();
                if let Err(e) = persist_state(&snapshot, meta_store.as_kv(), &settings) {
                    warn!(error = %e, "Could not persist partial index state");
                }
            });
        }

        match state.indexer.refresh(
            &state.index,
            state.meta_store.as_kv(),
            &state.settings,
            &progress,
            force,
        ) {
            Ok(outcome) => {
                serde_json::to_value(&outcome).map_err(|e| ServerError::Integrity(e.to_string()))
            }
            Err(e) => {
                if !matches!(e, ServerError::Cancelled(_)) {
                    progress.fail(&e.to_string());
                }
                Err(e)
            }
        }
    }

    pub fn refresh(&self) -> Result<serde_json::Value> {
        let state = self.state()?;
        self.run_refresh(&state, false)
    }

    pub fn force_reindex(&self, clear_cache: bool) -> Result<serde_json::Value> {
        let state = self.state()?;
        if clear_cache {
            info!("Clearing caches and persisted artefacts before re-index");
            state.dispatcher.cache_clear();
            state.content.unload_all();
            state.store.clear()?;
            state.meta_store.clear()?;
            {
                let mut index = state.index.write().unwrap();
                index.trie.clear();
                index.tracker.clear();
            }
            state.dispatcher.refresh_indexes(&state.root);
        }
        self.run_refresh(&state, true)
    }

    // -----------------------------------------------------------------------
    // File history
    // -----------------------------------------------------------------------

    pub fn record_version(&self, rel_path: &str) -> Result<serde_json::Value> {
        let state = self.state()?;
        let abs = validate_path(&state.root, rel_path).map_err(ServerError::Path)?;
        let rel = code_index_core::paths::normalize_rel(rel_path);
        let bytes = std::fs::read(abs)?;
        let content = String::from_utf8_lossy(&bytes);
        let (version_id, operation) = state.history.record_change(&rel, &content)?;
        Ok(json!({
            "path": rel,
            "version_id": version_id,
            "operation": format!("{operation:?}").to_lowercase(),
        }))
    }

    pub fn file_history(&self, rel_path: &str) -> Result<serde_json::Value> {
        let state = self.state()?;
        let rel = code_index_core::paths::normalize_rel(rel_path);
        let timeline = state.history.history(&rel)?;
        Ok(json!({ "path": rel, "history": timeline }))
    }

    pub fn reconstruct_version(&self, rel_path: &str, version_id: &str) -> Result<serde_json::Value> {
        let state = self.state()?;
        let rel = code_index_core::paths::normalize_rel(rel_path);
        let content = state.history.reconstruct(&rel, version_id)?;
        Ok(json!({
            "path": rel,
            "version_id": version_id,
            "content": content,
        }))
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    pub fn get_operations(&self) -> Result<serde_json::Value> {
        self.operations.gc();
        Ok(json!({ "operations": self.operations.list() }))
    }

    pub fn cancel_operation(&self, operation_id: &str, reason: &str) -> Result<serde_json::Value> {
        let cancelled = self.operations.cancel(operation_id, reason);
        Ok(json!({ "operation_id": operation_id, "cancelled": cancelled }))
    }

    pub fn cancel_all(&self, reason: &str) -> Result<serde_json::Value> {
        Ok(json!({ "cancelled": self.operations.cancel_all(reason) }))
    }

    // -----------------------------------------------------------------------
    // Memory
    // -----------------------------------------------------------------------

    pub fn memory_stats(&self) -> Result<serde_json::Value> {
        let mut stats = self.governor.stats();
        if let Ok(state) = self.state() {
            if let Some(obj) = stats.as_object_mut() {
                obj.insert("content".to_string(), state.content.stats());
                obj.insert("query_cache".to_string(), state.dispatcher.cache_stats());
                obj.insert(
                    "tracker".to_string(),
                    state.index.read().unwrap().tracker.stats(),
                );
            }
        }
        Ok(stats)
    }

    pub fn memory_cleanup(&self) -> Result<serde_json::Value> {
        Ok(self.governor.enforce())
    }

    pub fn memory_limits(
        &self,
        soft: Option<f64>,
        hard: Option<f64>,
        gc: Option<f64>,
        spill: Option<f64>,
    ) -> Result<serde_json::Value> {
        let limits = self.governor.update_limits(soft, hard, gc, spill);
        serde_json::to_value(limits).map_err(|e| ServerError::Integrity(e.to_string()))
    }

    pub fn memory_export(&self, path: Option<&str>) -> Result<serde_json::Value> {
        let target = match path {
            Some(p) => PathBuf::from(p),
            None => {
                let state = self.state()?;
                state.settings.settings_dir().join("memory_profile.json")
            }
        };
        self.governor.export_profile(&target)?;
        Ok(json!({ "path": target.display().to_string() }))
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    pub fn get_ignore_patterns(&self) -> Result<serde_json::Value> {
        let state = self.state()?;
        let matcher = state.indexer.ignore_matcher();
        Ok(json!({
            "sources": matcher.sources(),
            "patterns": matcher.patterns(),
        }))
    }

    pub fn get_settings_info(&self) -> Result<serde_json::Value> {
        let state = self.state()?;
        Ok(json!({
            "project": state.root.display().to_string(),
            "storage": state.store.backend_name(),
            "metadata_storage": state.meta_store.backend_name(),
            "settings": state.settings.stats(),
            "tracker": state.index.read().unwrap().tracker.stats(),
            "config": state.config,
        }))
    }

    /// Persist everything and release background work. Called once at exit.
    pub fn shutdown(&self) {
        self.operations.cancel_all("server shutting down");
        if let Ok(state) = self.state() {
            state.dispatcher.cache_save();
            let snapshot = state.index.read().unwrap();
            if let Err(e) = persist_state(&snapshot, state.meta_store.as_kv(), &state.settings) {
                warn!(error = %e, "Could not persist index state at shutdown");
            }
        }
        self.governor.stop_monitoring();
        self.governor.cleanup_spill_files();
    }
}

impl Drop for ProjectService {
    fn drop(&mut self) {
        self.governor.stop_monitoring();
    }
}
