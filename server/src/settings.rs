//! Per-project persisted state layout.
//!
//! Each project owns a directory under the system temp root, named by the
//! MD5 of its absolute path, holding the project config record, the
//! key-value/FTS store, the serialized file trie, the change-tracker store,
//! and the persisted query-cache snapshot. Every writer goes through
//! [`write_atomic`]: a sibling `.tmp` file renamed over the live one.

use crate::errors::{Result, ServerError};
use serde_json::json;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Root directory name under the system temp dir.
pub const SETTINGS_ROOT: &str = "code_indexer";

pub const CONFIG_FILE: &str = "config.json";
pub const CACHE_DB_FILE: &str = "cache.db";
pub const INDEX_FILE: &str = "file_index.json";
pub const METADATA_DB_FILE: &str = "metadata.db";
pub const QUERY_CACHE_FILE: &str = "file_content_cache.json";
pub const TRIGRAM_INDEX_DIR: &str = "trigram_index";

/// Write bytes to `<path>.tmp`, then rename over the live file. A partially
/// written `.tmp` is ignored by every loader.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

pub struct ProjectSettings {
    base_path: PathBuf,
    settings_dir: PathBuf,
}

impl ProjectSettings {
    /// Resolve (and create) the settings directory for a project root.
    pub fn new(base_path: &Path) -> Result<Self> {
        let digest = md5::compute(base_path.to_string_lossy().as_bytes());
        let settings_dir = std::env::temp_dir()
            .join(SETTINGS_ROOT)
            .join(format!("{digest:x}"));
        fs::create_dir_all(&settings_dir)?;
        debug!(dir = %settings_dir.display(), "Project settings directory");
        Ok(Self {
            base_path: base_path.to_path_buf(),
            settings_dir,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn settings_dir(&self) -> &Path {
        &self.settings_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.settings_dir.join(CONFIG_FILE)
    }

    pub fn cache_db_path(&self) -> PathBuf {
        self.settings_dir.join(CACHE_DB_FILE)
    }

    pub fn index_path(&self) -> PathBuf {
        self.settings_dir.join(INDEX_FILE)
    }

    pub fn metadata_db_path(&self) -> PathBuf {
        self.settings_dir.join(METADATA_DB_FILE)
    }

    pub fn query_cache_path(&self) -> PathBuf {
        self.settings_dir.join(QUERY_CACHE_FILE)
    }

    pub fn trigram_index_dir(&self) -> PathBuf {
        self.settings_dir.join(TRIGRAM_INDEX_DIR)
    }

    /// Persist the project configuration record, stamping `last_updated`.
    pub fn save_config(&self, mut config: serde_json::Value) -> Result<serde_json::Value> {
        if let Some(obj) = config.as_object_mut() {
            obj.insert(
                "last_updated".to_string(),
                json!(chrono::Utc::now().to_rfc3339()),
            );
        }
        let bytes = serde_json::to_vec_pretty(&config)
            .map_err(|e| ServerError::Config(e.to_string()))?;
        write_atomic(&self.config_path(), &bytes)?;
        Ok(config)
    }

    pub fn load_config(&self) -> Option<serde_json::Value> {
        let bytes = fs::read(self.config_path()).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable project config record");
                None
            }
        }
    }

    /// Delete every persisted artefact for this project (used by force
    /// re-index with `clear_cache`).
    pub fn clear(&self) -> Result<()> {
        for file in [
            self.config_path(),
            self.cache_db_path(),
            self.index_path(),
            self.metadata_db_path(),
            self.query_cache_path(),
        ] {
            if file.exists() {
                fs::remove_file(&file)?;
            }
        }
        let trigram = self.trigram_index_dir();
        if trigram.exists() {
            fs::remove_dir_all(&trigram)?;
        }
        Ok(())
    }

    /// Sizes and presence of each persisted artefact, for diagnostics.
    pub fn stats(&self) -> serde_json::Value {
        let size_of = |p: PathBuf| fs::metadata(&p).map(|m| m.len()).unwrap_or(0);
        json!({
            "settings_dir": self.settings_dir.display().to_string(),
            "exists": self.settings_dir.exists(),
            "config_bytes": size_of(self.config_path()),
            "cache_db_bytes": size_of(self.cache_db_path()),
            "index_bytes": size_of(self.index_path()),
            "metadata_db_bytes": size_of(self.metadata_db_path()),
            "query_cache_bytes": size_of(self.query_cache_path()),
        })
    }
}
