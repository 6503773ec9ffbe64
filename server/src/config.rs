//! Configuration surface: a global TOML file plus per-project overrides in
//! `.code-index.toml`, deep-merged section-wise. Recognised options are
//! enumerated below; unknown keys are logged and ignored, never silently
//! accepted.

use code_index_core::filter::FilterConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Per-project override file name, resolved against the project root.
pub const PROJECT_CONFIG_FILE: &str = ".code-index.toml";

// ---------------------------------------------------------------------------
// Typed sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileFiltering {
    pub max_file_size: u64,
    pub type_specific_limits: HashMap<String, u64>,
    /// Extensions (without dot) admitted by the walk. Empty admits all.
    pub supported_extensions: Vec<String>,
}

impl Default for FileFiltering {
    fn default() -> Self {
        let defaults = FilterConfig::default();
        Self {
            max_file_size: defaults.max_file_size,
            type_specific_limits: defaults.type_specific_limits,
            supported_extensions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryFiltering {
    pub max_files_per_directory: usize,
    pub max_subdirectories_per_directory: usize,
    pub skip_large_directories: Vec<String>,
}

impl Default for DirectoryFiltering {
    fn default() -> Self {
        let defaults = FilterConfig::default();
        Self {
            max_files_per_directory: defaults.max_files_per_directory,
            max_subdirectories_per_directory: defaults.max_subdirectories_per_directory,
            skip_large_directories: defaults.skip_large_directories,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplicitInclusions {
    pub files: Vec<String>,
    pub directories: Vec<String>,
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Performance {
    pub max_workers: usize,
    pub chunk_size: usize,
    pub parallel_processing: bool,
    pub log_filtering_decisions: bool,
}

impl Default for Performance {
    fn default() -> Self {
        Self {
            max_workers: 4,
            chunk_size: 100,
            parallel_processing: true,
            log_filtering_decisions: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub soft_limit_mb: f64,
    pub hard_limit_mb: f64,
    pub gc_threshold_mb: f64,
    pub spill_threshold_mb: f64,
    pub max_loaded_files: usize,
    pub max_cached_queries: usize,
    pub monitor_interval_secs: u64,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            soft_limit_mb: 512.0,
            hard_limit_mb: 1024.0,
            gc_threshold_mb: 256.0,
            spill_threshold_mb: 384.0,
            max_loaded_files: 100,
            max_cached_queries: 50,
            monitor_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    /// Preferred backend name; falls back down the priority list when the
    /// tool is unavailable.
    pub preferred_tool: Option<String>,
    pub page_size: usize,
    pub cache_ttl_secs: u64,
    pub cache_compact_threshold: u64,
    pub maintenance_interval_secs: u64,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            preferred_tool: None,
            page_size: 20,
            cache_ttl_secs: 3600,
            cache_compact_threshold: 128,
            maintenance_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub file_filtering: FileFiltering,
    pub directory_filtering: DirectoryFiltering,
    pub explicit_inclusions: ExplicitInclusions,
    pub performance: Performance,
    pub memory: MemorySection,
    pub search: SearchSection,
    /// Extra ignore patterns appended after the built-in and project sets.
    pub ignore_patterns: Vec<String>,
}

impl IndexConfig {
    /// Project the filtering sections into the core filter policy config.
    pub fn filter_config(&self) -> FilterConfig {
        FilterConfig {
            max_file_size: self.file_filtering.max_file_size,
            type_specific_limits: self.file_filtering.type_specific_limits.clone(),
            max_files_per_directory: self.directory_filtering.max_files_per_directory,
            max_subdirectories_per_directory: self
                .directory_filtering
                .max_subdirectories_per_directory,
            skip_large_directories: self.directory_filtering.skip_large_directories.clone(),
            included_files: self.explicit_inclusions.files.clone(),
            included_directories: self.explicit_inclusions.directories.clone(),
            included_extensions: self.explicit_inclusions.extensions.clone(),
            log_decisions: self.performance.log_filtering_decisions,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading and merging
// ---------------------------------------------------------------------------

/// Default location of the global config file.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("code-index").join("config.toml"))
}

/// Load the effective configuration: global file (if any) with the project's
/// `.code-index.toml` deep-merged on top. Errors are logged and fall back to
/// defaults, never fatal.
pub fn load(global_path: Option<&Path>, project_root: Option<&Path>) -> IndexConfig {
    let mut merged = toml::Value::Table(toml::map::Map::new());

    let global = global_path
        .map(|p| p.to_path_buf())
        .or_else(global_config_path);
    if let Some(path) = global {
        if let Some(value) = read_toml(&path) {
            deep_merge(&mut merged, value);
        }
    }

    if let Some(root) = project_root {
        let override_path = root.join(PROJECT_CONFIG_FILE);
        if let Some(value) = read_toml(&override_path) {
            debug!(path = %override_path.display(), "Applying project config overrides");
            deep_merge(&mut merged, value);
        }
    }

    warn_unknown_keys(&merged);

    match merged.try_into() {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Invalid configuration, applying defaults");
            IndexConfig::default()
        }
    }
}

fn read_toml(path: &Path) -> Option<toml::Value> {
    if !path.exists() {
        return None;
    }
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read config file");
            return None;
        }
    };
    match content.parse::<toml::Value>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not parse config file");
            None
        }
    }
}

/// Recursive table merge: override tables merge into base tables, every other
/// value replaces wholesale.
fn deep_merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

// Enumerated option names, per section. `type_specific_limits` takes
// arbitrary extension keys and is exempt.
const KNOWN_SECTIONS: &[(&str, &[&str])] = &[
    (
        "file_filtering",
        &["max_file_size", "type_specific_limits", "supported_extensions"],
    ),
    (
        "directory_filtering",
        &[
            "max_files_per_directory",
            "max_subdirectories_per_directory",
            "skip_large_directories",
        ],
    ),
    ("explicit_inclusions", &["files", "directories", "extensions"]),
    (
        "performance",
        &["max_workers", "chunk_size", "parallel_processing", "log_filtering_decisions"],
    ),
    (
        "memory",
        &[
            "soft_limit_mb",
            "hard_limit_mb",
            "gc_threshold_mb",
            "spill_threshold_mb",
            "max_loaded_files",
            "max_cached_queries",
            "monitor_interval_secs",
        ],
    ),
    (
        "search",
        &[
            "preferred_tool",
            "page_size",
            "cache_ttl_secs",
            "cache_compact_threshold",
            "maintenance_interval_secs",
        ],
    ),
];

fn warn_unknown_keys(value: &toml::Value) {
    let Some(table) = value.as_table() else {
        return;
    };
    for (section, section_value) in table {
        let known = KNOWN_SECTIONS.iter().find(|(name, _)| name == section);
        match known {
            None if section == "ignore_patterns" => {}
            None => warn!(section = section.as_str(), "Unknown config section ignored"),
            Some((_, keys)) => {
                if let Some(section_table) = section_value.as_table() {
                    for key in section_table.keys() {
                        if !keys.contains(&key.as_str()) {
                            warn!(
                                section = section.as_str(),
                                key = key.as_str(),
                                "Unknown config option ignored"
                            );
                        }
                    }
                }
            }
        }
    }
}
