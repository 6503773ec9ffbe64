//! File and directory filter policy: size limits, per-extension overrides,
//! per-directory entry counts, and explicit inclusions that waive all limits.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashMap;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Global size ceiling in bytes.
    pub max_file_size: u64,
    /// Per-extension overrides, keyed with the leading dot (`.py`).
    pub type_specific_limits: HashMap<String, u64>,
    pub max_files_per_directory: usize,
    pub max_subdirectories_per_directory: usize,
    /// Globs applied to relative directory paths; matching directories are
    /// skipped wholesale.
    pub skip_large_directories: Vec<String>,
    pub included_files: Vec<String>,
    pub included_directories: Vec<String>,
    /// Extensions (with leading dot) whose limits are waived.
    pub included_extensions: Vec<String>,
    pub log_decisions: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        let mut limits = HashMap::new();
        for ext in [".py", ".js", ".ts", ".jsx", ".tsx", ".java"] {
            limits.insert(ext.to_string(), 1024 * 1024);
        }
        for ext in [".json", ".yaml", ".yml", ".xml"] {
            limits.insert(ext.to_string(), 512 * 1024);
        }
        Self {
            max_file_size: 5 * 1024 * 1024,
            type_specific_limits: limits,
            max_files_per_directory: 1000,
            max_subdirectories_per_directory: 100,
            skip_large_directories: [
                "**/node_modules/**",
                "**/venv/**",
                "**/.venv/**",
                "**/site-packages/**",
                "**/dist/**",
                "**/build/**",
                "**/.git/**",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            included_files: Vec::new(),
            included_directories: Vec::new(),
            included_extensions: Vec::new(),
            log_decisions: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

pub struct FilterPolicy {
    config: FilterConfig,
    skip_globs: GlobSet,
}

impl FilterPolicy {
    pub fn new(config: FilterConfig) -> Self {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.skip_large_directories {
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(e) => warn!(pattern = pattern.as_str(), error = %e, "Skipping invalid directory glob"),
            }
        }
        let skip_globs = builder.build().unwrap_or_else(|e| {
            warn!(error = %e, "Directory glob set failed to build, skipping none");
            GlobSet::empty()
        });
        Self { config, skip_globs }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Size ceiling for a specific file, `None` when limits are waived.
    pub fn max_size_for(&self, rel_path: &str) -> Option<u64> {
        if self.explicitly_included(rel_path) {
            return None;
        }
        let ext = dot_extension(rel_path);
        if !ext.is_empty() {
            if let Some(limit) = self.config.type_specific_limits.get(&ext) {
                return Some(*limit);
            }
        }
        Some(self.config.max_file_size)
    }

    /// Pure decision over a file path and its size.
    pub fn allows_file(&self, rel_path: &str, size: u64) -> bool {
        let allowed = match self.max_size_for(rel_path) {
            None => true,
            Some(limit) => size <= limit,
        };
        if !allowed && self.config.log_decisions {
            debug!(path = rel_path, size = size, "File filtered out by size limit");
        }
        allowed
    }

    /// Decision over a directory, given its relative path and entry counts.
    pub fn allows_directory(&self, rel_dir: &str, files: usize, subdirs: usize) -> bool {
        if rel_dir.is_empty() {
            return true;
        }
        if self.directory_included(rel_dir) {
            return true;
        }
        if self.skip_globs.is_match(rel_dir) || self.skip_globs.is_match(format!("{rel_dir}/")) {
            if self.config.log_decisions {
                debug!(dir = rel_dir, "Directory filtered out by skip glob");
            }
            return false;
        }
        if files > self.config.max_files_per_directory
            || subdirs > self.config.max_subdirectories_per_directory
        {
            if self.config.log_decisions {
                debug!(
                    dir = rel_dir,
                    files = files,
                    subdirs = subdirs,
                    "Directory filtered out by entry count"
                );
            }
            return false;
        }
        true
    }

    fn explicitly_included(&self, rel_path: &str) -> bool {
        let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
        if self
            .config
            .included_files
            .iter()
            .any(|f| f == rel_path || f == name)
        {
            return true;
        }
        let ext = dot_extension(rel_path);
        if !ext.is_empty() && self.config.included_extensions.iter().any(|e| *e == ext) {
            return true;
        }
        self.directory_included(rel_path)
    }

    fn directory_included(&self, rel_path: &str) -> bool {
        self.config
            .included_directories
            .iter()
            .any(|d| rel_path == d || rel_path.starts_with(&format!("{d}/")))
    }
}

fn dot_extension(rel_path: &str) -> String {
    let ext = crate::types::extension_of(rel_path);
    if ext.is_empty() {
        String::new()
    } else {
        format!(".{ext}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_size_limit() {
        let policy = FilterPolicy::new(FilterConfig::default());
        assert!(policy.allows_file("big.bin", 4 * 1024 * 1024));
        assert!(!policy.allows_file("big.bin", 6 * 1024 * 1024));
    }

    #[test]
    fn test_type_specific_limit_overrides_global() {
        let policy = FilterPolicy::new(FilterConfig::default());
        // .json is capped at 512 KiB even though the global cap is 5 MiB
        assert!(policy.allows_file("data.json", 400 * 1024));
        assert!(!policy.allows_file("data.json", 600 * 1024));
    }

    #[test]
    fn test_explicit_inclusion_waives_limits() {
        let config = FilterConfig {
            included_files: vec!["huge.json".to_string()],
            ..Default::default()
        };
        let policy = FilterPolicy::new(config);
        assert!(policy.allows_file("huge.json", 100 * 1024 * 1024));
        assert!(!policy.allows_file("other.json", 100 * 1024 * 1024));
    }

    #[test]
    fn test_directory_count_limits() {
        let config = FilterConfig {
            max_files_per_directory: 10,
            max_subdirectories_per_directory: 3,
            ..Default::default()
        };
        let policy = FilterPolicy::new(config);
        assert!(policy.allows_directory("src", 10, 3));
        assert!(!policy.allows_directory("src", 11, 0));
        assert!(!policy.allows_directory("src", 0, 4));
    }

    #[test]
    fn test_skip_large_directory_globs() {
        let policy = FilterPolicy::new(FilterConfig::default());
        assert!(!policy.allows_directory("web/node_modules/pkg", 1, 0));
        assert!(policy.allows_directory("src/util", 1, 0));
    }

    #[test]
    fn test_included_directory_bypasses_globs() {
        let config = FilterConfig {
            included_directories: vec!["web/node_modules/mine".to_string()],
            ..Default::default()
        };
        let policy = FilterPolicy::new(config);
        assert!(policy.allows_directory("web/node_modules/mine", 5000, 0));
    }
}
