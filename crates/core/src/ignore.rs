//! Ignore pattern matching with gitignore semantics.
//!
//! Patterns come from a built-in default set, `.gitignore`, and `.ignore` at
//! the project root, compiled to anchored regexes. Evaluation applies the
//! patterns in order and lets the final matching pattern win, so a later
//! negated pattern (`!keep.log`) un-ignores an earlier match.

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Built-in exclusions applied to every project: version control, virtual
/// environments, caches, build output, editor droppings, and OS junk.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    // Version control
    ".git",
    ".svn",
    ".hg",
    ".bzr",
    // Virtual environments
    "venv",
    "env",
    "ENV",
    ".venv",
    ".env",
    // Python cache
    "__pycache__",
    "*.pyc",
    "*.pyo",
    "*.pyd",
    ".Python",
    // Build directories
    "build",
    "dist",
    "target",
    "out",
    "bin",
    // IDE and editor files
    ".vscode",
    ".idea",
    ".vs",
    "*.swp",
    "*.swo",
    "*~",
    // OS specific
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    // Documentation builds
    "docs/_build",
    "docs/build",
    "_build",
    // Logs and temporary files
    "*.log",
    "*.tmp",
    "tmp",
    "temp",
    // Coverage reports
    "htmlcov",
    ".coverage",
    ".pytest_cache",
    // Package files
    "*.egg-info",
    ".eggs",
];

/// Directory names that are always pruned during traversal, independent of
/// the pattern list.
const IGNORE_DIR_NAMES: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    ".bzr",
    "__pycache__",
    ".pytest_cache",
    "venv",
    "env",
    "ENV",
    ".venv",
    ".env",
    "build",
    "dist",
    "target",
    "out",
    ".vscode",
    ".idea",
    ".vs",
    "htmlcov",
    ".coverage",
    ".eggs",
    "node_modules",
    "_build",
];

/// Hidden directories that may still contain code worth indexing.
const ALLOWED_DOT_DIRS: &[&str] = &[".github", ".vscode", ".config"];

struct CompiledPattern {
    regex: Regex,
    negated: bool,
    original: String,
}

/// Summary of where the loaded patterns came from.
#[derive(Debug, Clone, Serialize)]
pub struct PatternSources {
    pub default_patterns: usize,
    pub gitignore_exists: bool,
    pub ignore_exists: bool,
    pub total_patterns: usize,
    pub compiled_patterns: usize,
}

pub struct IgnoreMatcher {
    base_path: PathBuf,
    patterns: Vec<String>,
    compiled: Vec<CompiledPattern>,
    gitignore_exists: bool,
    ignore_exists: bool,
}

impl IgnoreMatcher {
    /// Load and compile all pattern sources for a project root. Patterns that
    /// fail to compile are skipped and logged, never fatal.
    pub fn new(base_path: &Path) -> Self {
        let mut patterns: Vec<String> =
            DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();

        let gitignore_exists = load_pattern_file(&base_path.join(".gitignore"), &mut patterns);
        let ignore_exists = load_pattern_file(&base_path.join(".ignore"), &mut patterns);

        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in &patterns {
            let (body, negated) = match pattern.strip_prefix('!') {
                Some(rest) => (rest, true),
                None => (pattern.as_str(), false),
            };
            if body.is_empty() {
                continue;
            }
            let regex_src = gitignore_to_regex(body);
            match RegexBuilder::new(&regex_src).case_insensitive(true).build() {
                Ok(regex) => compiled.push(CompiledPattern {
                    regex,
                    negated,
                    original: pattern.clone(),
                }),
                Err(e) => {
                    warn!(pattern = pattern.as_str(), error = %e, "Skipping unparseable ignore pattern");
                }
            }
        }

        Self {
            base_path: base_path.to_path_buf(),
            patterns,
            compiled,
            gitignore_exists,
            ignore_exists,
        }
    }

    /// Check a project-relative path against the pattern list. The final
    /// matching pattern wins; a negated match un-ignores.
    pub fn should_ignore(&self, path: &str) -> bool {
        let path = crate::paths::normalize_rel(path);
        let mut ignored = false;
        for pattern in &self.compiled {
            if pattern.regex.is_match(&path) {
                ignored = !pattern.negated;
            }
        }
        ignored
    }

    /// Directory-specialised check used to prune entire subtrees during the
    /// walk. Directories inside an ignored directory are not re-evaluated.
    pub fn should_ignore_directory(&self, dir_path: &str) -> bool {
        if self.should_ignore(dir_path) {
            return true;
        }

        let dir_path = crate::paths::normalize_rel(dir_path);
        let name = dir_path.rsplit('/').next().unwrap_or(&dir_path);

        if IGNORE_DIR_NAMES.contains(&name) {
            return true;
        }

        if name.starts_with('.') && name != "." && name != ".." {
            return !ALLOWED_DOT_DIRS.contains(&name);
        }

        false
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn sources(&self) -> PatternSources {
        PatternSources {
            default_patterns: DEFAULT_EXCLUDES.len(),
            gitignore_exists: self.gitignore_exists,
            ignore_exists: self.ignore_exists,
            total_patterns: self.patterns.len(),
            compiled_patterns: self.compiled.len(),
        }
    }

    /// Original text of every pattern that compiled.
    pub fn compiled_patterns(&self) -> Vec<&str> {
        self.compiled.iter().map(|p| p.original.as_str()).collect()
    }
}

fn load_pattern_file(path: &Path, patterns: &mut Vec<String>) -> bool {
    if !path.exists() {
        return false;
    }
    match fs::read_to_string(path) {
        Ok(content) => {
            for line in content.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    patterns.push(line.to_string());
                }
            }
            true
        }
        Err(e) => {
            warn!(file = %path.display(), error = %e, "Could not read ignore file");
            true
        }
    }
}

/// Convert a gitignore pattern to a regex source string.
///
/// `**` matches zero or more path segments, `*` and `?` stay within a
/// segment, a leading `/` anchors to the project root, and a trailing `/`
/// matches directories only.
fn gitignore_to_regex(pattern: &str) -> String {
    let (pattern, is_dir) = match pattern.strip_suffix('/') {
        Some(rest) => (rest, true),
        None => (pattern, false),
    };
    let (pattern, anchored) = match pattern.strip_prefix('/') {
        Some(rest) => (rest, true),
        None => (pattern, false),
    };

    let escaped = regex::escape(pattern)
        .replace(r"\*\*", ".*")
        .replace(r"\*", "[^/]*")
        .replace(r"\?", "[^/]");

    let prefix = if anchored { "^" } else { "(^|/)" };
    let suffix = if is_dir { "(/|$)" } else { "(/.*)?$" };
    format!("{prefix}{escaped}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn matcher_with(patterns: &[&str]) -> IgnoreMatcher {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(".gitignore"), patterns.join("\n")).unwrap();
        IgnoreMatcher::new(tmp.path())
    }

    #[test]
    fn test_default_excludes() {
        let tmp = tempfile::tempdir().unwrap();
        let m = IgnoreMatcher::new(tmp.path());
        assert!(m.should_ignore("__pycache__"));
        assert!(m.should_ignore("src/__pycache__/mod.pyc"));
        assert!(m.should_ignore("app.log"));
        assert!(!m.should_ignore("src/main.py"));
    }

    #[test]
    fn test_star_does_not_cross_segments() {
        let m = matcher_with(&["foo/*.txt"]);
        assert!(m.should_ignore("foo/a.txt"));
        assert!(!m.should_ignore("foo/bar/a.txt"));
    }

    #[test]
    fn test_double_star_crosses_segments() {
        let m = matcher_with(&["generated/**"]);
        assert!(m.should_ignore("generated/a/b/c.rs"));
    }

    #[test]
    fn test_anchored_pattern() {
        let m = matcher_with(&["/secrets.txt"]);
        assert!(m.should_ignore("secrets.txt"));
        assert!(!m.should_ignore("config/secrets.txt"));
    }

    #[test]
    fn test_directory_only_pattern() {
        let m = matcher_with(&["cache/"]);
        assert!(m.should_ignore("cache"));
        assert!(m.should_ignore("a/cache/file"));
    }

    #[test]
    fn test_negation_last_match_wins() {
        let m = matcher_with(&["*.log", "!keep.log"]);
        assert!(m.should_ignore("debug.log"));
        assert!(!m.should_ignore("keep.log"));
    }

    #[test]
    fn test_bad_pattern_is_skipped_not_fatal() {
        let m = matcher_with(&["[invalid", "*.bak"]);
        assert!(m.should_ignore("old.bak"));
    }

    #[test]
    fn test_directory_check_hidden_allowlist() {
        let tmp = tempfile::tempdir().unwrap();
        let m = IgnoreMatcher::new(tmp.path());
        assert!(m.should_ignore_directory("node_modules"));
        assert!(m.should_ignore_directory(".cache"));
        assert!(!m.should_ignore_directory(".github"));
        assert!(!m.should_ignore_directory("src"));
    }
}
