//! Search backends and dispatch.
//!
//! Every backend answers the same contract — availability probe plus a
//! search over `(pattern, base, case, context, glob, fuzzy)` — whether it
//! shells out to an external tool or runs in-process. External tool output
//! goes through one line-oriented parser.

pub mod dispatcher;
pub mod external;
pub mod fallback;

use crate::errors::Result;
use code_index_core::types::SearchMatches;
use std::path::{Path, PathBuf};

/// One search request as seen by a backend.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub pattern: String,
    pub base: PathBuf,
    pub case_sensitive: bool,
    pub context_lines: usize,
    pub file_glob: Option<String>,
    pub fuzzy: bool,
}

impl SearchQuery {
    pub fn new(pattern: &str, base: &Path) -> Self {
        Self {
            pattern: pattern.to_string(),
            base: base.to_path_buf(),
            case_sensitive: true,
            context_lines: 0,
            file_glob: None,
            fuzzy: false,
        }
    }
}

pub trait SearchBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Probe whether this backend can run on the host.
    fn is_available(&self) -> bool;

    /// Execute the query. Exit code 1 from an external tool means an empty
    /// result; anything above raises `SearchFailed`.
    fn search(&self, query: &SearchQuery) -> Result<SearchMatches>;

    /// One-time setup before first use (index construction for indexed
    /// backends).
    fn prepare(&self, _base: &Path) -> Result<()> {
        Ok(())
    }

    /// Rebuild any backend-side index.
    fn refresh_index(&self, _base: &Path) -> Result<()> {
        Ok(())
    }
}

/// Parse `path:line:content` output shared by the command-line tools.
///
/// Accepts a leading drive letter, silently drops lines that do not match
/// the shape, normalises separators to forward slashes, and makes paths
/// relative to `base`.
pub fn parse_search_output(output: &str, base: &Path) -> SearchMatches {
    let mut results = SearchMatches::new();
    let base_str = base.to_string_lossy().replace('\\', "/");
    let base_prefix = format!("{}/", base_str.trim_end_matches('/'));

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Some((path_part, line_number, content)) = split_match_line(line) else {
            continue;
        };

        let normalized = path_part.replace('\\', "/");
        let rel = normalized
            .strip_prefix(&base_prefix)
            .or_else(|| normalized.strip_prefix(base_str.as_str()))
            .map(|p| p.trim_start_matches('/'))
            .unwrap_or(normalized.as_str());
        let rel = rel.trim_start_matches("./");
        if rel.is_empty() {
            continue;
        }

        results
            .entry(rel.to_string())
            .or_default()
            .push((line_number, content.to_string()));
    }

    for matches in results.values_mut() {
        matches.sort_by_key(|(line, _)| *line);
    }
    results
}

// Split "path:12:content", tolerating a drive letter in the path.
fn split_match_line(line: &str) -> Option<(String, usize, &str)> {
    let bytes = line.as_bytes();
    let drive_prefix = bytes.len() > 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/');
    let search_from = if drive_prefix { 2 } else { 0 };

    let first_colon = line[search_from..].find(':')? + search_from;
    let rest = &line[first_colon + 1..];
    let second_colon = rest.find(':')?;

    let path = line[..first_colon].to_string();
    let line_number: usize = rest[..second_colon].trim().parse().ok()?;
    let content = &rest[second_colon + 1..];
    Some((path, line_number, content))
}
