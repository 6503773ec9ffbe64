use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// File records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Dir,
}

/// Indexed metadata for a single filesystem entry. Paths are project-relative
/// and forward-slash normalised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub kind: FileKind,
    pub extension: String,
    /// Modification time in integer milliseconds since the epoch.
    pub mtime_ms: u64,
    pub size: u64,
    /// SHA-256 over the file bytes at the moment `last_checked` was recorded.
    pub hash: Option<String>,
    /// RFC 3339 timestamp of the last metadata check.
    pub last_checked: String,
}

impl FileRecord {
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Extract the extension (without the dot) from a relative path.
pub fn extension_of(rel_path: &str) -> String {
    let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Search results
// ---------------------------------------------------------------------------

/// A single matching line: 1-based line number plus line content.
pub type LineMatch = (usize, String);

/// Matches grouped per file, ordered ascending by line number within a file.
pub type SearchMatches = BTreeMap<String, Vec<LineMatch>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageInfo {
    pub page: usize,
    pub page_size: usize,
    pub total_matches: usize,
    pub total_pages: usize,
    pub has_next: bool,
    pub has_prev: bool,
}

/// One page of a search result, as stored in the query cache and returned to
/// clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPage {
    pub results: SearchMatches,
    pub pagination: PageInfo,
}

// ---------------------------------------------------------------------------
// Change classification
// ---------------------------------------------------------------------------

/// Disjoint sets produced by classifying a directory scan against the known
/// file metadata.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn touched(&self) -> usize {
        self.added.len() + self.modified.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("src/main.rs"), "rs");
        assert_eq!(extension_of("a/b/Makefile"), "");
        assert_eq!(extension_of(".gitignore"), "");
        assert_eq!(extension_of("UPPER.PY"), "py");
        assert_eq!(extension_of("archive.tar.gz"), "gz");
    }
}
