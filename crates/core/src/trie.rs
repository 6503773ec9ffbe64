//! Prefix trie over slash-separated path segments.
//!
//! Terminal nodes carry the [`FileRecord`]; non-terminal nodes name path
//! components. Faster than the key-value store wherever ordered by-prefix
//! enumeration is needed, and the source of the nested structure view.

use crate::types::{FileKind, FileRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TrieNode {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    children: BTreeMap<String, TrieNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    record: Option<FileRecord>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PathTrie {
    root: TrieNode,
    len: usize,
}

impl PathTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for a path. Returns true when the path
    /// was not present before.
    pub fn add_file(&mut self, record: FileRecord) -> bool {
        let mut node = &mut self.root;
        for part in record.path.split('/') {
            node = node.children.entry(part.to_string()).or_default();
        }
        let inserted = node.record.is_none();
        node.record = Some(record);
        if inserted {
            self.len += 1;
        }
        inserted
    }

    /// Remove a path, pruning empty non-terminal nodes on the way back up.
    pub fn remove_file(&mut self, path: &str) -> bool {
        let parts: Vec<&str> = path.split('/').collect();
        let removed = Self::remove_rec(&mut self.root, &parts, 0).1;
        if removed {
            self.len -= 1;
        }
        removed
    }

    // Returns (subtree_now_empty, removed_a_record).
    fn remove_rec(node: &mut TrieNode, parts: &[&str], depth: usize) -> (bool, bool) {
        if depth == parts.len() {
            if node.record.is_none() {
                return (false, false);
            }
            node.record = None;
            return (node.children.is_empty(), true);
        }
        let part = parts[depth];
        let Some(child) = node.children.get_mut(part) else {
            return (false, false);
        };
        let (child_empty, removed) = Self::remove_rec(child, parts, depth + 1);
        if child_empty {
            node.children.remove(part);
        }
        (
            removed && node.children.is_empty() && node.record.is_none(),
            removed,
        )
    }

    pub fn get_file_info(&self, path: &str) -> Option<&FileRecord> {
        let mut node = &self.root;
        for part in path.split('/') {
            node = node.children.get(part)?;
        }
        node.record.as_ref()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get_file_info(path).is_some()
    }

    pub fn find_files_by_extension(&self, extension: &str) -> Vec<String> {
        let ext = extension.trim_start_matches('.');
        let mut out = Vec::new();
        Self::walk(&self.root, &mut |record| {
            if record.extension == ext {
                out.push(record.path.clone());
            }
        });
        out
    }

    pub fn all_files(&self) -> Vec<FileRecord> {
        let mut out = Vec::with_capacity(self.len);
        Self::walk(&self.root, &mut |record| out.push(record.clone()));
        out
    }

    pub fn all_paths(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.len);
        Self::walk(&self.root, &mut |record| out.push(record.path.clone()));
        out
    }

    fn walk<'a>(node: &'a TrieNode, visit: &mut impl FnMut(&'a FileRecord)) {
        if let Some(record) = &node.record {
            visit(record);
        }
        for child in node.children.values() {
            Self::walk(child, visit);
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.root = TrieNode::default();
        self.len = 0;
    }

    /// Nested mapping view of the tree: directories become objects, files
    /// become `{type, extension, size}` leaves.
    pub fn structure(&self) -> serde_json::Value {
        Self::structure_of(&self.root)
    }

    fn structure_of(node: &TrieNode) -> serde_json::Value {
        if node.children.is_empty() {
            if let Some(record) = &node.record {
                return serde_json::json!({
                    "type": record.kind,
                    "extension": record.extension,
                    "size": record.size,
                });
            }
        }
        let mut map = serde_json::Map::new();
        for (name, child) in &node.children {
            map.insert(name.clone(), Self::structure_of(child));
        }
        serde_json::Value::Object(map)
    }
}

/// Convenience constructor used by tests and the indexer's worker path.
pub fn record_for(path: &str, size: u64, mtime_ms: u64) -> FileRecord {
    FileRecord {
        path: path.to_string(),
        kind: FileKind::File,
        extension: crate::types::extension_of(path),
        mtime_ms,
        size,
        hash: None,
        last_checked: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trie_with(paths: &[&str]) -> PathTrie {
        let mut trie = PathTrie::new();
        for p in paths {
            trie.add_file(record_for(p, 10, 0));
        }
        trie
    }

    #[test]
    fn test_add_and_get() {
        let trie = trie_with(&["src/main.rs", "src/lib.rs", "README.md"]);
        assert_eq!(trie.len(), 3);
        assert!(trie.contains("src/main.rs"));
        assert!(!trie.contains("src"));
        assert_eq!(trie.get_file_info("src/lib.rs").unwrap().extension, "rs");
    }

    #[test]
    fn test_add_twice_replaces() {
        let mut trie = trie_with(&["a.txt"]);
        assert!(!trie.add_file(record_for("a.txt", 99, 1)));
        assert_eq!(trie.len(), 1);
        assert_eq!(trie.get_file_info("a.txt").unwrap().size, 99);
    }

    #[test]
    fn test_remove_prunes_empty_nodes() {
        let mut trie = trie_with(&["a/b/c.rs", "a/d.rs"]);
        assert!(trie.remove_file("a/b/c.rs"));
        assert_eq!(trie.len(), 1);
        assert!(!trie.contains("a/b/c.rs"));
        // a/d.rs must survive the prune of a/b
        assert!(trie.contains("a/d.rs"));
        assert!(!trie.remove_file("a/b/c.rs"));
    }

    #[test]
    fn test_find_by_extension() {
        let trie = trie_with(&["src/a.rs", "src/b.py", "c.rs"]);
        let mut rs = trie.find_files_by_extension("rs");
        rs.sort();
        assert_eq!(rs, vec!["c.rs".to_string(), "src/a.rs".to_string()]);
        assert_eq!(trie.find_files_by_extension(".py"), vec!["src/b.py"]);
    }

    #[test]
    fn test_structure_nests_directories() {
        let trie = trie_with(&["main.py", "utils/helper.py", "config.json"]);
        let s = trie.structure();
        assert!(s.get("main.py").is_some());
        assert!(s.get("config.json").is_some());
        assert!(s["utils"].get("helper.py").is_some());
        assert_eq!(s["main.py"]["type"], "file");
    }

    #[test]
    fn test_serde_round_trip() {
        let trie = trie_with(&["x/y/z.go", "x/w.go"]);
        let json = serde_json::to_string(&trie).unwrap();
        let back: PathTrie = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 2);
        assert!(back.contains("x/y/z.go"));
    }
}
