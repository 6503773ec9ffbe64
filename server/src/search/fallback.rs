//! In-process fallback backend: walks the tree, streams lines, and matches
//! with a compiled regex. Always available; does not support context lines.

use super::{SearchBackend, SearchQuery};
use crate::content::{CHUNK_SIZE, LARGE_FILE_THRESHOLD};
use crate::errors::{Result, ServerError};
use code_index_core::fuzzy::create_safe_fuzzy_pattern;
use code_index_core::types::SearchMatches;
use globset::Glob;
use regex::{Regex, RegexBuilder};
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

pub struct FallbackBackend;

impl FallbackBackend {
    fn compile(query: &SearchQuery) -> Result<Regex> {
        let source = if query.fuzzy {
            create_safe_fuzzy_pattern(&query.pattern)
        } else {
            query.pattern.clone()
        };
        RegexBuilder::new(&source)
            .case_insensitive(!query.case_sensitive)
            .build()
            .map_err(|e| ServerError::SearchFailed {
                tool: "basic".to_string(),
                stderr: format!("invalid pattern: {e}"),
            })
    }
}

/// First 8 KiB with a NUL byte means binary; skip it.
fn is_text_file(path: &Path) -> bool {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let mut buf = [0u8; 8192];
    let n = match file.read(&mut buf) {
        Ok(n) => n,
        Err(_) => return false,
    };
    !buf[..n].contains(&0)
}

fn search_file(path: &Path, size: u64, regex: &Regex) -> Vec<(usize, String)> {
    let mut matches = Vec::new();
    if size >= LARGE_FILE_THRESHOLD {
        // Stream large files through a chunk-sized buffer instead of one read.
        let Ok(file) = fs::File::open(path) else {
            return matches;
        };
        let mut reader = BufReader::with_capacity(CHUNK_SIZE, file);
        let mut line_number = 0usize;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    line_number += 1;
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    if regex.is_match(line) {
                        matches.push((line_number, line.to_string()));
                    }
                }
            }
        }
    } else {
        let Ok(bytes) = fs::read(path) else {
            return matches;
        };
        let text = String::from_utf8_lossy(&bytes);
        for (idx, line) in text.lines().enumerate() {
            if regex.is_match(line) {
                matches.push((idx + 1, line.to_string()));
            }
        }
    }
    matches
}

impl SearchBackend for FallbackBackend {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn search(&self, query: &SearchQuery) -> Result<SearchMatches> {
        let regex = Self::compile(query)?;
        let glob = match &query.file_glob {
            Some(pattern) => Some(
                Glob::new(pattern)
                    .map_err(|e| ServerError::SearchFailed {
                        tool: "basic".to_string(),
                        stderr: format!("invalid file glob: {e}"),
                    })?
                    .compile_matcher(),
            ),
            None => None,
        };

        let mut results = SearchMatches::new();
        let walker = ignore::WalkBuilder::new(&query.base)
            .hidden(true)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .build();

        for entry in walker.flatten() {
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let abs = entry.path();
            let rel = abs
                .strip_prefix(&query.base)
                .unwrap_or(abs)
                .to_string_lossy()
                .replace('\\', "/");
            if let Some(matcher) = &glob {
                if !matcher.is_match(&rel) {
                    continue;
                }
            }
            if !is_text_file(abs) {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let matches = search_file(abs, size, &regex);
            if !matches.is_empty() {
                results.insert(rel, matches);
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn query(pattern: &str, base: &Path) -> SearchQuery {
        SearchQuery::new(pattern, base)
    }

    #[test]
    fn test_literal_search_across_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.py"), "x = 0\nprint(\"hello\")\n").unwrap();
        fs::write(tmp.path().join("b.py"), "hello = 1\n").unwrap();
        fs::write(tmp.path().join("c.py"), "nothing\n").unwrap();

        let results = FallbackBackend.search(&query("hello", tmp.path())).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results["a.py"], vec![(2, "print(\"hello\")".to_string())]);
        assert_eq!(results["b.py"], vec![(1, "hello = 1".to_string())]);
    }

    #[test]
    fn test_fuzzy_word_boundaries() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("t.py"), "testing\nmytest\ncontested\n").unwrap();

        let mut q = query("test", tmp.path());
        q.fuzzy = true;
        let results = FallbackBackend.search(&q).unwrap();
        assert_eq!(
            results["t.py"],
            vec![(1, "testing".to_string()), (2, "mytest".to_string())]
        );

        let mut q = query("testx", tmp.path());
        q.fuzzy = true;
        assert!(FallbackBackend.search(&q).unwrap().is_empty());
    }

    #[test]
    fn test_case_insensitive() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.txt"), "Hello\nHELLO\nworld\n").unwrap();
        let mut q = query("hello", tmp.path());
        q.case_sensitive = false;
        let results = FallbackBackend.search(&q).unwrap();
        assert_eq!(results["a.txt"].len(), 2);
    }

    #[test]
    fn test_file_glob_filter() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.py"), "needle\n").unwrap();
        fs::write(tmp.path().join("a.txt"), "needle\n").unwrap();
        let mut q = query("needle", tmp.path());
        q.file_glob = Some("*.py".to_string());
        let results = FallbackBackend.search(&q).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results.contains_key("a.py"));
    }

    #[test]
    fn test_binary_files_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("bin.dat"), [b'n', 0u8, b'e', b'e']).unwrap();
        fs::write(tmp.path().join("ok.txt"), "needle\n").unwrap();
        let results = FallbackBackend.search(&query("needle", tmp.path())).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_subdirectory_paths_are_relative() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("src")).unwrap();
        fs::write(tmp.path().join("src/m.rs"), "fn main() {}\n").unwrap();
        let results = FallbackBackend.search(&query("main", tmp.path())).unwrap();
        assert!(results.contains_key("src/m.rs"));
    }

    #[test]
    fn test_invalid_regex_is_search_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let err = FallbackBackend.search(&query("[unclosed", tmp.path())).unwrap_err();
        assert!(matches!(err, ServerError::SearchFailed { .. }));
    }
}
