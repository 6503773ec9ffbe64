//! Path normalisation and validation shared by the indexer and the RPC layer.

use std::path::{Path, PathBuf};

/// Normalise a relative path to forward slashes and strip a leading `./`.
pub fn normalize_rel(path: &str) -> String {
    let mut p = path.replace('\\', "/");
    if let Some(stripped) = p.strip_prefix("./") {
        p = stripped.to_string();
    }
    p
}

/// True when the path is absolute on any platform, including a Windows
/// drive-letter prefix that `Path::is_absolute` would miss on Unix hosts.
pub fn is_absolute_like(path: &str) -> bool {
    if Path::new(path).is_absolute() || path.starts_with('/') || path.starts_with('\\') {
        return true;
    }
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// True when the path contains a `..` segment.
pub fn has_parent_traversal(path: &str) -> bool {
    normalize_rel(path).split('/').any(|seg| seg == "..")
}

/// Validate a user-supplied project-relative path and resolve it against the
/// project root, rejecting absolute paths, `..` traversal, and anything that
/// canonicalises outside the root.
pub fn validate_path(project_root: &Path, rel_path: &str) -> Result<PathBuf, String> {
    if rel_path.is_empty() {
        return Err("empty path".to_string());
    }
    if is_absolute_like(rel_path) {
        return Err(format!("absolute paths are not allowed: {rel_path}"));
    }
    if has_parent_traversal(rel_path) {
        return Err(format!("parent traversal is not allowed: {rel_path}"));
    }

    let full = project_root.join(normalize_rel(rel_path));
    let canonical = full
        .canonicalize()
        .map_err(|_| format!("file not found: {rel_path}"))?;
    let root_canonical = project_root
        .canonicalize()
        .map_err(|_| "project root not found".to_string())?;
    if !canonical.starts_with(&root_canonical) {
        return Err(format!("path escapes project root: {rel_path}"));
    }
    Ok(canonical)
}
