//! File version history: pre-edit capture, post-edit recording with unified
//! diffs, and reconstruction of any version by replaying diffs over the
//! nearest earlier full version.
//!
//! Diff creation and application both go through `diffy`; a malformed or
//! inapplicable patch is an integrity error, never a silent best-effort.

use crate::content::hash_content;
use crate::errors::{Result, ServerError};
use crate::store::{FileDiff, FileVersion, ProjectStore};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Operation recorded with a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    Create,
    Edit,
    Delete,
}

impl ChangeOperation {
    fn as_str(self) -> &'static str {
        match self {
            ChangeOperation::Create => "create",
            ChangeOperation::Edit => "edit",
            ChangeOperation::Delete => "delete",
        }
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub struct ChangeHistory {
    store: Arc<dyn ProjectStore>,
}

impl ChangeHistory {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }

    /// Store a full content snapshot and return its version id.
    pub fn record_version(&self, file_path: &str, content: &str) -> Result<String> {
        let version = FileVersion {
            version_id: new_id(),
            file_path: file_path.to_string(),
            content: content.to_string(),
            sha256: hash_content(content),
            timestamp: chrono::Utc::now().to_rfc3339(),
            size: content.len() as u64,
        };
        self.store.insert_version(&version)?;
        debug!(path = file_path, version = version.version_id.as_str(), "Recorded file version");
        Ok(version.version_id)
    }

    /// Store the unified diff between two recorded versions.
    pub fn record_diff(
        &self,
        file_path: &str,
        previous_version_id: Option<&str>,
        current_version_id: &str,
        old_content: &str,
        new_content: &str,
        operation: ChangeOperation,
    ) -> Result<String> {
        let patch = diffy::create_patch(old_content, new_content);
        let diff = FileDiff {
            diff_id: new_id(),
            file_path: file_path.to_string(),
            previous_version_id: previous_version_id.map(|s| s.to_string()),
            current_version_id: current_version_id.to_string(),
            diff_text: patch.to_string(),
            diff_kind: "unified".to_string(),
            operation: operation.as_str().to_string(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        self.store.insert_diff(&diff)?;
        Ok(diff.diff_id)
    }

    /// Record the current state of a file as a new version, diffed against
    /// the previous version when one exists. Returns the new version id and
    /// the operation that was recorded.
    pub fn record_change(
        &self,
        file_path: &str,
        new_content: &str,
    ) -> Result<(String, ChangeOperation)> {
        let previous = self
            .store
            .versions_for_path(file_path)?
            .into_iter()
            .last();

        let version_id = self.record_version(file_path, new_content)?;
        let operation = match &previous {
            None => ChangeOperation::Create,
            Some(_) if new_content.is_empty() => ChangeOperation::Delete,
            Some(_) => ChangeOperation::Edit,
        };
        let (previous_id, old_content) = match &previous {
            Some(v) => (Some(v.version_id.as_str()), v.content.as_str()),
            None => (None, ""),
        };
        if previous.is_none() || old_content != new_content {
            self.record_diff(
                file_path,
                previous_id,
                &version_id,
                old_content,
                new_content,
                operation,
            )?;
        }
        Ok((version_id, operation))
    }

    /// Interleaved version/diff timeline for a path, ordered by timestamp.
    pub fn history(&self, file_path: &str) -> Result<Vec<serde_json::Value>> {
        let mut entries: Vec<(String, serde_json::Value)> = Vec::new();
        for v in self.store.versions_for_path(file_path)? {
            entries.push((
                v.timestamp.clone(),
                json!({
                    "type": "version",
                    "version_id": v.version_id,
                    "sha256": v.sha256,
                    "size": v.size,
                    "timestamp": v.timestamp,
                }),
            ));
        }
        for d in self.store.diffs_for_path(file_path)? {
            entries.push((
                d.timestamp.clone(),
                json!({
                    "type": "diff",
                    "diff_id": d.diff_id,
                    "previous_version_id": d.previous_version_id,
                    "current_version_id": d.current_version_id,
                    "operation": d.operation,
                    "diff_kind": d.diff_kind,
                    "timestamp": d.timestamp,
                }),
            ));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries.into_iter().map(|(_, v)| v).collect())
    }

    /// Content of a version: directly when the full snapshot exists,
    /// otherwise by replaying diffs from the nearest earlier full version.
    pub fn reconstruct(&self, file_path: &str, version_id: &str) -> Result<Option<String>> {
        if let Some(version) = self.store.get_version(version_id)? {
            return Ok(Some(version.content));
        }

        let versions = self.store.versions_for_path(file_path)?;
        let diffs = self.store.diffs_for_path(file_path)?;

        let target_timestamp = diffs
            .iter()
            .find(|d| d.current_version_id == version_id)
            .map(|d| d.timestamp.clone());
        let Some(target_timestamp) = target_timestamp else {
            return Ok(None);
        };

        // Nearest full version at or before the target.
        let base = versions
            .iter()
            .filter(|v| v.timestamp <= target_timestamp)
            .last();
        let Some(base) = base else {
            return Ok(None);
        };

        let mut content = base.content.clone();
        for diff in diffs
            .iter()
            .filter(|d| d.timestamp > base.timestamp && d.timestamp <= target_timestamp)
        {
            content = apply_unified_diff(&content, &diff.diff_text)?;
            if diff.current_version_id == version_id {
                return Ok(Some(content));
            }
        }
        Ok(Some(content))
    }
}

/// Apply a stored unified diff. Malformed or inapplicable hunks are an
/// integrity error.
pub fn apply_unified_diff(base: &str, diff_text: &str) -> Result<String> {
    let patch = diffy::Patch::from_str(diff_text)
        .map_err(|e| ServerError::Integrity(format!("malformed unified diff: {e}")))?;
    diffy::apply(base, &patch)
        .map_err(|e| ServerError::Integrity(format!("diff does not apply: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn history() -> ChangeHistory {
        ChangeHistory::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_record_and_reconstruct_direct() {
        let h = history();
        let (v1, op) = h.record_change("a.py", "a\nb\n").unwrap();
        assert_eq!(op, ChangeOperation::Create);
        let (v2, op) = h.record_change("a.py", "a\nc\n").unwrap();
        assert_eq!(op, ChangeOperation::Edit);

        assert_eq!(h.reconstruct("a.py", &v1).unwrap().unwrap(), "a\nb\n");
        assert_eq!(h.reconstruct("a.py", &v2).unwrap().unwrap(), "a\nc\n");
    }

    #[test]
    fn test_recorded_diff_applies_to_previous_version() {
        let h = history();
        let old = "a\nb\n";
        let new = "a\nc\n";
        h.record_change("a.py", old).unwrap();
        h.record_change("a.py", new).unwrap();

        let diffs = h.store.diffs_for_path("a.py").unwrap();
        // create + edit
        assert_eq!(diffs.len(), 2);
        let edit = diffs.iter().find(|d| d.operation == "edit").unwrap();
        assert_eq!(apply_unified_diff(old, &edit.diff_text).unwrap(), new);
    }

    #[test]
    fn test_unchanged_content_records_no_diff() {
        let h = history();
        h.record_change("a.py", "same\n").unwrap();
        h.record_change("a.py", "same\n").unwrap();
        let diffs = h.store.diffs_for_path("a.py").unwrap();
        assert_eq!(diffs.len(), 1);
    }

    #[test]
    fn test_delete_records_empty_content() {
        let h = history();
        h.record_change("a.py", "gone\n").unwrap();
        let (_, op) = h.record_change("a.py", "").unwrap();
        assert_eq!(op, ChangeOperation::Delete);
    }

    #[test]
    fn test_malformed_diff_is_integrity_error() {
        let err = apply_unified_diff("x\n", "@@ not a diff @@").unwrap_err();
        assert!(matches!(err, ServerError::Integrity(_)));
    }

    #[test]
    fn test_history_timeline_ordered() {
        let h = history();
        h.record_change("a.py", "1\n").unwrap();
        h.record_change("a.py", "2\n").unwrap();
        let timeline = h.history("a.py").unwrap();
        assert!(timeline.len() >= 4);
        let timestamps: Vec<&str> = timeline
            .iter()
            .map(|e| e["timestamp"].as_str().unwrap())
            .collect();
        let mut sorted = timestamps.clone();
        sorted.sort();
        assert_eq!(timestamps, sorted);
    }

    #[test]
    fn test_unknown_version_returns_none() {
        let h = history();
        h.record_change("a.py", "x\n").unwrap();
        assert_eq!(h.reconstruct("a.py", "does-not-exist").unwrap(), None);
    }
}
