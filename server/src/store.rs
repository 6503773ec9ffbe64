//! Persistent key-value store with optional full-text search and the file
//! history tables, backed by SQLite. When SQLite cannot be initialised the
//! caller gets an in-memory equivalent behind the same trait and a logged
//! `BackendUnavailable`.

use crate::errors::{Result, ServerError};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Values and rows
// ---------------------------------------------------------------------------

/// A stored value is either plain text (FTS-indexed) or structured JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    Text(String),
    Json(serde_json::Value),
}

impl StoredValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StoredValue::Text(s) => Some(s),
            StoredValue::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> serde_json::Value {
        match self {
            StoredValue::Text(s) => serde_json::Value::String(s.clone()),
            StoredValue::Json(v) => v.clone(),
        }
    }

    fn type_tag(&self) -> &'static str {
        match self {
            StoredValue::Text(_) => "text",
            StoredValue::Json(_) => "json",
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        match self {
            StoredValue::Text(s) => s.as_bytes().to_vec(),
            StoredValue::Json(v) => serde_json::to_vec(v).unwrap_or_default(),
        }
    }

    fn from_row(bytes: Vec<u8>, type_tag: &str) -> StoredValue {
        if type_tag == "text" {
            StoredValue::Text(String::from_utf8_lossy(&bytes).into_owned())
        } else {
            match serde_json::from_slice(&bytes) {
                Ok(v) => StoredValue::Json(v),
                Err(_) => StoredValue::Text(String::from_utf8_lossy(&bytes).into_owned()),
            }
        }
    }
}

/// An immutable captured version of a file's content.
#[derive(Debug, Clone)]
pub struct FileVersion {
    pub version_id: String,
    pub file_path: String,
    pub content: String,
    pub sha256: String,
    pub timestamp: String,
    pub size: u64,
}

/// An immutable unified diff between two versions.
#[derive(Debug, Clone)]
pub struct FileDiff {
    pub diff_id: String,
    pub file_path: String,
    pub previous_version_id: Option<String>,
    pub current_version_id: String,
    pub diff_text: String,
    pub diff_kind: String,
    pub operation: String,
    pub details: Option<String>,
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

pub trait KeyValueStore: Send + Sync {
    fn put(&self, key: &str, value: StoredValue) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<StoredValue>>;
    fn delete(&self, key: &str) -> Result<bool>;
    fn exists(&self, key: &str) -> Result<bool>;
    /// Keys, optionally filtered by a glob.
    fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>>;
    fn items(&self, pattern: Option<&str>) -> Result<Vec<(String, StoredValue)>>;
    fn len(&self) -> Result<usize>;
    fn clear(&self) -> Result<()>;
    /// Make everything written so far durable.
    fn flush(&self) -> Result<()>;
    /// Ranked full-text search over text values. Empty when FTS is off.
    fn search(&self, query: &str) -> Result<Vec<(String, String)>>;
}

pub trait HistoryStore: Send + Sync {
    fn insert_version(&self, version: &FileVersion) -> Result<()>;
    fn get_version(&self, version_id: &str) -> Result<Option<FileVersion>>;
    fn versions_for_path(&self, file_path: &str) -> Result<Vec<FileVersion>>;
    fn insert_diff(&self, diff: &FileDiff) -> Result<()>;
    fn diffs_for_path(&self, file_path: &str) -> Result<Vec<FileDiff>>;
}

pub trait ProjectStore: KeyValueStore + HistoryStore {
    fn backend_name(&self) -> &'static str;

    /// View this store through its key-value face.
    fn as_kv(&self) -> &dyn KeyValueStore;
}

/// Open the SQLite store at `path`, falling back to the in-memory store when
/// initialisation fails.
pub fn open_store(path: &Path, enable_fts: bool) -> std::sync::Arc<dyn ProjectStore> {
    match SqliteStore::open(path, enable_fts) {
        Ok(store) => std::sync::Arc::new(store),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Storage backend unavailable, using in-memory fallback");
            std::sync::Arc::new(MemoryStore::new())
        }
    }
}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    conn: Mutex<Connection>,
    fts_enabled: bool,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value BLOB,
    value_type TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS file_versions (
    version_id TEXT PRIMARY KEY,
    file_path TEXT NOT NULL,
    content BLOB NOT NULL,
    hash TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    size INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS file_diffs (
    diff_id TEXT PRIMARY KEY,
    file_path TEXT NOT NULL,
    previous_version_id TEXT,
    current_version_id TEXT NOT NULL,
    diff_content BLOB NOT NULL,
    diff_type TEXT NOT NULL,
    operation_type TEXT NOT NULL,
    operation_details TEXT,
    timestamp TEXT NOT NULL,
    FOREIGN KEY (previous_version_id) REFERENCES file_versions(version_id),
    FOREIGN KEY (current_version_id) REFERENCES file_versions(version_id)
);
";

const FTS_SCHEMA: &str = "
CREATE VIRTUAL TABLE IF NOT EXISTS kv_fts USING fts5(
    key, value_text, content='kv_store', content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS kv_store_ai AFTER INSERT ON kv_store BEGIN
    INSERT INTO kv_fts(rowid, key, value_text)
    VALUES (new.rowid, new.key,
            CASE WHEN new.value_type = 'text' THEN new.value ELSE '' END);
END;

CREATE TRIGGER IF NOT EXISTS kv_store_ad AFTER DELETE ON kv_store BEGIN
    INSERT INTO kv_fts(kv_fts, rowid, key, value_text)
    VALUES ('delete', old.rowid, old.key,
            CASE WHEN old.value_type = 'text' THEN old.value ELSE '' END);
END;

CREATE TRIGGER IF NOT EXISTS kv_store_au AFTER UPDATE ON kv_store BEGIN
    INSERT INTO kv_fts(kv_fts, rowid, key, value_text)
    VALUES ('delete', old.rowid, old.key,
            CASE WHEN old.value_type = 'text' THEN old.value ELSE '' END);
    INSERT INTO kv_fts(rowid, key, value_text)
    VALUES (new.rowid, new.key,
            CASE WHEN new.value_type = 'text' THEN new.value ELSE '' END);
END;
";

fn db_err(e: rusqlite::Error) -> ServerError {
    if let rusqlite::Error::SqliteFailure(code, _) = &e {
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            return ServerError::Integrity(e.to_string());
        }
    }
    ServerError::BackendUnavailable(e.to_string())
}

impl SqliteStore {
    pub fn open(path: &Path, enable_fts: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| ServerError::BackendUnavailable(e.to_string()))?;
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        let mut fts_enabled = false;
        if enable_fts {
            match conn.execute_batch(FTS_SCHEMA) {
                Ok(()) => fts_enabled = true,
                Err(e) => {
                    warn!(error = %e, "Full-text search unavailable, continuing without it")
                }
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            fts_enabled,
        })
    }

    pub fn fts_enabled(&self) -> bool {
        self.fts_enabled
    }
}

impl KeyValueStore for SqliteStore {
    fn put(&self, key: &str, value: StoredValue) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO kv_store (key, value, value_type) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 value_type = excluded.value_type,
                 updated_at = CURRENT_TIMESTAMP",
            params![key, value.to_bytes(), value.type_tag()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value, value_type FROM kv_store WHERE key = ?1",
            params![key],
            |row| {
                let bytes: Vec<u8> = row.get(0)?;
                let type_tag: String = row.get(1)?;
                Ok(StoredValue::from_row(bytes, &type_tag))
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn
            .execute("DELETE FROM kv_store WHERE key = ?1", params![key])
            .map_err(db_err)?;
        Ok(rows > 0)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count > 0)
    }

    fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut out = Vec::new();
        match pattern {
            Some(glob) => {
                let mut stmt = conn
                    .prepare("SELECT key FROM kv_store WHERE key GLOB ?1 ORDER BY key")
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![glob], |row| row.get::<_, String>(0))
                    .map_err(db_err)?;
                for row in rows {
                    out.push(row.map_err(db_err)?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare("SELECT key FROM kv_store ORDER BY key")
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(db_err)?;
                for row in rows {
                    out.push(row.map_err(db_err)?);
                }
            }
        }
        Ok(out)
    }

    fn items(&self, pattern: Option<&str>) -> Result<Vec<(String, StoredValue)>> {
        let conn = self.conn.lock().unwrap();
        let sql = match pattern {
            Some(_) => {
                "SELECT key, value, value_type FROM kv_store WHERE key GLOB ?1 ORDER BY key"
            }
            None => "SELECT key, value, value_type FROM kv_store ORDER BY key",
        };
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            let key: String = row.get(0)?;
            let bytes: Vec<u8> = row.get(1)?;
            let type_tag: String = row.get(2)?;
            Ok((key, StoredValue::from_row(bytes, &type_tag)))
        };
        let mut out = Vec::new();
        match pattern {
            Some(glob) => {
                let rows = stmt.query_map(params![glob], map_row).map_err(db_err)?;
                for row in rows {
                    out.push(row.map_err(db_err)?);
                }
            }
            None => {
                let rows = stmt.query_map([], map_row).map_err(db_err)?;
                for row in rows {
                    out.push(row.map_err(db_err)?);
                }
            }
        }
        Ok(out)
    }

    fn len(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM kv_store", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(count as usize)
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM kv_store", []).map_err(db_err)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        // Writes commit per-statement under the default journal mode; this
        // just gives SQLite a chance to refresh its query planner stats.
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA optimize").map_err(db_err)?;
        Ok(())
    }

    fn search(&self, query: &str) -> Result<Vec<(String, String)>> {
        if !self.fts_enabled {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT key, value_text FROM kv_fts WHERE kv_fts MATCH ?1 ORDER BY bm25(kv_fts)",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![query], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)?);
        }
        Ok(out)
    }
}

impl HistoryStore for SqliteStore {
    fn insert_version(&self, v: &FileVersion) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO file_versions (version_id, file_path, content, hash, timestamp, size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                v.version_id,
                v.file_path,
                v.content.as_bytes(),
                v.sha256,
                v.timestamp,
                v.size as i64
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn get_version(&self, version_id: &str) -> Result<Option<FileVersion>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT version_id, file_path, content, hash, timestamp, size
             FROM file_versions WHERE version_id = ?1",
            params![version_id],
            version_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    fn versions_for_path(&self, file_path: &str) -> Result<Vec<FileVersion>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT version_id, file_path, content, hash, timestamp, size
                 FROM file_versions WHERE file_path = ?1 ORDER BY timestamp",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![file_path], version_from_row)
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)?);
        }
        Ok(out)
    }

    fn insert_diff(&self, d: &FileDiff) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO file_diffs (diff_id, file_path, previous_version_id,
                 current_version_id, diff_content, diff_type, operation_type,
                 operation_details, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                d.diff_id,
                d.file_path,
                d.previous_version_id,
                d.current_version_id,
                d.diff_text.as_bytes(),
                d.diff_kind,
                d.operation,
                d.details,
                d.timestamp
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn diffs_for_path(&self, file_path: &str) -> Result<Vec<FileDiff>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT diff_id, file_path, previous_version_id, current_version_id,
                        diff_content, diff_type, operation_type, operation_details, timestamp
                 FROM file_diffs WHERE file_path = ?1 ORDER BY timestamp",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![file_path], diff_from_row)
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)?);
        }
        Ok(out)
    }
}

fn version_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileVersion> {
    let content: Vec<u8> = row.get(2)?;
    Ok(FileVersion {
        version_id: row.get(0)?,
        file_path: row.get(1)?,
        content: String::from_utf8_lossy(&content).into_owned(),
        sha256: row.get(3)?,
        timestamp: row.get(4)?,
        size: row.get::<_, i64>(5)? as u64,
    })
}

fn diff_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileDiff> {
    let diff: Vec<u8> = row.get(4)?;
    Ok(FileDiff {
        diff_id: row.get(0)?,
        file_path: row.get(1)?,
        previous_version_id: row.get(2)?,
        current_version_id: row.get(3)?,
        diff_text: String::from_utf8_lossy(&diff).into_owned(),
        diff_kind: row.get(5)?,
        operation: row.get(6)?,
        details: row.get(7)?,
        timestamp: row.get(8)?,
    })
}

impl ProjectStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn as_kv(&self) -> &dyn KeyValueStore {
        self
    }
}

// ---------------------------------------------------------------------------
// In-memory fallback
// ---------------------------------------------------------------------------

struct MemEntry {
    value: StoredValue,
}

#[derive(Default)]
struct MemHistory {
    versions: BTreeMap<String, FileVersion>,
    diffs: Vec<FileDiff>,
}

/// In-memory stand-in used when SQLite cannot be initialised. Same contracts,
/// no durability.
pub struct MemoryStore {
    map: RwLock<BTreeMap<String, MemEntry>>,
    history: RwLock<MemHistory>,
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Using in-memory key-value store");
        Self {
            map: RwLock::new(BTreeMap::new()),
            history: RwLock::new(MemHistory::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn glob_matches(pattern: &str, key: &str) -> bool {
    match globset::Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(key),
        Err(_) => false,
    }
}

impl KeyValueStore for MemoryStore {
    fn put(&self, key: &str, value: StoredValue) -> Result<()> {
        self.map
            .write()
            .unwrap()
            .insert(key.to_string(), MemEntry { value });
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        Ok(self.map.read().unwrap().get(key).map(|e| e.value.clone()))
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.map.write().unwrap().remove(key).is_some())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.map.read().unwrap().contains_key(key))
    }

    fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        let map = self.map.read().unwrap();
        Ok(map
            .keys()
            .filter(|k| pattern.map_or(true, |p| glob_matches(p, k)))
            .cloned()
            .collect())
    }

    fn items(&self, pattern: Option<&str>) -> Result<Vec<(String, StoredValue)>> {
        let map = self.map.read().unwrap();
        Ok(map
            .iter()
            .filter(|(k, _)| pattern.map_or(true, |p| glob_matches(p, k)))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.map.read().unwrap().len())
    }

    fn clear(&self) -> Result<()> {
        self.map.write().unwrap().clear();
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn search(&self, query: &str) -> Result<Vec<(String, String)>> {
        let needle = query.to_lowercase();
        let map = self.map.read().unwrap();
        let mut scored: Vec<(usize, String, String)> = map
            .iter()
            .filter_map(|(k, e)| {
                let text = e.value.as_text()?;
                let count = text.to_lowercase().matches(&needle).count();
                if count > 0 {
                    Some((count, k.clone(), text.to_string()))
                } else {
                    None
                }
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(scored.into_iter().map(|(_, k, v)| (k, v)).collect())
    }
}

impl HistoryStore for MemoryStore {
    fn insert_version(&self, v: &FileVersion) -> Result<()> {
        self.history
            .write()
            .unwrap()
            .versions
            .insert(v.version_id.clone(), v.clone());
        Ok(())
    }

    fn get_version(&self, version_id: &str) -> Result<Option<FileVersion>> {
        Ok(self.history.read().unwrap().versions.get(version_id).cloned())
    }

    fn versions_for_path(&self, file_path: &str) -> Result<Vec<FileVersion>> {
        let history = self.history.read().unwrap();
        let mut out: Vec<FileVersion> = history
            .versions
            .values()
            .filter(|v| v.file_path == file_path)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(out)
    }

    fn insert_diff(&self, d: &FileDiff) -> Result<()> {
        let mut history = self.history.write().unwrap();
        if !history.versions.contains_key(&d.current_version_id) {
            return Err(ServerError::Integrity(format!(
                "diff references missing version {}",
                d.current_version_id
            )));
        }
        if let Some(prev) = &d.previous_version_id {
            if !history.versions.contains_key(prev) {
                return Err(ServerError::Integrity(format!(
                    "diff references missing previous version {prev}"
                )));
            }
        }
        history.diffs.push(d.clone());
        Ok(())
    }

    fn diffs_for_path(&self, file_path: &str) -> Result<Vec<FileDiff>> {
        let history = self.history.read().unwrap();
        let mut out: Vec<FileDiff> = history
            .diffs
            .iter()
            .filter(|d| d.file_path == file_path)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(out)
    }
}

impl ProjectStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn as_kv(&self) -> &dyn KeyValueStore {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_store() -> (tempfile::TempDir, SqliteStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&tmp.path().join("cache.db"), true).unwrap();
        (tmp, store)
    }

    #[test]
    fn test_put_get_round_trip() {
        let (_tmp, store) = sqlite_store();
        store
            .put("a", StoredValue::Text("hello".to_string()))
            .unwrap();
        store
            .put("b", StoredValue::Json(serde_json::json!({"n": 1})))
            .unwrap();

        assert_eq!(
            store.get("a").unwrap(),
            Some(StoredValue::Text("hello".to_string()))
        );
        assert_eq!(
            store.get("b").unwrap(),
            Some(StoredValue::Json(serde_json::json!({"n": 1})))
        );
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn test_put_replaces_and_delete() {
        let (_tmp, store) = sqlite_store();
        store.put("k", StoredValue::Text("v1".to_string())).unwrap();
        store.put("k", StoredValue::Text("v2".to_string())).unwrap();
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(
            store.get("k").unwrap(),
            Some(StoredValue::Text("v2".to_string()))
        );
        assert!(store.delete("k").unwrap());
        assert!(!store.delete("k").unwrap());
        assert!(!store.exists("k").unwrap());
    }

    #[test]
    fn test_keys_with_glob() {
        let (_tmp, store) = sqlite_store();
        for key in ["summary:a.py", "summary:b.py", "other:c"] {
            store.put(key, StoredValue::Text("x".to_string())).unwrap();
        }
        let keys = store.keys(Some("summary:*")).unwrap();
        assert_eq!(keys, vec!["summary:a.py", "summary:b.py"]);
        assert_eq!(store.keys(None).unwrap().len(), 3);
    }

    #[test]
    fn test_fts_search_ranks_text_values() {
        let (_tmp, store) = sqlite_store();
        if !store.fts_enabled() {
            return;
        }
        store
            .put("doc1", StoredValue::Text("parser for config files".to_string()))
            .unwrap();
        store
            .put("doc2", StoredValue::Text("network layer".to_string()))
            .unwrap();
        let hits = store.search("parser").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "doc1");

        // deletion must drop the document from the index
        store.delete("doc1").unwrap();
        assert!(store.search("parser").unwrap().is_empty());
    }

    #[test]
    fn test_history_foreign_key_enforced() {
        let (_tmp, store) = sqlite_store();
        let diff = FileDiff {
            diff_id: "d1".to_string(),
            file_path: "a.py".to_string(),
            previous_version_id: None,
            current_version_id: "missing".to_string(),
            diff_text: String::new(),
            diff_kind: "unified".to_string(),
            operation: "create".to_string(),
            details: None,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        };
        let err = store.insert_diff(&diff).unwrap_err();
        assert!(matches!(err, ServerError::Integrity(_)));
    }

    #[test]
    fn test_history_round_trip() {
        let (_tmp, store) = sqlite_store();
        let v = FileVersion {
            version_id: "v1".to_string(),
            file_path: "a.py".to_string(),
            content: "x = 1\n".to_string(),
            sha256: "h".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            size: 6,
        };
        store.insert_version(&v).unwrap();
        let diff = FileDiff {
            diff_id: "d1".to_string(),
            file_path: "a.py".to_string(),
            previous_version_id: None,
            current_version_id: "v1".to_string(),
            diff_text: "+x = 1\n".to_string(),
            diff_kind: "unified".to_string(),
            operation: "create".to_string(),
            details: None,
            timestamp: "2026-01-01T00:00:01Z".to_string(),
        };
        store.insert_diff(&diff).unwrap();

        assert_eq!(store.get_version("v1").unwrap().unwrap().content, "x = 1\n");
        assert_eq!(store.versions_for_path("a.py").unwrap().len(), 1);
        assert_eq!(store.diffs_for_path("a.py").unwrap().len(), 1);
    }

    #[test]
    fn test_memory_fallback_contracts() {
        let store = MemoryStore::new();
        store.put("x", StoredValue::Text("needle here".to_string())).unwrap();
        store.put("y", StoredValue::Text("nothing".to_string())).unwrap();
        assert!(store.exists("x").unwrap());
        assert_eq!(store.search("needle").unwrap()[0].0, "x");
        assert_eq!(store.keys(Some("x*")).unwrap(), vec!["x"]);
        store.clear().unwrap();
        assert_eq!(store.len().unwrap(), 0);
    }
}
