//! Integration tests for the JSON-RPC surface via `rpc::dispatch`.
//!
//! Each test builds a fixture project in a temp directory, runs
//! `set_project`, then drives the method under test end to end.

mod helpers;

use helpers::fixtures::{basic_project, search_project};
use helpers::TestHarness;
use serde_json::json;

// ---------------------------------------------------------------------------
// set_project and structure
// ---------------------------------------------------------------------------

#[test]
fn test_cold_index_counts_and_structure() {
    let mut h = TestHarness::new();
    basic_project(&h);

    let result = h.set_project();
    assert_eq!(result["files"], 3, "expected 3 indexed files: {result}");
    assert!(result["search_tool"].is_string());

    let structure = h.call_ok("get_structure", json!({}));
    assert!(structure.get("main.py").is_some());
    assert!(structure.get("config.json").is_some());
    assert!(structure["utils"].get("helper.py").is_some());
    assert_eq!(structure["main.py"]["type"], "file");
}

#[test]
fn test_empty_project_refreshes_to_zero() {
    let mut h = TestHarness::new();
    let result = h.set_project();
    assert_eq!(result["files"], 0);

    let refresh = h.call_ok("refresh", json!({}));
    assert_eq!(refresh["files"], 0);
    assert_eq!(refresh["added"], 0);
}

#[test]
fn test_set_project_rejects_relative_and_missing_paths() {
    let mut h = TestHarness::new();
    let err = h.call_err("set_project", json!({ "path": "relative/path" }));
    assert_eq!(err["data"]["kind"], "path_error");

    let err = h.call_err("set_project", json!({ "path": "/definitely/not/here/xyz" }));
    assert_eq!(err["data"]["kind"], "path_error");
}

// ---------------------------------------------------------------------------
// find_files and file content
// ---------------------------------------------------------------------------

#[test]
fn test_find_files_glob() {
    let mut h = TestHarness::new();
    basic_project(&h);
    h.set_project();

    let result = h.call_ok("find_files", json!({ "pattern": "*.py" }));
    let files: Vec<&str> = result["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(files, vec!["main.py", "utils/helper.py"]);

    let result = h.call_ok("find_files", json!({ "pattern": "utils/*" }));
    assert_eq!(result["files"].as_array().unwrap().len(), 1);
}

#[test]
fn test_get_file_content_and_path_security() {
    let mut h = TestHarness::new();
    basic_project(&h);
    h.set_project();

    let result = h.call_ok("get_file_content", json!({ "path": "utils/helper.py" }));
    assert!(result["content"].as_str().unwrap().contains("def helper()"));

    for bad in ["../outside.txt", "/etc/hosts", "a/../../b", ""] {
        let err = h.call_err("get_file_content", json!({ "path": bad }));
        assert_eq!(err["data"]["kind"], "path_error", "path {bad:?}");
    }
}

#[test]
fn test_get_file_summary() {
    let mut h = TestHarness::new();
    h.write_file(
        "mod.py",
        "import os\nfrom sys import path\n\nclass Loader:\n    def load(self):\n        pass\n\ndef run():\n    pass\n",
    );
    h.set_project();

    let summary = h.call_ok("get_file_summary", json!({ "path": "mod.py" }));
    assert_eq!(summary["extension"], "py");
    assert_eq!(summary["line_count"], 9);
    assert_eq!(summary["classes"], json!(["Loader"]));
    assert_eq!(summary["functions"], json!(["load", "run"]));
    assert!(summary["imports"].as_array().unwrap().contains(&json!("os")));

    // Second call comes from the summary cache and must agree.
    let again = h.call_ok("get_file_summary", json!({ "path": "mod.py" }));
    assert_eq!(summary, again);
}

// ---------------------------------------------------------------------------
// search
// ---------------------------------------------------------------------------

#[test]
fn test_literal_search_matches_expected_lines() {
    let mut h = TestHarness::new();
    search_project(&h);
    h.set_project();

    let result = h.call_ok(
        "search",
        json!({ "pattern": "hello", "case_sensitive": true, "fuzzy": false }),
    );
    let results = &result["results"];
    assert_eq!(results["a.py"], json!([[2, "print(\"hello\")"]]));
    assert_eq!(results["b.py"], json!([[1, "hello = 1"]]));
}

#[test]
fn test_fuzzy_search_word_boundaries() {
    let mut h = TestHarness::new();
    h.write_file("t.py", "testing\nmytest\n");
    h.set_project();

    let fuzzy = h.call_ok("search", json!({ "pattern": "test", "fuzzy": true }));
    assert_eq!(
        fuzzy["results"]["t.py"],
        json!([[1, "testing"], [2, "mytest"]])
    );

    let literal = h.call_ok("search", json!({ "pattern": "test", "fuzzy": false }));
    assert_eq!(literal["results"]["t.py"].as_array().unwrap().len(), 2);

    let missing = h.call_ok("search", json!({ "pattern": "testx", "fuzzy": true }));
    assert!(missing["results"].as_object().unwrap().is_empty());
}

#[test]
fn test_search_pagination() {
    let mut h = TestHarness::new();
    let body: String = (1..=45).map(|i| format!("needle {i}\n")).collect();
    h.write_file("big.txt", &body);
    h.set_project();

    let page = |h: &mut TestHarness, n: usize| {
        h.call_ok(
            "search",
            json!({ "pattern": "needle", "page": n, "page_size": 20 }),
        )
    };
    let count = |v: &serde_json::Value| {
        v["results"]
            .as_object()
            .unwrap()
            .values()
            .map(|lines| lines.as_array().unwrap().len())
            .sum::<usize>()
    };

    let p1 = page(&mut h, 1);
    let p2 = page(&mut h, 2);
    let p3 = page(&mut h, 3);
    assert_eq!(count(&p1), 20);
    assert_eq!(count(&p2), 20);
    assert_eq!(count(&p3), 5);
    assert_eq!(p3["pagination"]["total_pages"], 3);
    assert_eq!(p3["pagination"]["total_matches"], 45);
    assert_eq!(p3["pagination"]["has_next"], false);
    assert_eq!(p1["pagination"]["has_next"], true);
}

#[test]
fn test_search_multiple_returns_every_pattern() {
    let mut h = TestHarness::new();
    search_project(&h);
    h.set_project();

    let result = h.call_ok(
        "search_multiple",
        json!({ "patterns": ["hello", "zzz_not_there"] }),
    );
    let results = result["results"].as_object().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.contains_key("hello"));
    assert!(results.contains_key("zzz_not_there"));
    assert!(results["hello"]["a.py"].is_array());
}

#[test]
fn test_refresh_search_tools_lists_basic() {
    let mut h = TestHarness::new();
    h.set_project();
    let result = h.call_ok("refresh_search_tools", json!({}));
    let available: Vec<&str> = result["available"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(available.contains(&"basic"));
}

// ---------------------------------------------------------------------------
// refresh
// ---------------------------------------------------------------------------

#[test]
fn test_incremental_refresh_counts() {
    let mut h = TestHarness::new();
    basic_project(&h);
    h.set_project();

    // No change: all zeros.
    let refresh = h.call_ok("refresh", json!({}));
    assert_eq!(refresh["added"], 0);
    assert_eq!(refresh["modified"], 0);
    assert_eq!(refresh["deleted"], 0);
    assert_eq!(refresh["files"], 3);

    // Append one byte: exactly one modification.
    h.append_bytes("main.py", b"#");
    let refresh = h.call_ok("refresh", json!({}));
    assert_eq!(refresh["added"], 0);
    assert_eq!(refresh["modified"], 1);
    assert_eq!(refresh["deleted"], 0);
    assert_eq!(refresh["files"], 3);

    // Delete one file.
    h.remove_file("config.json");
    let refresh = h.call_ok("refresh", json!({}));
    assert_eq!(refresh["deleted"], 1);
    assert_eq!(refresh["files"], 2);
}

#[test]
fn test_force_reindex_reprocesses_all() {
    let mut h = TestHarness::new();
    basic_project(&h);
    h.set_project();

    let result = h.call_ok("force_reindex", json!({ "clear_cache": true }));
    assert_eq!(result["added"], 3);
    assert_eq!(result["files"], 3);
}

// ---------------------------------------------------------------------------
// file history
// ---------------------------------------------------------------------------

#[test]
fn test_version_record_and_reconstruct_round_trip() {
    let mut h = TestHarness::new();
    h.write_file("v.txt", "a\nb\n");
    h.set_project();

    let v1 = h.call_ok("record_version", json!({ "path": "v.txt" }));
    assert_eq!(v1["operation"], "create");

    h.write_file("v.txt", "a\nc\n");
    let v2 = h.call_ok("record_version", json!({ "path": "v.txt" }));
    assert_eq!(v2["operation"], "edit");

    let r1 = h.call_ok(
        "reconstruct_version",
        json!({ "path": "v.txt", "version_id": v1["version_id"] }),
    );
    assert_eq!(r1["content"], "a\nb\n");
    let r2 = h.call_ok(
        "reconstruct_version",
        json!({ "path": "v.txt", "version_id": v2["version_id"] }),
    );
    assert_eq!(r2["content"], "a\nc\n");

    let history = h.call_ok("file_history", json!({ "path": "v.txt" }));
    let entries = history["history"].as_array().unwrap();
    // two versions and two diffs (create + edit)
    assert_eq!(entries.len(), 4);
    assert!(entries.iter().any(|e| e["type"] == "diff" && e["operation"] == "edit"));
}

// ---------------------------------------------------------------------------
// operations
// ---------------------------------------------------------------------------

#[test]
fn test_operations_listed_after_refresh() {
    let mut h = TestHarness::new();
    basic_project(&h);
    h.set_project();
    h.call_ok("refresh", json!({}));

    let ops = h.call_ok("get_operations", json!({}));
    let operations = ops["operations"].as_array().unwrap();
    assert!(!operations.is_empty());
    assert!(operations
        .iter()
        .any(|op| op["name"] == "refresh" && op["status"] == "completed"));
}

#[test]
fn test_cancel_unknown_operation() {
    let mut h = TestHarness::new();
    let result = h.call_ok("cancel_operation", json!({ "operation_id": "nope" }));
    assert_eq!(result["cancelled"], false);

    let result = h.call_ok("cancel_all", json!({}));
    assert_eq!(result["cancelled"], 0);
}

// ---------------------------------------------------------------------------
// memory and diagnostics
// ---------------------------------------------------------------------------

#[test]
fn test_memory_stats_and_cleanup() {
    let mut h = TestHarness::new();
    basic_project(&h);
    h.set_project();

    let cleanup = h.call_ok("memory_cleanup", json!({}));
    assert!(cleanup["snapshot"]["rss_mb"].as_f64().unwrap() > 0.0);

    let stats = h.call_ok("memory_stats", json!({}));
    assert!(stats["limits"]["soft_limit_mb"].is_number());
    assert!(stats["content"]["max_loaded_files"].is_number());
}

#[test]
fn test_memory_limits_update() {
    let mut h = TestHarness::new();
    let limits = h.call_ok("memory_limits", json!({ "soft_limit_mb": 123.0 }));
    assert_eq!(limits["soft_limit_mb"], 123.0);
    // untouched fields keep their defaults
    assert_eq!(limits["hard_limit_mb"], 1024.0);
}

#[test]
fn test_ignore_patterns_and_settings_info() {
    let mut h = TestHarness::new();
    basic_project(&h);
    h.write_file(".gitignore", "generated/\n");
    h.set_project();

    let patterns = h.call_ok("get_ignore_patterns", json!({}));
    assert_eq!(patterns["sources"]["gitignore_exists"], true);
    assert!(patterns["patterns"]
        .as_array()
        .unwrap()
        .contains(&json!("generated/")));

    let info = h.call_ok("get_settings_info", json!({}));
    assert_eq!(info["storage"], "sqlite");
    assert_eq!(info["tracker"]["total_files"], 3);
}

// ---------------------------------------------------------------------------
// persistence across sessions
// ---------------------------------------------------------------------------

#[test]
fn test_second_set_project_loads_persisted_index() {
    let mut h = TestHarness::new();
    basic_project(&h);
    let first = h.set_project();
    assert_eq!(first["files"], 3);

    // A fresh service over the same root must come up from the persisted
    // index without a rebuild.
    let second = h.set_project();
    assert_eq!(second["files"], 3);

    let structure = h.call_ok("get_structure", json!({}));
    assert!(structure["utils"].get("helper.py").is_some());
}
