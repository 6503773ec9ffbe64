//! JSON-RPC 2.0 over stdio: one request object per line, one response per
//! request. Every method resolves to a structured success payload or a
//! structured error `{kind, message, details?}` carried in the error data.

use crate::errors::{Result, ServerError};
use crate::service::ProjectService;
use serde_json::{json, Value};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use tracing::{debug, error};

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const SERVER_ERROR: i64 = -32000;

// ---------------------------------------------------------------------------
// Parameter helpers
// ---------------------------------------------------------------------------

fn req_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ServerError::Config(format!("missing required parameter '{key}'")))
}

fn opt_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn opt_bool(params: &Value, key: &str, default: bool) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

fn opt_usize(params: &Value, key: &str, default: usize) -> usize {
    params
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(default)
}

fn opt_f64(params: &Value, key: &str) -> Option<f64> {
    params.get(key).and_then(|v| v.as_f64())
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

fn call_method(service: &ProjectService, method: &str, params: &Value) -> Result<Value> {
    match method {
        "set_project" => service.set_project(req_str(params, "path")?),
        "get_file_content" => service.get_file_content(req_str(params, "path")?),
        "get_structure" => service.get_structure(),
        "find_files" => service.find_files(req_str(params, "pattern")?),
        "get_file_summary" => service.get_file_summary(req_str(params, "path")?),
        "search" => service.search(
            req_str(params, "pattern")?,
            opt_bool(params, "case_sensitive", true),
            opt_usize(params, "context_lines", 0),
            opt_str(params, "file_pattern"),
            opt_bool(params, "fuzzy", false),
            opt_usize(params, "page", 1),
            params
                .get("page_size")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize),
        ),
        "search_multiple" => {
            let patterns: Vec<String> = params
                .get("patterns")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .ok_or_else(|| {
                    ServerError::Config("missing required parameter 'patterns'".to_string())
                })?;
            service.search_multiple(
                &patterns,
                opt_bool(params, "case_sensitive", true),
                opt_usize(params, "context_lines", 0),
                opt_str(params, "file_pattern"),
                opt_bool(params, "fuzzy", false),
            )
        }
        "refresh" => service.refresh(),
        "force_reindex" => service.force_reindex(opt_bool(params, "clear_cache", true)),
        "record_version" => service.record_version(req_str(params, "path")?),
        "file_history" => service.file_history(req_str(params, "path")?),
        "reconstruct_version" => service.reconstruct_version(
            req_str(params, "path")?,
            req_str(params, "version_id")?,
        ),
        "get_operations" => service.get_operations(),
        "cancel_operation" => service.cancel_operation(
            req_str(params, "operation_id")?,
            opt_str(params, "reason")
                .as_deref()
                .unwrap_or("cancelled by user"),
        ),
        "cancel_all" => service.cancel_all(
            opt_str(params, "reason")
                .as_deref()
                .unwrap_or("cancelled by user"),
        ),
        "refresh_search_tools" => service.refresh_search_tools(),
        "memory_stats" => service.memory_stats(),
        "memory_cleanup" => service.memory_cleanup(),
        "memory_limits" => service.memory_limits(
            opt_f64(params, "soft_limit_mb"),
            opt_f64(params, "hard_limit_mb"),
            opt_f64(params, "gc_threshold_mb"),
            opt_f64(params, "spill_threshold_mb"),
        ),
        "memory_export" => service.memory_export(opt_str(params, "path").as_deref()),
        "get_ignore_patterns" => service.get_ignore_patterns(),
        "get_settings_info" => service.get_settings_info(),
        _ => Err(ServerError::Config(format!("unknown method '{method}'"))),
    }
}

fn error_object(err: &ServerError) -> Value {
    let code = match err {
        ServerError::Config(msg) if msg.starts_with("missing required parameter") => {
            INVALID_PARAMS
        }
        ServerError::Config(msg) if msg.starts_with("unknown method") => METHOD_NOT_FOUND,
        _ => SERVER_ERROR,
    };
    json!({
        "code": code,
        "message": err.to_string(),
        "data": {
            "kind": err.kind(),
            "details": match err {
                ServerError::SearchFailed { tool, stderr } => {
                    json!({ "tool": tool, "stderr": stderr })
                }
                ServerError::Timeout { tool, seconds } => {
                    json!({ "tool": tool, "timeout_secs": seconds })
                }
                _ => Value::Null,
            },
        },
    })
}

/// Handle one parsed JSON-RPC request. Returns `None` for notifications
/// (requests without an id).
pub fn dispatch(service: &ProjectService, request: &Value) -> Option<Value> {
    let id = request.get("id").cloned();
    let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let empty = json!({});
    let params = request.get("params").unwrap_or(&empty);

    debug!(method = method, "RPC request");
    let response = match call_method(service, method, params) {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(err) => {
            json!({ "jsonrpc": "2.0", "id": id, "error": error_object(&err) })
        }
    };

    // Notifications get no response.
    request.get("id").map(|_| response)
}

/// Serve JSON-RPC over stdio until EOF.
pub fn run_stdio(service: Arc<ProjectService>) {
    let stdin = io::stdin();
    let stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Value>(&line) {
            Ok(request) => dispatch(&service, &request),
            Err(e) => Some(json!({
                "jsonrpc": "2.0",
                "id": Value::Null,
                "error": { "code": PARSE_ERROR, "message": format!("parse error: {e}") },
            })),
        };

        if let Some(response) = response {
            let mut out = stdout.lock();
            if writeln!(out, "{response}").and_then(|_| out.flush()).is_err() {
                break;
            }
        }
    }

    service.shutdown();
}
