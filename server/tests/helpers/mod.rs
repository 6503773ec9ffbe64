//! Test harness: a fixture project in a temp directory plus a service
//! driven through the JSON-RPC dispatcher.

pub mod fixtures;

use code_index_server::rpc;
use code_index_server::service::ProjectService;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct TestHarness {
    tmp: tempfile::TempDir,
    pub service: Arc<ProjectService>,
    next_id: u64,
}

impl TestHarness {
    /// Empty project with deterministic settings: the in-process search
    /// backend and a small worker pool.
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().expect("create temp project");
        std::fs::write(
            tmp.path().join(".code-index.toml"),
            "[search]\npreferred_tool = \"basic\"\n\n[performance]\nmax_workers = 2\n",
        )
        .expect("write project config");

        // Point the global config somewhere that cannot exist so host
        // machines never leak configuration into tests.
        let service = ProjectService::new(Some(PathBuf::from("/nonexistent/code-index.toml")));
        Self {
            tmp,
            service,
            next_id: 0,
        }
    }

    pub fn root(&self) -> &Path {
        self.tmp.path()
    }

    pub fn write_file(&self, rel: &str, content: &str) {
        let path = self.tmp.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create fixture dirs");
        }
        std::fs::write(path, content).expect("write fixture file");
    }

    pub fn remove_file(&self, rel: &str) {
        std::fs::remove_file(self.tmp.path().join(rel)).expect("remove fixture file");
    }

    pub fn append_bytes(&self, rel: &str, bytes: &[u8]) {
        let path = self.tmp.path().join(rel);
        let mut content = std::fs::read(&path).expect("read fixture file");
        content.extend_from_slice(bytes);
        std::fs::write(path, content).expect("append fixture file");
    }

    /// Send one request through the dispatcher, returning the full response.
    pub fn call(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let request = json!({
            "jsonrpc": "2.0",
            "id": self.next_id,
            "method": method,
            "params": params,
        });
        rpc::dispatch(&self.service, &request).expect("request with id must get a response")
    }

    /// Call and unwrap the result, panicking on an error response.
    pub fn call_ok(&mut self, method: &str, params: Value) -> Value {
        let response = self.call(method, params);
        assert!(
            response.get("error").is_none(),
            "{method} returned error: {}",
            response["error"]
        );
        response["result"].clone()
    }

    /// Call and unwrap the error object, panicking on success.
    pub fn call_err(&mut self, method: &str, params: Value) -> Value {
        let response = self.call(method, params);
        assert!(
            response.get("error").is_some(),
            "{method} unexpectedly succeeded: {}",
            response["result"]
        );
        response["error"].clone()
    }

    pub fn set_project(&mut self) -> Value {
        let path = self.root().display().to_string();
        self.call_ok("set_project", json!({ "path": path }))
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.service.shutdown();
    }
}
