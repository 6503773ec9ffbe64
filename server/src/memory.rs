//! Memory governor: periodic RSS snapshots, soft/hard limit evaluation, and
//! registered cleanup / spill / limit-exceeded hooks. Hook failures are
//! logged and swallowed; spill files live in a per-process temp directory
//! removed on shutdown.

use crate::config::MemorySection;
use crate::errors::Result;
use crate::settings::write_atomic;
use code_index_core::cache::MaintenanceHandle;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

const SNAPSHOT_HISTORY: usize = 120;

#[derive(Debug, Clone, Serialize)]
pub struct MemorySnapshot {
    pub timestamp: String,
    pub rss_mb: f64,
    pub heap_estimate_mb: f64,
    pub object_count: usize,
    pub threads: usize,
    pub loaded_files: usize,
    pub cached_queries: usize,
}

/// Component-level usage reported by the service on every snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComponentUsage {
    pub loaded_files: usize,
    pub cached_queries: usize,
    pub tracked_objects: usize,
}

type Hook = Box<dyn Fn() + Send + Sync>;
type UsageSource = Box<dyn Fn() -> ComponentUsage + Send + Sync>;

#[derive(Default)]
struct Hooks {
    cleanup: Vec<Hook>,
    spill: Vec<Hook>,
    limit_exceeded: Vec<Hook>,
}

pub struct MemoryGovernor {
    limits: RwLock<MemorySection>,
    sys: Mutex<System>,
    pid: Pid,
    snapshots: Mutex<VecDeque<MemorySnapshot>>,
    peak_rss_mb: Mutex<f64>,
    hooks: Mutex<Hooks>,
    usage_source: Mutex<Option<UsageSource>>,
    spill_dir: PathBuf,
    spilled: Mutex<HashMap<String, PathBuf>>,
    monitor: Mutex<Option<MaintenanceHandle>>,
}

impl MemoryGovernor {
    pub fn new(limits: MemorySection) -> Arc<Self> {
        let spill_dir =
            std::env::temp_dir().join(format!("code-index-spill-{}", std::process::id()));
        Arc::new(Self {
            limits: RwLock::new(limits),
            sys: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
            snapshots: Mutex::new(VecDeque::new()),
            peak_rss_mb: Mutex::new(0.0),
            hooks: Mutex::new(Hooks::default()),
            usage_source: Mutex::new(None),
            spill_dir,
            spilled: Mutex::new(HashMap::new()),
            monitor: Mutex::new(None),
        })
    }

    pub fn limits(&self) -> MemorySection {
        self.limits.read().unwrap().clone()
    }

    /// Apply partial limit updates; `None` fields keep their current value.
    pub fn update_limits(
        &self,
        soft: Option<f64>,
        hard: Option<f64>,
        gc: Option<f64>,
        spill: Option<f64>,
    ) -> MemorySection {
        let mut limits = self.limits.write().unwrap();
        if let Some(v) = soft {
            limits.soft_limit_mb = v;
        }
        if let Some(v) = hard {
            limits.hard_limit_mb = v;
        }
        if let Some(v) = gc {
            limits.gc_threshold_mb = v;
        }
        if let Some(v) = spill {
            limits.spill_threshold_mb = v;
        }
        limits.clone()
    }

    /// Replace the component-usage callback (wired per project).
    pub fn set_usage_source(&self, source: impl Fn() -> ComponentUsage + Send + Sync + 'static) {
        *self.usage_source.lock().unwrap() = Some(Box::new(source));
    }

    /// Replace all hooks at once (wired per project).
    pub fn set_hooks(&self, cleanup: Vec<Hook>, spill: Vec<Hook>, limit_exceeded: Vec<Hook>) {
        *self.hooks.lock().unwrap() = Hooks {
            cleanup,
            spill,
            limit_exceeded,
        };
    }

    fn thread_count() -> usize {
        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = fs::read_to_string("/proc/self/status") {
                for line in status.lines() {
                    if let Some(rest) = line.strip_prefix("Threads:") {
                        return rest.trim().parse().unwrap_or(0);
                    }
                }
            }
        }
        0
    }

    /// Take and record a snapshot of the process and component state.
    pub fn take_snapshot(&self) -> MemorySnapshot {
        let (rss_mb, virtual_mb) = {
            let mut sys = self.sys.lock().unwrap();
            sys.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
            match sys.process(self.pid) {
                Some(p) => (
                    p.memory() as f64 / (1024.0 * 1024.0),
                    p.virtual_memory() as f64 / (1024.0 * 1024.0),
                ),
                None => (0.0, 0.0),
            }
        };
        let usage = self
            .usage_source
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s())
            .unwrap_or_default();

        let snapshot = MemorySnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            rss_mb,
            heap_estimate_mb: virtual_mb,
            object_count: usage.tracked_objects,
            threads: Self::thread_count(),
            loaded_files: usage.loaded_files,
            cached_queries: usage.cached_queries,
        };

        {
            let mut peak = self.peak_rss_mb.lock().unwrap();
            if rss_mb > *peak {
                *peak = rss_mb;
            }
        }
        let mut history = self.snapshots.lock().unwrap();
        history.push_back(snapshot.clone());
        while history.len() > SNAPSHOT_HISTORY {
            history.pop_front();
        }
        snapshot
    }

    /// Names of the limits the snapshot violates.
    pub fn check(&self, snapshot: &MemorySnapshot) -> Vec<&'static str> {
        let limits = self.limits.read().unwrap();
        let mut violations = Vec::new();
        if snapshot.rss_mb > limits.hard_limit_mb {
            violations.push("hard_limit");
        } else if snapshot.rss_mb > limits.soft_limit_mb {
            violations.push("soft_limit");
        }
        if snapshot.rss_mb > limits.spill_threshold_mb {
            violations.push("spill_threshold");
        }
        if snapshot.rss_mb > limits.gc_threshold_mb {
            violations.push("gc_threshold");
        }
        if snapshot.loaded_files > limits.max_loaded_files {
            violations.push("max_loaded_files");
        }
        if snapshot.cached_queries > limits.max_cached_queries {
            violations.push("max_cached_queries");
        }
        violations
    }

    /// Snapshot, evaluate, and fire the hooks the violations call for.
    /// Returns a report of what ran.
    pub fn enforce(&self) -> serde_json::Value {
        let snapshot = self.take_snapshot();
        let violations = self.check(&snapshot);
        let mut actions: Vec<&str> = Vec::new();

        if violations.contains(&"hard_limit") {
            self.fire("limit_exceeded", |h| &h.limit_exceeded);
            actions.push("limit_exceeded");
        } else {
            if violations.contains(&"soft_limit")
                || violations.contains(&"gc_threshold")
                || violations.contains(&"max_loaded_files")
                || violations.contains(&"max_cached_queries")
            {
                self.fire("cleanup", |h| &h.cleanup);
                actions.push("cleanup");
            }
            if violations.contains(&"spill_threshold") {
                self.fire("spill", |h| &h.spill);
                actions.push("spill");
            }
        }

        json!({
            "snapshot": snapshot,
            "violations": violations,
            "actions": actions,
        })
    }

    fn fire(&self, kind: &str, select: impl Fn(&Hooks) -> &Vec<Hook>) {
        let hooks = self.hooks.lock().unwrap();
        for hook in select(&hooks) {
            // Hook panics must not take the monitor down with them.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(hook));
            if result.is_err() {
                warn!(kind = kind, "Memory hook panicked, ignoring");
            }
        }
        debug!(kind = kind, count = select(&hooks).len(), "Fired memory hooks");
    }

    // -----------------------------------------------------------------------
    // Spill files
    // -----------------------------------------------------------------------

    /// Serialize a value into the per-process spill directory.
    pub fn spill(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        fs::create_dir_all(&self.spill_dir)?;
        let path = self.spill_dir.join(format!("{key}.json"));
        let bytes = serde_json::to_vec(value)
            .map_err(|e| crate::errors::ServerError::Integrity(e.to_string()))?;
        write_atomic(&path, &bytes)?;
        self.spilled.lock().unwrap().insert(key.to_string(), path);
        info!(key = key, "Spilled data to disk");
        Ok(())
    }

    /// Load a previously spilled value, if its file still exists.
    pub fn load_spilled(&self, key: &str) -> Option<serde_json::Value> {
        let path = self.spilled.lock().unwrap().get(key)?.clone();
        let bytes = fs::read(&path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn cleanup_spill_files(&self) {
        let mut spilled = self.spilled.lock().unwrap();
        for (_, path) in spilled.drain() {
            let _ = fs::remove_file(path);
        }
        let _ = fs::remove_dir(&self.spill_dir);
    }

    // -----------------------------------------------------------------------
    // Monitoring
    // -----------------------------------------------------------------------

    /// Start the periodic monitor; replaces any previous one.
    pub fn start_monitoring(self: &Arc<Self>, interval: Duration) {
        let governor = Arc::clone(self);
        let handle = MaintenanceHandle::spawn(interval, move || {
            governor.enforce();
        });
        *self.monitor.lock().unwrap() = Some(handle);
    }

    pub fn stop_monitoring(&self) {
        *self.monitor.lock().unwrap() = None;
    }

    pub fn stats(&self) -> serde_json::Value {
        let history = self.snapshots.lock().unwrap();
        json!({
            "current": history.back(),
            "peak_rss_mb": *self.peak_rss_mb.lock().unwrap(),
            "snapshots_recorded": history.len(),
            "limits": *self.limits.read().unwrap(),
            "spilled_keys": self.spilled.lock().unwrap().len(),
        })
    }

    /// Write the peak/snapshot profile as JSON.
    pub fn export_profile(&self, path: &Path) -> Result<()> {
        let history = self.snapshots.lock().unwrap();
        let snapshots: Vec<&MemorySnapshot> = history.iter().collect();
        let profile = json!({
            "exported_at": chrono::Utc::now().to_rfc3339(),
            "peak_rss_mb": *self.peak_rss_mb.lock().unwrap(),
            "limits": *self.limits.read().unwrap(),
            "snapshots": snapshots,
        });
        let bytes = serde_json::to_vec_pretty(&profile)
            .map_err(|e| crate::errors::ServerError::Integrity(e.to_string()))?;
        write_atomic(path, &bytes)?;
        Ok(())
    }
}

impl Drop for MemoryGovernor {
    fn drop(&mut self) {
        self.cleanup_spill_files();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tight_limits() -> MemorySection {
        MemorySection {
            soft_limit_mb: 0.001,
            hard_limit_mb: 100_000.0,
            gc_threshold_mb: 0.001,
            spill_threshold_mb: 100_000.0,
            max_loaded_files: 100,
            max_cached_queries: 100,
            monitor_interval_secs: 30,
        }
    }

    #[test]
    fn test_snapshot_reports_rss_and_usage() {
        let governor = MemoryGovernor::new(MemorySection::default());
        governor.set_usage_source(|| ComponentUsage {
            loaded_files: 3,
            cached_queries: 7,
            tracked_objects: 42,
        });
        let snap = governor.take_snapshot();
        assert!(snap.rss_mb > 0.0);
        assert_eq!(snap.loaded_files, 3);
        assert_eq!(snap.cached_queries, 7);
        assert_eq!(snap.object_count, 42);
    }

    #[test]
    fn test_soft_limit_fires_cleanup_hook() {
        let governor = MemoryGovernor::new(tight_limits());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        governor.set_hooks(
            vec![Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })],
            Vec::new(),
            Vec::new(),
        );
        let report = governor.enforce();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(report["actions"]
            .as_array()
            .unwrap()
            .iter()
            .any(|a| a == "cleanup"));
    }

    #[test]
    fn test_hard_limit_fires_limit_hook_only() {
        let mut limits = tight_limits();
        limits.hard_limit_mb = 0.001;
        let governor = MemoryGovernor::new(limits);
        let cleanup = Arc::new(AtomicUsize::new(0));
        let exceeded = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&cleanup);
        let e = Arc::clone(&exceeded);
        governor.set_hooks(
            vec![Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })],
            Vec::new(),
            vec![Box::new(move || {
                e.fetch_add(1, Ordering::SeqCst);
            })],
        );
        governor.enforce();
        assert_eq!(exceeded.load(Ordering::SeqCst), 1);
        assert_eq!(cleanup.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_hook_panic_is_swallowed() {
        let governor = MemoryGovernor::new(tight_limits());
        governor.set_hooks(
            vec![Box::new(|| panic!("hook exploded"))],
            Vec::new(),
            Vec::new(),
        );
        // must not propagate the panic
        governor.enforce();
    }

    #[test]
    fn test_spill_round_trip_and_cleanup() {
        let governor = MemoryGovernor::new(MemorySection::default());
        governor
            .spill("queries", &json!({"a": [1, 2, 3]}))
            .unwrap();
        assert_eq!(
            governor.load_spilled("queries").unwrap()["a"],
            json!([1, 2, 3])
        );
        governor.cleanup_spill_files();
        assert!(governor.load_spilled("queries").is_none());
    }

    #[test]
    fn test_peak_tracking_and_export() {
        let tmp = tempfile::tempdir().unwrap();
        let governor = MemoryGovernor::new(MemorySection::default());
        governor.take_snapshot();
        let profile_path = tmp.path().join("profile.json");
        governor.export_profile(&profile_path).unwrap();
        let profile: serde_json::Value =
            serde_json::from_slice(&fs::read(&profile_path).unwrap()).unwrap();
        assert!(profile["peak_rss_mb"].as_f64().unwrap() > 0.0);
        assert_eq!(profile["snapshots"].as_array().unwrap().len(), 1);
    }
}
