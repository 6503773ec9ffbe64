//! Operation registry, staged progress events, and cooperative cancellation
//! with cleanup hooks.
//!
//! Every long-running operation registers a tracker carrying stages, counts,
//! status, and a cancel token. Handlers receive typed events; cancel runs the
//! registered cleanup hooks before the terminal event is emitted.

use crate::errors::{Result, ServerError};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Status and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Cancelled | OperationStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventKind {
    Started,
    Progress,
    StageChanged,
    Completed,
    Cancelled,
    Failed,
    Paused,
    Resumed,
    CleanupStarted,
    CleanupCompleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub operation_id: String,
    pub operation: String,
    pub kind: ProgressEventKind,
    pub status: OperationStatus,
    pub processed: u64,
    pub total: u64,
    pub stage: Option<String>,
    pub message: String,
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub trait ProgressHandler: Send + Sync {
    fn handle(&self, event: &ProgressEvent);
}

/// Emits every event through `tracing`.
pub struct LogProgressHandler;

impl ProgressHandler for LogProgressHandler {
    fn handle(&self, event: &ProgressEvent) {
        info!(
            operation = event.operation.as_str(),
            id = event.operation_id.as_str(),
            kind = ?event.kind,
            processed = event.processed,
            total = event.total,
            stage = event.stage.as_deref().unwrap_or(""),
            "{}",
            event.message
        );
    }
}

/// Appends events as JSON lines to a file.
pub struct FileProgressHandler {
    path: PathBuf,
}

impl FileProgressHandler {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ProgressHandler for FileProgressHandler {
    fn handle(&self, event: &ProgressEvent) {
        let line = match serde_json::to_string(event) {
            Ok(l) => l,
            Err(_) => return,
        };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "Could not append progress event");
        }
    }
}

/// Forwards events to an arbitrary callback.
pub struct CallbackProgressHandler {
    callback: Box<dyn Fn(&ProgressEvent) + Send + Sync>,
}

impl CallbackProgressHandler {
    pub fn new(callback: impl Fn(&ProgressEvent) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl ProgressHandler for CallbackProgressHandler {
    fn handle(&self, event: &ProgressEvent) {
        (self.callback)(event);
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Cooperative cancel flag shared between an operation and its workers. Takes
/// effect only at the operation's own check-points, never mid-syscall.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn cancel(&self, reason: &str) {
        *self.inner.reason.lock().unwrap() = Some(reason.to_string());
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().unwrap().clone()
    }

    /// Check-point: raises `Cancelled` when the flag is set.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ServerError::Cancelled(
                self.reason().unwrap_or_else(|| "operation cancelled".to_string()),
            ))
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

struct TrackerState {
    status: OperationStatus,
    processed: u64,
    total: u64,
    stage_index: usize,
    message: String,
    finished_at: Option<Instant>,
}

pub struct ProgressTracker {
    id: String,
    name: String,
    stages: Vec<String>,
    state: Mutex<TrackerState>,
    token: CancellationToken,
    handlers: Mutex<Vec<Arc<dyn ProgressHandler>>>,
    cleanup_hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    started_at: Instant,
}

impl ProgressTracker {
    pub fn new(name: &str, total: u64, stages: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            stages: stages.iter().map(|s| s.to_string()).collect(),
            state: Mutex::new(TrackerState {
                status: OperationStatus::Pending,
                processed: 0,
                total,
                stage_index: 0,
                message: String::new(),
                finished_at: None,
            }),
            token: CancellationToken::default(),
            handlers: Mutex::new(vec![Arc::new(LogProgressHandler)]),
            cleanup_hooks: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn status(&self) -> OperationStatus {
        self.state.lock().unwrap().status
    }

    pub fn add_handler(&self, handler: Arc<dyn ProgressHandler>) {
        self.handlers.lock().unwrap().push(handler);
    }

    /// Register a hook to run on cancellation, before the terminal event.
    pub fn add_cleanup_hook(&self, hook: impl FnOnce() + Send + 'static) {
        self.cleanup_hooks.lock().unwrap().push(Box::new(hook));
    }

    pub fn start(&self) {
        self.transition(OperationStatus::Running, ProgressEventKind::Started, "started");
    }

    /// Update the processed count, clamped to the total.
    pub fn update(&self, processed: u64, message: &str) {
        {
            let mut state = self.state.lock().unwrap();
            state.processed = processed.min(state.total);
            state.message = message.to_string();
        }
        self.emit(ProgressEventKind::Progress, message);
    }

    pub fn set_total(&self, total: u64) {
        let mut state = self.state.lock().unwrap();
        state.total = total;
        state.processed = state.processed.min(total);
    }

    /// Move to a named stage; unknown labels are appended.
    pub fn set_stage(&self, label: &str) {
        {
            let mut state = self.state.lock().unwrap();
            state.stage_index = match self.stages.iter().position(|s| s == label) {
                Some(i) => i,
                None => self.stages.len(),
            };
        }
        self.emit(ProgressEventKind::StageChanged, label);
    }

    pub fn complete(&self, message: &str) {
        self.cleanup_hooks.lock().unwrap().clear();
        self.transition(OperationStatus::Completed, ProgressEventKind::Completed, message);
    }

    pub fn fail(&self, message: &str) {
        self.cleanup_hooks.lock().unwrap().clear();
        self.transition(OperationStatus::Failed, ProgressEventKind::Failed, message);
    }

    pub fn pause(&self) {
        self.transition(OperationStatus::Paused, ProgressEventKind::Paused, "paused");
    }

    pub fn resume(&self) {
        self.transition(OperationStatus::Running, ProgressEventKind::Resumed, "resumed");
    }

    /// Cancel: set the token, run cleanup hooks (with bracketing events),
    /// then emit the terminal `cancelled` event.
    pub fn cancel(&self, reason: &str) {
        if self.status().is_terminal() {
            return;
        }
        self.token.cancel(reason);

        let hooks: Vec<Box<dyn FnOnce() + Send>> =
            std::mem::take(&mut *self.cleanup_hooks.lock().unwrap());
        if !hooks.is_empty() {
            self.emit(ProgressEventKind::CleanupStarted, "running cleanup hooks");
            for hook in hooks {
                hook();
            }
            self.emit(ProgressEventKind::CleanupCompleted, "cleanup hooks finished");
        }

        self.transition(OperationStatus::Cancelled, ProgressEventKind::Cancelled, reason);
    }

    fn transition(&self, status: OperationStatus, kind: ProgressEventKind, message: &str) {
        {
            let mut state = self.state.lock().unwrap();
            state.status = status;
            state.message = message.to_string();
            if status.is_terminal() {
                state.finished_at = Some(Instant::now());
            }
        }
        self.emit(kind, message);
    }

    fn emit(&self, kind: ProgressEventKind, message: &str) {
        let event = {
            let state = self.state.lock().unwrap();
            ProgressEvent {
                operation_id: self.id.clone(),
                operation: self.name.clone(),
                kind,
                status: state.status,
                processed: state.processed,
                total: state.total,
                stage: self.stages.get(state.stage_index).cloned(),
                message: message.to_string(),
                timestamp: chrono::Utc::now().to_rfc3339(),
            }
        };
        for handler in self.handlers.lock().unwrap().iter() {
            handler.handle(&event);
        }
    }

    /// Age since the operation reached a terminal status.
    fn terminal_age(&self) -> Option<Duration> {
        self.state
            .lock()
            .unwrap()
            .finished_at
            .map(|at| at.elapsed())
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.lock().unwrap();
        json!({
            "operation_id": self.id,
            "name": self.name,
            "status": state.status,
            "processed_items": state.processed,
            "total_items": state.total,
            "stage": self.stages.get(state.stage_index),
            "stages": self.stages,
            "message": state.message,
            "elapsed_ms": self.started_at.elapsed().as_millis() as u64,
        })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registry of live and recently finished operations. Terminal operations are
/// retained for a grace period and removed by [`OperationRegistry::gc`].
pub struct OperationRegistry {
    operations: DashMap<String, Arc<ProgressTracker>>,
    retention: Duration,
}

impl OperationRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            operations: DashMap::new(),
            retention,
        }
    }

    pub fn register(&self, tracker: Arc<ProgressTracker>) {
        self.operations
            .insert(tracker.id().to_string(), tracker);
    }

    pub fn get(&self, operation_id: &str) -> Option<Arc<ProgressTracker>> {
        self.operations.get(operation_id).map(|e| Arc::clone(&e))
    }

    pub fn list(&self) -> Vec<serde_json::Value> {
        let mut out: Vec<serde_json::Value> =
            self.operations.iter().map(|e| e.snapshot()).collect();
        out.sort_by(|a, b| {
            a["operation_id"]
                .as_str()
                .unwrap_or("")
                .cmp(b["operation_id"].as_str().unwrap_or(""))
        });
        out
    }

    pub fn cancel(&self, operation_id: &str, reason: &str) -> bool {
        match self.get(operation_id) {
            Some(tracker) => {
                tracker.cancel(reason);
                true
            }
            None => false,
        }
    }

    /// Cancel every non-terminal operation. Returns how many were cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let mut cancelled = 0;
        for entry in self.operations.iter() {
            if !entry.status().is_terminal() {
                entry.cancel(reason);
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Drop terminal operations older than the retention period.
    pub fn gc(&self) -> usize {
        let before = self.operations.len();
        let retention = self.retention;
        self.operations.retain(|_, tracker| {
            match tracker.terminal_age() {
                Some(age) => age < retention,
                None => true,
            }
        });
        before - self.operations.len()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_check_raises_after_cancel() {
        let token = CancellationToken::default();
        assert!(token.check().is_ok());
        token.cancel("stop requested");
        assert!(token.is_cancelled());
        let err = token.check().unwrap_err();
        assert!(matches!(err, ServerError::Cancelled(_)));
        assert_eq!(token.reason().as_deref(), Some("stop requested"));
    }

    #[test]
    fn test_processed_never_exceeds_total() {
        let tracker = ProgressTracker::new("walk", 10, &["scan"]);
        tracker.start();
        tracker.update(25, "over-report");
        let snap = tracker.snapshot();
        assert_eq!(snap["processed_items"], 10);
        assert_eq!(snap["total_items"], 10);
    }

    #[test]
    fn test_event_sequence_on_cancel_with_cleanup() {
        let tracker = ProgressTracker::new("index", 5, &["walk", "process"]);
        let events: Arc<Mutex<Vec<ProgressEventKind>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        tracker.add_handler(Arc::new(CallbackProgressHandler::new(move |e| {
            sink.lock().unwrap().push(e.kind);
        })));
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cleaned);
        tracker.add_cleanup_hook(move || flag.store(true, Ordering::SeqCst));

        tracker.start();
        tracker.cancel("user request");

        assert!(cleaned.load(Ordering::SeqCst));
        let seen = events.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ProgressEventKind::Started,
                ProgressEventKind::CleanupStarted,
                ProgressEventKind::CleanupCompleted,
                ProgressEventKind::Cancelled,
            ]
        );
        assert_eq!(tracker.status(), OperationStatus::Cancelled);
    }

    #[test]
    fn test_complete_does_not_run_cleanup() {
        let tracker = ProgressTracker::new("index", 1, &[]);
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cleaned);
        tracker.add_cleanup_hook(move || flag.store(true, Ordering::SeqCst));
        tracker.start();
        tracker.complete("done");
        // cancel after completion is a no-op
        tracker.cancel("late");
        assert!(!cleaned.load(Ordering::SeqCst));
        assert_eq!(tracker.status(), OperationStatus::Completed);
    }

    #[test]
    fn test_registry_gc_removes_old_terminal_ops() {
        let registry = OperationRegistry::new(Duration::from_millis(10));
        let done = ProgressTracker::new("done-op", 0, &[]);
        done.start();
        done.complete("done");
        let live = ProgressTracker::new("live-op", 0, &[]);
        live.start();
        registry.register(Arc::clone(&done));
        registry.register(Arc::clone(&live));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(registry.gc(), 1);
        assert!(registry.get(live.id()).is_some());
        assert!(registry.get(done.id()).is_none());
    }

    #[test]
    fn test_cancel_all_skips_terminal() {
        let registry = OperationRegistry::new(Duration::from_secs(60));
        let finished = ProgressTracker::new("a", 0, &[]);
        finished.start();
        finished.complete("done");
        let running = ProgressTracker::new("b", 0, &[]);
        running.start();
        registry.register(finished);
        registry.register(Arc::clone(&running));

        assert_eq!(registry.cancel_all("shutdown"), 1);
        assert_eq!(running.status(), OperationStatus::Cancelled);
    }
}
