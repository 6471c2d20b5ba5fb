//! Deterministic mock engine for tests and dry runs
//!
//! Returns canned outputs without any network access, emits scripted event
//! sequences through the engine event bus, and records enough about its own
//! execution (concurrency high-water mark, shutdown calls) for the
//! scheduler and lifecycle tests to make assertions against.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::engine::{Engine, EngineError, EventBus, ExecuteOutcome, ExecuteRequest};
use crate::events::{EngineEvent, EventSink};

/// Builder for a [`MockEngine`] with scripted behavior.
///
/// ```
/// use waza::engine::MockEngineBuilder;
/// use std::time::Duration;
///
/// let engine = MockEngineBuilder::new()
///     .with_output("hi there")
///     .with_task_output("t2", "goodbye")
///     .with_latency(Duration::from_millis(5))
///     .build();
/// ```
pub struct MockEngineBuilder {
    default_output: Option<String>,
    outputs: HashMap<String, String>,
    failures: HashMap<String, String>,
    latency: Duration,
    events: Vec<EngineEvent>,
    workspace_files: Vec<(PathBuf, String)>,
}

impl MockEngineBuilder {
    pub fn new() -> Self {
        Self {
            default_output: None,
            outputs: HashMap::new(),
            failures: HashMap::new(),
            latency: Duration::ZERO,
            events: Vec::new(),
            workspace_files: Vec::new(),
        }
    }

    /// Output returned for every task without a task-specific override.
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.default_output = Some(output.into());
        self
    }

    /// Output returned for one specific task id.
    pub fn with_task_output(mut self, task_id: impl Into<String>, output: impl Into<String>) -> Self {
        self.outputs.insert(task_id.into(), output.into());
        self
    }

    /// Make execution fail for one specific task id.
    pub fn with_task_failure(mut self, task_id: impl Into<String>, message: impl Into<String>) -> Self {
        self.failures.insert(task_id.into(), message.into());
        self
    }

    /// Simulated execution latency, cancellation-aware.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Events emitted on every run, in order, replacing the default single
    /// turn.
    pub fn with_events(mut self, events: Vec<EngineEvent>) -> Self {
        self.events = events;
        self
    }

    /// File written into the workspace on every run, path relative to the
    /// workspace root.
    pub fn with_workspace_file(mut self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        self.workspace_files.push((path.into(), content.into()));
        self
    }

    pub fn build(self) -> MockEngine {
        MockEngine {
            default_output: self.default_output,
            outputs: self.outputs,
            failures: self.failures,
            latency: self.latency,
            events: self.events,
            workspace_files: self.workspace_files,
            bus: EventBus::new(),
            session_counter: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            execute_calls: AtomicUsize::new(0),
            shutdown_calls: AtomicUsize::new(0),
        }
    }

    /// Convenience for `build()` wrapped in an [`Arc`].
    pub fn build_shared(self) -> Arc<MockEngine> {
        Arc::new(self.build())
    }
}

impl Default for MockEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic in-process engine.
pub struct MockEngine {
    default_output: Option<String>,
    outputs: HashMap<String, String>,
    failures: HashMap<String, String>,
    latency: Duration,
    events: Vec<EngineEvent>,
    workspace_files: Vec<(PathBuf, String)>,
    bus: EventBus,
    session_counter: AtomicUsize,
    in_flight: AtomicUsize,
    high_water: AtomicUsize,
    execute_calls: AtomicUsize,
    shutdown_calls: AtomicUsize,
}

impl MockEngine {
    /// Engine with default behavior: one turn per run, output
    /// `"completed <task_id>"`.
    pub fn new() -> Self {
        MockEngineBuilder::new().build()
    }

    /// Highest number of concurrently outstanding `execute` calls observed.
    pub fn high_water_mark(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }

    /// Total `execute` calls so far.
    pub fn execute_calls(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    /// Total `shutdown` calls so far.
    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    fn output_for(&self, task_id: &str) -> String {
        if let Some(output) = self.outputs.get(task_id) {
            output.clone()
        } else if let Some(output) = &self.default_output {
            output.clone()
        } else {
            format!("completed {task_id}")
        }
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter on every exit path, including the run
/// future being dropped by a timeout.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Engine for MockEngine {
    fn new_session(&self) -> String {
        let n = self.session_counter.fetch_add(1, Ordering::SeqCst);
        format!("mock-session-{n}")
    }

    fn subscribe(&self, session_id: &str, sink: EventSink) {
        self.bus.subscribe(session_id, sink);
    }

    fn unsubscribe(&self, session_id: &str) {
        self.bus.unsubscribe(session_id);
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: ExecuteRequest,
    ) -> Result<ExecuteOutcome, EngineError> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        let depth = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(depth, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        if !self.latency.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.latency) => {}
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }

        if let Some(message) = self.failures.get(&request.task_id) {
            return Err(EngineError::Execution(message.clone()));
        }

        for (path, content) in &self.workspace_files {
            let dest = request.workspace_dir.join(path);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| EngineError::Execution(format!("workspace write failed: {e}")))?;
            }
            tokio::fs::write(&dest, content)
                .await
                .map_err(|e| EngineError::Execution(format!("workspace write failed: {e}")))?;
        }

        let output = self.output_for(&request.task_id);
        if self.events.is_empty() {
            self.bus.emit(
                &request.session_id,
                EngineEvent::Turn {
                    text: Some(output.clone()),
                    tokens_in: 12,
                    tokens_out: 8,
                },
            );
        } else {
            for event in &self.events {
                self.bus.emit(&request.session_id, event.clone());
            }
        }

        Ok(ExecuteOutcome { output })
    }

    async fn shutdown(&self, _cleanup: &CancellationToken) -> Result<(), EngineError> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        self.bus.clear();
        Ok(())
    }
}
