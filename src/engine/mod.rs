//! Pluggable agent engine interface
//!
//! The execution core treats the agent runtime as an opaque [`Engine`]: it
//! opens a session, attaches an event sink, calls [`Engine::execute`], and
//! later shuts the engine down under an independent cleanup context. Two
//! kinds ship with the crate:
//!
//! - [`mock`]: deterministic canned outputs and scripted event sequences,
//!   used throughout the test suite
//! - [`api`]: an HTTP chat-completions bridge for real model endpoints
//!
//! Engines must be safe for concurrent `execute` calls; the scheduler will
//! issue them from several workers when parallel execution is enabled.

pub mod api;
pub mod mock;

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::events::{EngineEvent, EventSink};

pub use api::ApiEngine;
pub use mock::{MockEngine, MockEngineBuilder};

/// Engine failures.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The factory was asked for a kind it does not know.
    #[error("unknown engine kind '{0}'")]
    UnknownKind(String),

    /// Missing or invalid engine configuration (endpoint, credentials).
    #[error("engine configuration error: {0}")]
    Configuration(String),

    /// The remote endpoint returned an error response.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Transport failure talking to the endpoint.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The endpoint answered with something unintelligible.
    #[error("failed to parse engine response: {0}")]
    Parse(String),

    /// Execution was cancelled before completion.
    #[error("execution cancelled")]
    Cancelled,

    /// Any other engine-internal failure.
    #[error("engine failure: {0}")]
    Execution(String),
}

impl EngineError {
    /// Transient failures worth one more attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Network(_) | EngineError::Api { status: 500..=599, .. }
        )
    }
}

/// Everything an engine needs to run one agent session.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    /// Session id previously obtained from [`Engine::new_session`].
    pub session_id: String,

    /// Task id, for engine-side logging and caching.
    pub task_id: String,

    /// The agent prompt.
    pub prompt: String,

    /// Target model identifier.
    pub model: String,

    /// The run's workspace root. The engine works inside this directory.
    pub workspace_dir: PathBuf,

    /// Paths staged into the workspace, relative to its root. A hint only;
    /// engines are free to ignore it.
    pub resources_hint: Vec<PathBuf>,
}

/// What an engine returns when a session finishes normally.
#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    /// The agent's final message.
    pub output: String,
}

/// The pluggable agent runtime.
///
/// One engine instance serves all runs for a given model. Sessions are
/// correlated through engine-assigned ids: the run executor asks for an id,
/// subscribes its event sink under that id, then executes.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Allocate an id for the next session.
    fn new_session(&self) -> String;

    /// Route events for `session_id` to `sink` until unsubscribed.
    fn subscribe(&self, session_id: &str, sink: EventSink);

    /// Stop routing events for `session_id`.
    fn unsubscribe(&self, session_id: &str);

    /// Run one agent session to completion or cancellation.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: ExecuteRequest,
    ) -> Result<ExecuteOutcome, EngineError>;

    /// Tear down all per-session resources. Idempotent; always invoked
    /// under a cleanup context independent of run cancellation.
    async fn shutdown(&self, cleanup: &CancellationToken) -> Result<(), EngineError>;
}

/// Session-keyed event fan-out shared by the engine implementations.
///
/// Emission looks the sink up and delivers outside the lock, so a slow
/// consumer never stalls other sessions.
#[derive(Default)]
pub struct EventBus {
    sinks: Mutex<HashMap<String, EventSink>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, session_id: &str, sink: EventSink) {
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.to_string(), sink);
    }

    pub fn unsubscribe(&self, session_id: &str) {
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
    }

    /// Deliver an event to the session's sink, if one is attached. Events
    /// for unknown sessions are dropped.
    pub fn emit(&self, session_id: &str, event: EngineEvent) {
        let sink = self
            .sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned();
        if let Some(sink) = sink {
            sink.push(event);
        }
    }

    /// Drop all sinks. Used by engine shutdown.
    pub fn clear(&self) {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Recognized engine kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// Deterministic in-process engine for tests and dry runs.
    Mock,

    /// HTTP chat-completions bridge.
    Api,
}

impl FromStr for EngineKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mock" => Ok(Self::Mock),
            "api" => Ok(Self::Api),
            other => Err(EngineError::UnknownKind(other.to_string())),
        }
    }
}

/// Options consumed by [`DefaultEngineFactory`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Endpoint base URL for the `api` kind.
    pub base_url: Option<String>,

    /// Bearer credential for the `api` kind. Falls back to `WAZA_API_KEY`.
    pub api_key: Option<String>,

    /// Per-request timeout for the `api` kind.
    pub request_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Constructs one engine per model.
///
/// The model driver calls this once per model in the list and registers a
/// deferred shutdown for every engine it receives.
pub trait EngineFactory: Send + Sync {
    fn new_engine(&self, model: &str) -> Result<Arc<dyn Engine>, EngineError>;
}

/// Factory dispatching on [`EngineKind`].
pub struct DefaultEngineFactory {
    kind: EngineKind,
    options: EngineOptions,
}

impl DefaultEngineFactory {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            options: EngineOptions::default(),
        }
    }

    pub fn with_options(kind: EngineKind, options: EngineOptions) -> Self {
        Self { kind, options }
    }
}

impl EngineFactory for DefaultEngineFactory {
    fn new_engine(&self, model: &str) -> Result<Arc<dyn Engine>, EngineError> {
        match self.kind {
            EngineKind::Mock => Ok(Arc::new(MockEngine::new())),
            EngineKind::Api => Ok(Arc::new(ApiEngine::new(&self.options, model)?)),
        }
    }
}

/// Factory handing out one shared engine instance for every model.
///
/// Useful in tests that need to observe a single engine (call counts,
/// high-water marks) across the whole benchmark.
pub struct SharedEngineFactory {
    engine: Arc<dyn Engine>,
}

impl SharedEngineFactory {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }
}

impl EngineFactory for SharedEngineFactory {
    fn new_engine(&self, _model: &str) -> Result<Arc<dyn Engine>, EngineError> {
        Ok(Arc::clone(&self.engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_kind_parsing() {
        assert_eq!("mock".parse::<EngineKind>().unwrap(), EngineKind::Mock);
        assert_eq!("api".parse::<EngineKind>().unwrap(), EngineKind::Api);
        assert!("quantum".parse::<EngineKind>().is_err());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(
            EngineError::Api {
                status: 503,
                message: "unavailable".into()
            }
            .is_retryable()
        );
        assert!(
            !EngineError::Api {
                status: 401,
                message: "unauthorized".into()
            }
            .is_retryable()
        );
        assert!(!EngineError::Cancelled.is_retryable());
    }

    #[tokio::test]
    async fn test_event_bus_routes_by_session() {
        use crate::events::EventCollector;

        let bus = EventBus::new();
        let collector = EventCollector::new();
        bus.subscribe("s1", collector.sink());

        bus.emit(
            "s1",
            EngineEvent::Turn {
                text: None,
                tokens_in: 1,
                tokens_out: 1,
            },
        );
        // Unknown session: dropped without error.
        bus.emit(
            "s2",
            EngineEvent::Turn {
                text: None,
                tokens_in: 1,
                tokens_out: 1,
            },
        );
        bus.unsubscribe("s1");
        bus.emit(
            "s1",
            EngineEvent::Turn {
                text: None,
                tokens_in: 1,
                tokens_out: 1,
            },
        );

        let (transcript, _) = collector.snapshot().await;
        assert_eq!(transcript.len(), 1);
    }
}
