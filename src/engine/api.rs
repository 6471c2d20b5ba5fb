//! HTTP chat-completions engine adapter
//!
//! Bridges the engine interface onto a messages-style HTTP endpoint. The
//! adapter drives a single-turn session: one request carrying the task
//! prompt, one response whose text becomes the run output. Token usage is
//! surfaced to the event collector as a `Turn` event.
//!
//! Endpoint and credential come from [`EngineOptions`] or the
//! `WAZA_API_URL` / `WAZA_API_KEY` environment variables.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;

use crate::engine::{
    Engine, EngineError, EngineOptions, EventBus, ExecuteOutcome, ExecuteRequest,
};
use crate::events::{EngineEvent, EventSink};

const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ApiMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize, Default)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Engine backed by a messages-style HTTP API.
pub struct ApiEngine {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
    default_model: String,
    bus: EventBus,
    session_counter: std::sync::atomic::AtomicUsize,
}

impl ApiEngine {
    /// Build an adapter for `model` from the factory options.
    ///
    /// Fails with [`EngineError::Configuration`] when no endpoint or
    /// credential can be resolved.
    pub fn new(options: &EngineOptions, model: &str) -> Result<Self, EngineError> {
        let base_url = options
            .base_url
            .clone()
            .or_else(|| std::env::var("WAZA_API_URL").ok())
            .ok_or_else(|| {
                EngineError::Configuration("no API base URL configured (WAZA_API_URL)".into())
            })?;
        let api_key = options
            .api_key
            .clone()
            .or_else(|| std::env::var("WAZA_API_KEY").ok())
            .ok_or_else(|| {
                EngineError::Configuration("no API key configured (WAZA_API_KEY)".into())
            })?;

        let http_client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: model.to_string(),
            bus: EventBus::new(),
            session_counter: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    async fn send(&self, request: &ExecuteRequest) -> Result<ApiResponse, EngineError> {
        let model = if request.model.is_empty() {
            &self.default_model
        } else {
            &request.model
        };
        let body = ApiRequest {
            model,
            max_tokens: DEFAULT_MAX_TOKENS,
            messages: vec![ApiMessage {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .http_client
            .post(format!("{}/v1/messages", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EngineError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<ApiResponse>()
            .await
            .map_err(|e| EngineError::Parse(e.to_string()))
    }
}

#[async_trait]
impl Engine for ApiEngine {
    fn new_session(&self) -> String {
        let n = self
            .session_counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        format!("api-session-{n}")
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
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let mut response = tokio::select! {
            result = self.send(&request) => result,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        // One retry for transient failures, still cancellation-aware.
        if let Err(e) = &response {
            if e.is_retryable() {
                tracing::debug!(task = %request.task_id, "retrying engine request: {e}");
                response = tokio::select! {
                    result = self.send(&request) => result,
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                };
            }
        }
        let response = response?;

        let usage = response.usage.unwrap_or_default();
        let output: String = response
            .content
            .iter()
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        self.bus.emit(
            &request.session_id,
            EngineEvent::Turn {
                text: Some(output.clone()),
                tokens_in: usage.input_tokens,
                tokens_out: usage.output_tokens,
            },
        );

        Ok(ExecuteOutcome { output })
    }

    async fn shutdown(&self, _cleanup: &CancellationToken) -> Result<(), EngineError> {
        self.bus.clear();
        Ok(())
    }
}
