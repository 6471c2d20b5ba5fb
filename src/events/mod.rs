//! Transcript events, session digest, and the per-run event collector
//!
//! The agent engine emits [`EngineEvent`]s asynchronously, possibly from
//! several internal tasks at once. Each run attaches one [`EventCollector`]
//! to the engine's event bus; the collector serializes arrivals into a
//! [`TranscriptEvent`] stream with monotonic sequence numbers and keeps a
//! rolling [`SessionDigest`] up to date.
//!
//! # Architecture
//!
//! ```text
//! engine tasks ──push()──▶ bounded queue ──consumer──▶ transcript + digest
//!                           (EventSink)                 (snapshot at end)
//! ```
//!
//! The queue is bounded so a bursting engine can never exhaust memory. On
//! overflow the oldest non-error event is dropped and a single error entry
//! noting the drop count is appended when the transcript is snapshotted.
//! Pushing never blocks the engine.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Default bound for the collector's internal queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Raw event emitted by an agent engine during execution.
///
/// Tool calls and skill invocations are distinct streams: tool events enter
/// the transcript, skill invocations only accumulate in the digest.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// One agent turn, with token usage for the turn.
    Turn {
        text: Option<String>,
        tokens_in: u64,
        tokens_out: u64,
    },

    /// A tool call started.
    ToolStart {
        tool_call_id: String,
        tool_name: String,
    },

    /// A tool call finished. Pairs with the start carrying the same id.
    ToolComplete {
        tool_call_id: String,
        tool_name: String,
        success: bool,
    },

    /// The agent invoked a named skill.
    SkillInvoked { skill_name: String },

    /// An engine-side error, including malformed payloads the engine could
    /// not interpret.
    Error {
        message: String,
        detail: Option<serde_json::Value>,
    },
}

/// One entry in a run's transcript.
///
/// Sequence numbers start at zero and increase by one in arrival order.
/// Start and complete events for the same tool call share a `tool_call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptEvent {
    Turn {
        seq: u64,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        tokens_in: u64,
        tokens_out: u64,
    },
    ToolExecutionStart {
        seq: u64,
        timestamp: DateTime<Utc>,
        tool_call_id: String,
        tool_name: String,
    },
    ToolExecutionComplete {
        seq: u64,
        timestamp: DateTime<Utc>,
        tool_call_id: String,
        tool_name: String,
        success: bool,
    },
    Error {
        seq: u64,
        timestamp: DateTime<Utc>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<serde_json::Value>,
    },
}

impl TranscriptEvent {
    /// Sequence number of this entry.
    pub fn seq(&self) -> u64 {
        match self {
            Self::Turn { seq, .. }
            | Self::ToolExecutionStart { seq, .. }
            | Self::ToolExecutionComplete { seq, .. }
            | Self::Error { seq, .. } => *seq,
        }
    }
}

/// Rolling aggregates over a run's transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionDigest {
    /// Number of agent turns.
    pub total_turns: u64,

    /// Number of tool calls started.
    pub tool_call_count: u64,

    /// Unique tool names in first-use order.
    pub tools_used: Vec<String>,

    /// Accumulated input tokens.
    pub tokens_in: u64,

    /// Accumulated output tokens.
    pub tokens_out: u64,

    /// Accumulated total tokens.
    pub tokens_total: u64,

    /// Error messages in arrival order.
    pub errors: Vec<String>,

    /// Skill invocations in arrival order. Distinct from tool calls.
    pub skill_invocations: Vec<String>,

    /// Tool calls that started but never completed before the run ended.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_tool_calls: Vec<String>,
}

struct QueueState {
    events: VecDeque<EngineEvent>,
    dropped: u64,
    closed: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

/// Cloneable handle engines use to deliver events. Safe to share across
/// any number of producer tasks; pushing never blocks.
#[derive(Clone)]
pub struct EventSink {
    shared: Arc<Shared>,
}

impl EventSink {
    /// Deliver one event. On a full queue the oldest non-error event is
    /// dropped so error context survives bursts.
    pub fn push(&self, event: EngineEvent) {
        {
            let mut q = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            if q.closed {
                return;
            }
            if q.events.len() >= self.shared.capacity {
                let victim = q
                    .events
                    .iter()
                    .position(|e| !matches!(e, EngineEvent::Error { .. }))
                    .unwrap_or(0);
                q.events.remove(victim);
                q.dropped += 1;
            }
            q.events.push_back(event);
        }
        self.shared.notify.notify_one();
    }
}

#[derive(Default)]
struct CollectorState {
    transcript: Vec<TranscriptEvent>,
    digest: SessionDigest,
    open_tools: Vec<(String, String)>,
    next_seq: u64,
}

impl CollectorState {
    fn apply(&mut self, event: EngineEvent) {
        let timestamp = Utc::now();
        match event {
            EngineEvent::Turn {
                text,
                tokens_in,
                tokens_out,
            } => {
                self.digest.total_turns += 1;
                self.digest.tokens_in += tokens_in;
                self.digest.tokens_out += tokens_out;
                self.digest.tokens_total += tokens_in + tokens_out;
                let seq = self.bump();
                self.transcript.push(TranscriptEvent::Turn {
                    seq,
                    timestamp,
                    text,
                    tokens_in,
                    tokens_out,
                });
            }
            EngineEvent::ToolStart {
                tool_call_id,
                tool_name,
            } => {
                self.digest.tool_call_count += 1;
                if !self.digest.tools_used.contains(&tool_name) {
                    self.digest.tools_used.push(tool_name.clone());
                }
                self.open_tools.push((tool_call_id.clone(), tool_name.clone()));
                let seq = self.bump();
                self.transcript.push(TranscriptEvent::ToolExecutionStart {
                    seq,
                    timestamp,
                    tool_call_id,
                    tool_name,
                });
            }
            EngineEvent::ToolComplete {
                tool_call_id,
                tool_name,
                success,
            } => {
                // An unmatched completion is an orphan; it stays in the
                // transcript so the pairing invariant is checkable.
                if let Some(pos) = self.open_tools.iter().position(|(id, _)| *id == tool_call_id) {
                    self.open_tools.remove(pos);
                }
                let seq = self.bump();
                self.transcript.push(TranscriptEvent::ToolExecutionComplete {
                    seq,
                    timestamp,
                    tool_call_id,
                    tool_name,
                    success,
                });
            }
            EngineEvent::SkillInvoked { skill_name } => {
                self.digest.skill_invocations.push(skill_name);
            }
            EngineEvent::Error { message, detail } => {
                self.digest.errors.push(message.clone());
                let seq = self.bump();
                self.transcript.push(TranscriptEvent::Error {
                    seq,
                    timestamp,
                    message,
                    detail,
                });
            }
        }
    }

    fn bump(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Per-run event collector.
///
/// Create one per run, hand [`EventCollector::sink`] to the engine before
/// execution starts, and call [`EventCollector::snapshot`] once execution
/// has returned. The collector never fails; whatever arrived is what the
/// snapshot reports.
pub struct EventCollector {
    shared: Arc<Shared>,
    consumer: JoinHandle<CollectorState>,
}

impl EventCollector {
    /// Collector with the default queue bound.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Collector with an explicit queue bound. A bound of at least one is
    /// enforced.
    pub fn with_capacity(capacity: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                events: VecDeque::new(),
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        });

        let consumer_shared = Arc::clone(&shared);
        let consumer = tokio::spawn(async move {
            let mut state = CollectorState::default();
            loop {
                let notified = consumer_shared.notify.notified();
                let (batch, closed) = {
                    let mut q = consumer_shared
                        .queue
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    (q.events.drain(..).collect::<Vec<_>>(), q.closed)
                };

                if batch.is_empty() {
                    if closed {
                        break;
                    }
                    notified.await;
                    continue;
                }

                for event in batch {
                    state.apply(event);
                }
            }
            state
        });

        Self { shared, consumer }
    }

    /// Sink to hand to the engine's event bus.
    pub fn sink(&self) -> EventSink {
        EventSink {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Close the queue, wait for the consumer to drain it, and return the
    /// final transcript and digest.
    pub async fn snapshot(self) -> (Vec<TranscriptEvent>, SessionDigest) {
        {
            let mut q = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            q.closed = true;
        }
        self.shared.notify.notify_one();

        let mut state = match self.consumer.await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("event collector consumer failed: {e}");
                CollectorState::default()
            }
        };

        let dropped = {
            let q = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            q.dropped
        };
        if dropped > 0 {
            let message = format!("event queue overflow: dropped {dropped} events");
            state.digest.errors.push(message.clone());
            let seq = state.bump();
            state.transcript.push(TranscriptEvent::Error {
                seq,
                timestamp: Utc::now(),
                message,
                detail: None,
            });
        }

        for (tool_call_id, _) in state.open_tools.drain(..) {
            state.digest.pending_tool_calls.push(tool_call_id);
        }

        (state.transcript, state.digest)
    }
}

impl Default for EventCollector {
    fn default() -> Self {
        Self::new()
    }
}
