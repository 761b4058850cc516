//! StreamDeliveryBuffer — one streaming turn, committed exactly once.
//!
//! ```text
//! Idle ──start──▶ Streaming ──finalize────────▶ Finalized
//!                     │ ──emergency_save──────▶ EmergencySaved
//!                     └ ──(nothing to save)───▶ Failed
//! ```
//!
//! Chunks are accumulated in memory and relayed to the live client; nothing
//! is persisted per chunk. Leaving `Streaming` is the completion guard: the
//! commit path runs for the first completion signal only and every later
//! signal is a no-op.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dialoguard_core::error::Result;
use dialoguard_core::provider::Usage;
use dialoguard_core::{ConversationId, ConversationStore, Message};
use dialoguard_protocol::{ResponseEnvelope, strip_code_fence, validate};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, info, warn};

use crate::stream_event::StreamEvent;

/// Appended to partially delivered text saved after a transport failure.
pub const INTERRUPTION_MARKER: &str = "[Response interrupted]";

/// How long one event may wait for room in the client channel before the
/// client is treated as gone.
pub const DEFAULT_CLIENT_STALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming,
    Finalized,
    EmergencySaved,
    /// Ended with nothing to save
    Failed,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::EmergencySaved | Self::Failed)
    }
}

/// What a completion signal did.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    /// The full text was committed. `envelope` is set when it validated.
    Finalized {
        message: Message,
        envelope: Option<ResponseEnvelope>,
        errors: Vec<String>,
    },
    /// Partial text was committed with the interruption marker.
    EmergencySaved { message: Message },
    /// Nothing had been received; nothing was persisted.
    NothingSaved,
    /// A previous signal already completed the turn.
    AlreadyCompleted,
}

pub struct StreamDeliveryBuffer {
    conversation_id: ConversationId,
    store: Arc<dyn ConversationStore>,
    output: Option<mpsc::Sender<StreamEvent>>,
    client_connected: bool,
    client_stall_timeout: Duration,
    state: StreamState,
    text: String,
    started_at: Option<Instant>,
    context_sent: Option<serde_json::Value>,
}

impl std::fmt::Debug for StreamDeliveryBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDeliveryBuffer")
            .field("conversation_id", &self.conversation_id)
            .field("state", &self.state)
            .field("buffered_bytes", &self.text.len())
            .field("client_connected", &self.client_connected)
            .finish()
    }
}

impl StreamDeliveryBuffer {
    pub fn new(
        conversation_id: ConversationId,
        store: Arc<dyn ConversationStore>,
        output: Option<mpsc::Sender<StreamEvent>>,
    ) -> Self {
        let client_connected = output.is_some();
        Self {
            conversation_id,
            store,
            output,
            client_connected,
            client_stall_timeout: DEFAULT_CLIENT_STALL_TIMEOUT,
            state: StreamState::Idle,
            text: String::new(),
            started_at: None,
            context_sent: None,
        }
    }

    /// Snapshot stored with the committed message.
    pub fn with_context_snapshot(mut self, snapshot: serde_json::Value) -> Self {
        self.context_sent = Some(snapshot);
        self
    }

    pub fn with_client_stall_timeout(mut self, timeout: Duration) -> Self {
        self.client_stall_timeout = timeout;
        self
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn client_connected(&self) -> bool {
        self.client_connected
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.map(|s| s.elapsed()).unwrap_or_default()
    }

    pub fn start(&mut self) {
        if self.state == StreamState::Idle {
            self.state = StreamState::Streaming;
            self.started_at = Some(Instant::now());
            debug!(conversation_id = %self.conversation_id, "Stream started");
        }
    }

    /// Accumulate a chunk and relay it. Ignored outside `Streaming`.
    pub async fn append(&mut self, chunk: &str) {
        if self.state != StreamState::Streaming {
            debug!(state = ?self.state, "Chunk ignored outside streaming state");
            return;
        }
        if chunk.is_empty() {
            return;
        }
        self.text.push_str(chunk);
        self.emit(StreamEvent::Chunk {
            content: chunk.to_string(),
        })
        .await;
    }

    /// Commit the accumulated text once and emit `done`.
    ///
    /// The text is validated against the response schema; invalid text is
    /// still committed, flagged `valid = false`, since it was already shown.
    pub async fn finalize(&mut self, usage: Option<Usage>) -> Result<CommitOutcome> {
        if !self.claim(StreamState::Finalized) {
            return Ok(CommitOutcome::AlreadyCompleted);
        }

        let outcome = validate(&self.text);
        let valid = outcome.valid;
        let (content, raw_payload) = match &outcome.envelope {
            Some(envelope) if valid => (
                envelope.plain_text(),
                serde_json::from_str(strip_code_fence(&self.text)).ok(),
            ),
            _ => (
                strip_code_fence(&self.text).to_string(),
                Some(serde_json::Value::String(self.text.clone())),
            ),
        };

        let mut message = Message::assistant(&self.conversation_id, content).with_usage(usage.clone());
        message.raw_payload = raw_payload;
        message.context_sent = self.context_sent.take();
        message.valid = valid;

        if let Err(e) = self.store.add_message(message.clone()).await {
            self.emit(StreamEvent::Error {
                message: "We could not save this response. Please try again.".into(),
                partial_saved: false,
            })
            .await;
            return Err(e.into());
        }

        if !valid {
            warn!(
                conversation_id = %self.conversation_id,
                errors = ?outcome.errors,
                "Streamed response failed schema validation; committed as invalid"
            );
        }
        info!(
            conversation_id = %self.conversation_id,
            message_id = %message.id,
            bytes = self.text.len(),
            elapsed_ms = self.elapsed().as_millis() as u64,
            valid,
            "Stream finalized"
        );

        self.emit(StreamEvent::Done {
            conversation_id: self.conversation_id.to_string(),
            message_id: message.id.clone(),
            usage,
            valid,
        })
        .await;

        Ok(CommitOutcome::Finalized {
            message,
            envelope: outcome.envelope.filter(|_| valid),
            errors: outcome.errors,
        })
    }

    /// Save what arrived before an unrecoverable transport error.
    ///
    /// With nothing accumulated this only emits the error event.
    pub async fn emergency_save(&mut self, error_text: &str) -> Result<CommitOutcome> {
        if self.text.is_empty() {
            return Ok(self.fail(error_text).await);
        }
        if !self.claim(StreamState::EmergencySaved) {
            return Ok(CommitOutcome::AlreadyCompleted);
        }

        let content = format!("{}\n\n{INTERRUPTION_MARKER}", strip_code_fence(&self.text));
        let mut message = Message::assistant(&self.conversation_id, content);
        message.raw_payload = Some(serde_json::json!({
            "interrupted": true,
            "error": error_text,
            "partial": self.text,
        }));
        message.context_sent = self.context_sent.take();
        message.valid = false;

        let saved = self.store.add_message(message.clone()).await;
        warn!(
            conversation_id = %self.conversation_id,
            error = %error_text,
            bytes = self.text.len(),
            saved = saved.is_ok(),
            "Stream interrupted; partial response saved"
        );

        self.emit(StreamEvent::Error {
            message: "The response was interrupted. What arrived so far has been saved.".into(),
            partial_saved: saved.is_ok(),
        })
        .await;

        saved?;
        Ok(CommitOutcome::EmergencySaved { message })
    }

    /// The producer ended without a terminator.
    pub async fn fallback(&mut self, usage: Option<Usage>) -> Result<CommitOutcome> {
        if self.text.is_empty() {
            return Ok(self.fail("stream ended without content").await);
        }
        debug!(conversation_id = %self.conversation_id, "Stream ended without terminator; finalizing");
        self.finalize(usage).await
    }

    async fn fail(&mut self, error_text: &str) -> CommitOutcome {
        if !self.claim(StreamState::Failed) {
            return CommitOutcome::AlreadyCompleted;
        }
        warn!(conversation_id = %self.conversation_id, error = %error_text, "Stream failed before any content");
        self.emit(StreamEvent::Error {
            message: "The assistant is unavailable right now. Please try again.".into(),
            partial_saved: false,
        })
        .await;
        CommitOutcome::NothingSaved
    }

    /// Leave `Streaming` for `next`; false when already completed.
    fn claim(&mut self, next: StreamState) -> bool {
        match self.state {
            StreamState::Streaming => {
                self.state = next;
                true
            }
            StreamState::Idle => {
                // A completion without any chunk still has to pass through Streaming
                self.start();
                self.state = next;
                true
            }
            _ => {
                debug!(state = ?self.state, "Completion signal after commit ignored");
                false
            }
        }
    }

    /// Relay to the client. A client that has gone away, or that stops
    /// reading for longer than the stall timeout, is dropped; accumulation
    /// and the commit continue without it.
    pub async fn emit(&mut self, event: StreamEvent) {
        if !self.client_connected {
            return;
        }
        let Some(tx) = &self.output else {
            return;
        };
        match tx.send_timeout(event, self.client_stall_timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Closed(_)) => {
                info!(conversation_id = %self.conversation_id, "Client disconnected; continuing to drain upstream");
                self.client_connected = false;
                self.output = None;
            }
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(
                    conversation_id = %self.conversation_id,
                    timeout_ms = self.client_stall_timeout.as_millis() as u64,
                    "Client stopped reading; continuing to drain upstream without it"
                );
                self.client_connected = false;
                self.output = None;
            }
        }
    }
}
