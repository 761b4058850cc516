//! Events relayed to a live client during a streaming turn.
//!
//! The gateway forwards these over SSE using `event_type()` as the event
//! name and the JSON serialization as the data:
//! - `chunk`    — partial text from the upstream
//! - `safety`   — a safety verdict that changed the turn
//! - `progress` — updated topic progress after commit
//! - `done`     — the turn was committed
//! - `error`    — the turn failed (partial content may have been saved)

use dialoguard_core::provider::Usage;
use dialoguard_progress::ProgressReport;
use dialoguard_protocol::DangerLevel;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Partial text from the upstream.
    Chunk { content: String },

    /// The turn was halted or flagged for safety.
    Safety {
        danger_level: DangerLevel,
        blocked: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Progress after this turn.
    Progress { progress: ProgressReport },

    /// The assistant message was committed.
    Done {
        conversation_id: String,
        message_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        /// Whether the committed text satisfied the response schema
        valid: bool,
    },

    /// The turn failed; `partial_saved` tells whether accumulated text was kept.
    Error {
        message: String,
        partial_saved: bool,
    },
}

impl StreamEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => "chunk",
            Self::Safety { .. } => "safety",
            Self::Progress { .. } => "progress",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
