//! Conversation and Message domain types.
//!
//! These are the durable records the pipeline commits:
//! user sends a message → pipeline assembles context → upstream answers →
//! exactly one assistant message is written for the turn.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::provider::Usage;

/// Unique identifier for a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// Instruction layers (only ever sent upstream, never stored as a message)
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// A conversation owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,

    /// Owning user (row scoping key)
    pub user_id: String,

    /// Model identifier used for this conversation
    pub model: String,

    /// Set when a safety emergency blocked further turns
    #[serde(default)]
    pub blocked: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Soft-delete marker; conversations are never hard-deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// Create a new, unblocked conversation.
    pub fn new(user_id: impl Into<String>, model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            user_id: user_id.into(),
            model: model.into(),
            blocked: false,
            blocked_reason: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A file or media reference attached to a user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Storage reference (URL, object key, ...)
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Side payload of a message, decided once at the boundary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Files uploaded alongside the text
    Attachments(Vec<Attachment>),
    /// Answers to a form the assistant rendered earlier (field name → value)
    FormSubmission(serde_json::Map<String, serde_json::Value>),
    #[default]
    None,
}

impl MessagePayload {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// A single committed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,

    pub conversation_id: ConversationId,

    pub role: Role,

    /// Plain text; rendered markup is always derived, never stored
    pub content: String,

    #[serde(default, skip_serializing_if = "MessagePayload::is_none")]
    pub payload: MessagePayload,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Validated upstream payload (or raw text for invalid turns)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<serde_json::Value>,

    /// Instruction layers and history that were sent upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_sent: Option<serde_json::Value>,

    /// False when the content did not satisfy the response schema
    #[serde(default = "default_valid")]
    pub valid: bool,

    pub timestamp: DateTime<Utc>,
}

fn default_valid() -> bool {
    true
}

impl Message {
    /// Create a new user message.
    pub fn user(conversation_id: &ConversationId, content: impl Into<String>) -> Self {
        Self::with_role(conversation_id, Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(conversation_id: &ConversationId, content: impl Into<String>) -> Self {
        Self::with_role(conversation_id, Role::Assistant, content)
    }

    fn with_role(conversation_id: &ConversationId, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.clone(),
            role,
            content: content.into(),
            payload: MessagePayload::None,
            usage: None,
            raw_payload: None,
            context_sent: None,
            valid: true,
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: MessagePayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_usage(mut self, usage: Option<Usage>) -> Self {
        self.usage = usage;
        self
    }

    /// Total tokens recorded for this message, 0 when unknown.
    pub fn tokens_used(&self) -> u32 {
        self.usage.as_ref().map(|u| u.total_tokens).unwrap_or(0)
    }
}
