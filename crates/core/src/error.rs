//! Error types for the Dialoguard domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error type; the top-level [`Error`]
//! composes them and carries the non-technical message shown to end users.

use thiserror::Error;

/// The top-level error type for every pipeline operation.
#[derive(Debug, Error)]
pub enum Error {
    // --- Surfaced before any upstream call ---
    #[error("Rate limit exceeded: {0}")]
    RateLimited(#[from] RateLimitError),

    // --- Upstream transport ---
    #[error("Transport error: {0}")]
    Provider(#[from] ProviderError),

    // --- Structured output contract ---
    #[error("Schema validation failed: {0}")]
    SchemaValidation(#[from] SchemaValidationError),

    // --- Safety escalation ---
    #[error("Conversation {conversation_id} blocked: {reason}")]
    SafetyBlocked {
        conversation_id: String,
        reason: String,
        /// Supportive text returned to the user instead of model output.
        supportive_message: String,
    },

    // --- Persistence ---
    #[error("Persistence failure: {0}")]
    Store(#[from] StoreError),

    // --- Progress tracking ---
    #[error("Progress error: {0}")]
    Progress(#[from] ProgressError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The message shown to the end user. Never contains diagnostic detail.
    pub fn user_message(&self) -> String {
        match self {
            Self::RateLimited(_) => {
                "You're sending messages faster than we can answer. Please wait a minute and try again.".into()
            }
            Self::Provider(_) => {
                "The assistant is temporarily unreachable. Please try again in a moment.".into()
            }
            Self::SchemaValidation(_) => {
                "The assistant could not prepare a proper answer this time. Please rephrase or try again.".into()
            }
            Self::SafetyBlocked {
                supportive_message, ..
            } => supportive_message.clone(),
            Self::Store(_) => {
                "We couldn't save your message. Please try again.".into()
            }
            Self::Progress(ProgressError::UnknownTopic(_)) => {
                "That topic is not part of this conversation.".into()
            }
            _ => "Something went wrong on our side. Please try again.".into(),
        }
    }

    /// Short machine-readable code used by API surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "rate_limited",
            Self::Provider(_) => "transport_error",
            Self::SchemaValidation(_) => "schema_validation_failed",
            Self::SafetyBlocked { .. } => "safety_blocked",
            Self::Store(_) => "persistence_failure",
            Self::Progress(_) => "progress_error",
            Self::Config { .. } => "config_error",
            Self::Serialization(_) => "serialization_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Upstream transport failures. Never retried by the response protocol.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Malformed upstream response: {0}")]
    MalformedResponse(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Exhausted structured-output retries. Keeps the last raw text for audit.
#[derive(Debug, Clone, Error)]
#[error("{attempts} attempt(s) produced no schema-valid response: {}", errors.join("; "))]
pub struct SchemaValidationError {
    pub attempts: u32,
    pub errors: Vec<String>,
    pub last_raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("{limit} requests per minute allowed for user {user_id}")]
    TooManyRequests { user_id: String, limit: u32 },

    #[error("{limit} open conversations allowed for user {user_id}")]
    TooManyConversations { user_id: String, limit: u32 },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Conversation already blocked: {0}")]
    AlreadyBlocked(String),

    #[error("Conversation is not blocked: {0}")]
    NotBlocked(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notifier not configured: {0}")]
    NotConfigured(String),

    #[error("Notification delivery failed to {recipient}: {reason}")]
    DeliveryFailed { recipient: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Progress tracking is disabled")]
    Disabled,
}
