//! ConversationStore trait — the persistence collaborator.
//!
//! The pipeline never issues raw queries. Every durable effect goes through
//! this trait: conversations, messages, blocked state and progress records.
//! Implementations must honour soft-delete (deleted conversations are
//! invisible) and per-user row scoping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::message::{Conversation, ConversationId, Message};

/// Coverage state of one topic in one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicCoverage {
    pub is_covered: bool,

    /// 0.0 – 1.0; confirmation sets it to 1.0
    pub coverage: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl TopicCoverage {
    pub fn uncovered() -> Self {
        Self {
            is_covered: false,
            coverage: 0.0,
            confirmed_at: None,
        }
    }

    pub fn confirmed(at: DateTime<Utc>) -> Self {
        Self {
            is_covered: true,
            coverage: 1.0,
            confirmed_at: Some(at),
        }
    }
}

/// Topic id → coverage.
pub type CoverageMap = BTreeMap<String, TopicCoverage>;

/// Stored progress for one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub conversation_id: ConversationId,

    /// Aggregate percentage; never decreases between updates
    pub percentage: f32,

    #[serde(default)]
    pub topics: CoverageMap,

    /// Topic the assistant last asked the user to confirm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_topic: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn empty(conversation_id: &ConversationId) -> Self {
        Self {
            conversation_id: conversation_id.clone(),
            percentage: 0.0,
            topics: CoverageMap::new(),
            pending_topic: None,
            updated_at: Utc::now(),
        }
    }

    pub fn covered_count(&self) -> usize {
        self.topics.values().filter(|t| t.is_covered).count()
    }

    /// Merge an incoming record into this one; used by store backends.
    pub fn merge(&mut self, incoming: &ProgressRecord) {
        self.percentage = self.percentage.max(incoming.percentage);
        for (topic_id, coverage) in &incoming.topics {
            match self.topics.get_mut(topic_id) {
                Some(existing) if existing.is_covered => {
                    if coverage.is_covered {
                        existing.confirmed_at = match (existing.confirmed_at, coverage.confirmed_at) {
                            (Some(a), Some(b)) => Some(a.min(b)),
                            (a, b) => a.or(b),
                        };
                    }
                }
                Some(existing) => {
                    existing.is_covered = coverage.is_covered;
                    existing.coverage = existing.coverage.max(coverage.coverage);
                    existing.confirmed_at = coverage.confirmed_at;
                }
                None => {
                    self.topics.insert(topic_id.clone(), coverage.clone());
                }
            }
        }
        self.pending_topic = incoming.pending_topic.clone();
        self.updated_at = incoming.updated_at.max(self.updated_at);
    }
}

/// The persistence contract consumed by the pipeline.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Create and persist a new conversation for `user_id`.
    async fn create_conversation(&self, user_id: &str, model: &str) -> Result<Conversation, StoreError>;

    /// Fetch a conversation; soft-deleted conversations are `None`.
    async fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError>;

    /// Append a message and bump the conversation's `updated_at`.
    async fn add_message(&self, message: Message) -> Result<String, StoreError>;

    /// Replace a stored message by id.
    async fn update_message(&self, message: &Message) -> Result<(), StoreError>;

    /// The most recent `limit` messages, oldest first.
    async fn get_messages(&self, conversation_id: &ConversationId, limit: usize) -> Result<Vec<Message>, StoreError>;

    /// Mark a conversation blocked. Errors with `AlreadyBlocked` if it already is.
    async fn block_conversation(&self, id: &ConversationId, reason: &str) -> Result<(), StoreError>;

    /// Clear the blocked flag. Errors with `NotBlocked` if it is not blocked.
    async fn unblock_conversation(&self, id: &ConversationId) -> Result<(), StoreError>;

    /// Soft-delete; returns false when nothing was deleted.
    async fn soft_delete_conversation(&self, id: &ConversationId) -> Result<bool, StoreError>;

    /// Stored progress for a conversation, if any.
    async fn get_progress(&self, id: &ConversationId) -> Result<Option<ProgressRecord>, StoreError>;

    /// Merge `record` into the stored progress and return the result.
    ///
    /// The merge is an atomic read-modify-write: the stored percentage
    /// becomes the max of both, a covered topic stays covered (earliest
    /// `confirmed_at` wins) and `pending_topic` is taken from `record`.
    async fn update_progress(&self, record: &ProgressRecord) -> Result<ProgressRecord, StoreError>;

    /// Conversations a user currently has open (not deleted, not blocked).
    async fn count_open_conversations(&self, user_id: &str) -> Result<usize, StoreError>;
}
