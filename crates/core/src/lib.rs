//! # Dialoguard Core
//!
//! Domain types, traits, and error definitions for the Dialoguard
//! structured-response pipeline. This crate defines the domain model that
//! every other crate implements against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here: the upstream model
//! ([`Provider`]), persistence ([`ConversationStore`]) and outbound alerts
//! ([`Notifier`]). Implementations live in their respective crates, which
//! keeps the pipeline testable with scripted stand-ins.

pub mod error;
pub mod message;
pub mod notify;
pub mod provider;
pub mod store;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use message::{Attachment, Conversation, ConversationId, Message, MessagePayload, Role};
pub use notify::{DeliveryReport, Notifier, notify_all};
pub use provider::{PromptMessage, Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage};
pub use store::{ConversationStore, CoverageMap, ProgressRecord, TopicCoverage};
