//! # Dialoguard Progress
//!
//! Topic extraction from the configuration document and confirmation-based
//! coverage tracking per conversation.

pub mod prompts;
pub mod topics;
pub mod tracker;

pub use prompts::{confirmation_prompt, is_affirmative, progress_addendum};
pub use topics::{ParseStrategy, Topic, TopicCatalog};
pub use tracker::{ProgressReport, TopicProgressTracker, TopicStatus};
