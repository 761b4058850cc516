//! Upstream provider implementations for Dialoguard.
//!
//! All providers implement the `dialoguard_core::Provider` trait. The
//! shipped implementation speaks the OpenAI-compatible chat-completions
//! protocol in both blocking and SSE streaming form.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;
