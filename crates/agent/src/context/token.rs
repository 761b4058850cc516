//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token. Good enough
//! to bound the history window and to annotate the context snapshot; the
//! upstream's own usage figures are what gets persisted.

use dialoguard_core::provider::PromptMessage;

/// Per-message overhead for role name and delimiters in the wire format.
const MESSAGE_OVERHEAD: usize = 4;

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Estimate tokens for a single prompt message including overhead.
pub fn estimate_message_tokens(message: &PromptMessage) -> usize {
    MESSAGE_OVERHEAD + estimate_tokens(&message.content)
}

/// Estimate tokens for a slice of prompt messages.
pub fn estimate_messages_tokens(messages: &[PromptMessage]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}
