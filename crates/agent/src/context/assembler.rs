//! Layered instruction assembly.
//!
//! Composes the directives sent upstream from up to six layers. Each stage
//! prepends its layer, so the final order is:
//!
//! | Position | Layer | Present when |
//! |----------|-------|--------------|
//! | 1 | Mode overlay | a mode is selected (topic-restricted > narrow-viewport > guided-form) |
//! | 2 | Progress | tracking enabled and at least one topic |
//! | 3 | Safety | detection enabled and the keyword list is non-empty |
//! | 4 | Schema | always |
//! | 5 | Language | a language is set |
//! | 6 | Base | always |
//!
//! # Determinism
//!
//! Assembly is pure: identical inputs always produce identical layers. It
//! never fails; a missing optional input only omits its layer.

use std::collections::VecDeque;

use dialoguard_config::ModesConfig;
use dialoguard_core::message::{Message, MessagePayload, Role};
use dialoguard_core::provider::PromptMessage;
use dialoguard_protocol::schema_instruction;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::context::token;

// ── Types ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Base,
    Language,
    Schema,
    Safety,
    Progress,
    Mode,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Language => "language",
            Self::Schema => "schema",
            Self::Safety => "safety",
            Self::Progress => "progress",
            Self::Mode => "mode",
        }
    }
}

/// One role-tagged instruction fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionLayer {
    pub kind: LayerKind,
    pub role: Role,
    pub content: String,
}

impl InstructionLayer {
    fn system(kind: LayerKind, content: String) -> Self {
        Self {
            kind,
            role: Role::System,
            content,
        }
    }
}

/// Interaction-mode overlay; at most one applies per turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "topic", rename_all = "snake_case")]
pub enum InteractionMode {
    TopicRestricted(String),
    NarrowViewport,
    GuidedForm,
}

impl InteractionMode {
    /// First match wins: topic-restricted, then narrow-viewport, then guided-form.
    pub fn select(topic_restricted: Option<&str>, narrow_viewport: bool, guided_form: bool) -> Option<Self> {
        if let Some(topic) = topic_restricted.map(str::trim).filter(|t| !t.is_empty()) {
            Some(Self::TopicRestricted(topic.to_string()))
        } else if narrow_viewport {
            Some(Self::NarrowViewport)
        } else if guided_form {
            Some(Self::GuidedForm)
        } else {
            None
        }
    }

    /// Select from configured modes, with a per-request narrow-viewport hint.
    pub fn from_config(modes: &ModesConfig, narrow_viewport_hint: bool) -> Option<Self> {
        Self::select(
            modes.topic_restricted.as_deref(),
            modes.narrow_viewport || narrow_viewport_hint,
            modes.guided_form,
        )
    }

    fn instruction(&self) -> String {
        match self {
            Self::TopicRestricted(topic) => format!(
                "MODE: TOPIC RESTRICTED\n\
                 Only discuss \"{topic}\". If the user raises something else, acknowledge it briefly \
                 and guide the conversation back to \"{topic}\". Safety concerns always take precedence."
            ),
            Self::NarrowViewport => "MODE: NARROW VIEWPORT\n\
                 The user is on a small screen. Keep each text block to a few short sentences, \
                 prefer one block per idea, avoid wide tables and offer at most three suggestions."
                .to_string(),
            Self::GuidedForm => "MODE: GUIDED FORM\n\
                 Collect answers through `content.form` whenever a question has a fixed set of \
                 possible answers. Use radio for one choice, checkbox for several and select for \
                 long lists. Keep the accompanying text short."
                .to_string(),
        }
    }
}

/// Inputs for one assembly. Absent inputs omit their layer.
#[derive(Debug, Clone, Default)]
pub struct AssemblyOptions {
    /// Conversation language (ISO 639-1)
    pub language: Option<String>,
    /// Keywords to mention in the safety addendum; empty when detection is off
    pub safety_keywords: Vec<String>,
    /// Progress addendum; `None` when tracking is off or there are no topics
    pub progress_addendum: Option<String>,
    pub mode: Option<InteractionMode>,
}

// ── Layers ────────────────────────────────────────────────────────────────

fn language_name(code: &str) -> Option<&'static str> {
    Some(match code {
        "en" => "English",
        "de" => "German",
        "fr" => "French",
        "es" => "Spanish",
        "nl" => "Dutch",
        "it" => "Italian",
        _ => return None,
    })
}

fn language_instruction(language: &str) -> String {
    let code = language.trim().to_ascii_lowercase();
    let name = language_name(&code).map(String::from).unwrap_or_else(|| code.clone());
    format!(
        "LANGUAGE\n\
         Use {name} ({code}) and only {name} for every text block, form label and suggestion, \
         unless the user explicitly switches language. If they do, continue in their language."
    )
}

fn safety_instruction(keywords: &[String]) -> String {
    format!(
        "SAFETY\n\
         Watch for signs that the user may be in danger. The following phrases are known warning \
         signals: {}.\n\
         If the user expresses intent to harm themselves or others, set `safety.is_safe` to false, \
         `safety.danger_level` to \"emergency\" and `safety.requires_intervention` to true, and put a \
         calm, supportive message in `safety.safety_message`. Use \"warning\" or \"critical\" for \
         lesser concerns.",
        keywords
            .iter()
            .map(|k| format!("\"{k}\""))
            .collect::<Vec<_>>()
            .join(", ")
    )
}

/// Compose the instruction layers for one turn.
pub fn assemble(base_instructions: &str, options: &AssemblyOptions) -> Vec<InstructionLayer> {
    let mut layers = VecDeque::with_capacity(6);
    layers.push_back(InstructionLayer::system(LayerKind::Base, base_instructions.to_string()));

    if let Some(language) = options.language.as_deref().filter(|l| !l.trim().is_empty()) {
        layers.push_front(InstructionLayer::system(LayerKind::Language, language_instruction(language)));
    }

    layers.push_front(InstructionLayer::system(LayerKind::Schema, schema_instruction()));

    if !options.safety_keywords.is_empty() {
        layers.push_front(InstructionLayer::system(
            LayerKind::Safety,
            safety_instruction(&options.safety_keywords),
        ));
    }

    if let Some(addendum) = options.progress_addendum.as_deref().filter(|a| !a.is_empty()) {
        layers.push_front(InstructionLayer::system(LayerKind::Progress, addendum.to_string()));
    }

    if let Some(mode) = &options.mode {
        layers.push_front(InstructionLayer::system(LayerKind::Mode, mode.instruction()));
    }

    layers.into()
}

// ── Assembler ─────────────────────────────────────────────────────────────

/// Holds the host's base instructions and the history budget. Stateless
/// otherwise; build one per configuration and reuse it.
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    base_instructions: String,
    history_limit: usize,
    history_token_budget: usize,
}

impl ContextAssembler {
    pub fn new(base_instructions: impl Into<String>, history_limit: usize) -> Self {
        Self {
            base_instructions: base_instructions.into(),
            history_limit,
            history_token_budget: 8192,
        }
    }

    pub fn with_history_token_budget(mut self, budget: usize) -> Self {
        self.history_token_budget = budget;
        self
    }

    pub fn base_instructions(&self) -> &str {
        &self.base_instructions
    }

    pub fn assemble(&self, options: &AssemblyOptions) -> Vec<InstructionLayer> {
        assemble(&self.base_instructions, options)
    }

    /// Layers, then the most recent history that fits, then the user turn.
    ///
    /// History is trimmed oldest-first to `history_limit` messages and the
    /// history token budget. Stored system messages are never replayed.
    pub fn to_prompt_messages(
        &self,
        layers: &[InstructionLayer],
        history: &[Message],
        user_turn: &Message,
    ) -> Vec<PromptMessage> {
        let mut messages: Vec<PromptMessage> = layers
            .iter()
            .map(|l| PromptMessage {
                role: l.role,
                content: l.content.clone(),
            })
            .collect();

        messages.extend(self.history_window(history));
        messages.push(PromptMessage::user(render_user_turn(user_turn)));
        messages
    }

    fn history_window(&self, history: &[Message]) -> Vec<PromptMessage> {
        let mut window = Vec::new();
        let mut used = 0;
        for message in history.iter().rev().filter(|m| m.role != Role::System) {
            if window.len() >= self.history_limit {
                break;
            }
            let prompt = match message.role {
                Role::User => PromptMessage::user(render_user_turn(message)),
                _ => PromptMessage::assistant(message.content.clone()),
            };
            let cost = token::estimate_message_tokens(&prompt);
            if used + cost > self.history_token_budget {
                break;
            }
            used += cost;
            window.push(prompt);
        }
        window.reverse();
        window
    }

    /// The "context sent" snapshot persisted with the assistant message.
    pub fn snapshot(&self, layers: &[InstructionLayer], messages: &[PromptMessage]) -> serde_json::Value {
        let history_messages = messages.len().saturating_sub(layers.len() + 1);
        json!({
            "layers": layers
                .iter()
                .map(|l| json!({
                    "kind": l.kind.as_str(),
                    "role": l.role.as_str(),
                    "content": l.content,
                    "estimated_tokens": token::estimate_tokens(&l.content),
                }))
                .collect::<Vec<_>>(),
            "history_messages": history_messages,
            "estimated_tokens": token::estimate_messages_tokens(messages),
        })
    }
}

/// Plain-text rendering of a user message, including its side payload.
pub fn render_user_turn(message: &Message) -> String {
    match &message.payload {
        MessagePayload::None => message.content.clone(),
        MessagePayload::FormSubmission(fields) => {
            let mut text = String::new();
            if !message.content.trim().is_empty() {
                text.push_str(&message.content);
                text.push_str("\n\n");
            }
            text.push_str("Form submission:");
            for (name, value) in fields {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                text.push_str(&format!("\n- {name}: {value}"));
            }
            text
        }
        MessagePayload::Attachments(attachments) => {
            let names: Vec<&str> = attachments
                .iter()
                .map(|a| a.filename.as_deref().unwrap_or(a.url.as_str()))
                .collect();
            format!("{}\n\n[Attachments: {}]", message.content, names.join(", "))
        }
    }
}
