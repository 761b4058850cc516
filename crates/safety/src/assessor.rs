//! SafetyAssessor — turns verdicts into effects.
//!
//! Verdicts come from two places: the pre-flight keyword scan of the raw
//! user text and the `safety` section of a validated envelope. Any unsafe
//! verdict is audited. An emergency blocks the conversation (once) and
//! notifies every configured recipient.

use std::sync::Arc;

use chrono::Utc;
use dialoguard_config::SafetyConfig;
use dialoguard_core::error::StoreError;
use dialoguard_core::notify::{DeliveryReport, Notifier, notify_all};
use dialoguard_core::{Conversation, ConversationStore};
use dialoguard_protocol::SafetySection;
use tracing::{error, info, warn};

use crate::audit::{AuditEntry, AuditEvent, AuditLogger, AuditSink, JsonLinesSink, TracingSink};
use crate::scanner::{KeywordMatch, KeywordScanner, excerpt};
use crate::verdict::{SafetyVerdict, VerdictSource};

/// What the assessor did with a verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum SafetyAction {
    /// Nothing unsafe
    Proceed,
    /// Unsafe below emergency: audited, the turn continues
    Flagged,
    /// The conversation was blocked by this call
    Blocked {
        supportive_message: String,
        deliveries: Vec<DeliveryReport>,
    },
    /// An emergency on a conversation that was already blocked
    AlreadyBlocked { supportive_message: String },
}

impl SafetyAction {
    /// Whether the turn must stop and return the supportive message.
    pub fn halts_turn(&self) -> bool {
        matches!(self, Self::Blocked { .. } | Self::AlreadyBlocked { .. })
    }

    pub fn supportive_message(&self) -> Option<&str> {
        match self {
            Self::Blocked { supportive_message, .. } | Self::AlreadyBlocked { supportive_message } => {
                Some(supportive_message)
            }
            _ => None,
        }
    }
}

pub struct SafetyAssessor {
    enabled: bool,
    scanner: KeywordScanner,
    recipients: Vec<String>,
    supportive_message: String,
    excerpt_chars: usize,
    store: Arc<dyn ConversationStore>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<AuditLogger>,
}

impl SafetyAssessor {
    /// Build from configuration. Keyword matchers are compiled here, once.
    pub fn new(config: &SafetyConfig, store: Arc<dyn ConversationStore>, notifier: Arc<dyn Notifier>) -> Self {
        let mut sinks: Vec<Box<dyn AuditSink>> = vec![Box::new(TracingSink)];
        if let Some(path) = &config.audit_log {
            sinks.push(Box::new(JsonLinesSink::new(path)));
        }

        Self {
            enabled: config.enabled,
            scanner: KeywordScanner::from_config(config),
            recipients: config.recipients.clone(),
            supportive_message: config.supportive_message.clone(),
            excerpt_chars: config.excerpt_chars,
            store,
            notifier,
            audit: Arc::new(AuditLogger::with_sinks(sinks)),
        }
    }

    /// Replace the audit logger (tests and hosts that aggregate audits).
    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    /// Keyword phrases for the assembler's safety addendum. Empty when
    /// detection is disabled.
    pub fn keyword_phrases(&self) -> Vec<String> {
        if !self.enabled {
            return Vec::new();
        }
        self.scanner.phrases().into_iter().map(String::from).collect()
    }

    /// Scan raw user text. Disabled detection always yields a safe verdict.
    pub fn preflight(&self, text: &str) -> (SafetyVerdict, Vec<KeywordMatch>) {
        if !self.enabled {
            return (SafetyVerdict::safe(VerdictSource::Preflight), Vec::new());
        }
        self.scanner.verdict(text)
    }

    /// Extract the verdict from a validated envelope.
    pub fn from_envelope(&self, section: &SafetySection) -> SafetyVerdict {
        if !self.enabled {
            return SafetyVerdict::safe(VerdictSource::Model);
        }
        SafetyVerdict::from_section(section)
    }

    /// Apply a verdict: audit, and escalate emergencies.
    ///
    /// `trigger_text` is the text that produced the verdict; only an
    /// excerpt of it is kept.
    pub async fn assess(
        &self,
        conversation: &Conversation,
        verdict: &SafetyVerdict,
        trigger_text: &str,
    ) -> dialoguard_core::Result<SafetyAction> {
        if !verdict.is_unsafe() {
            return Ok(SafetyAction::Proceed);
        }

        let concerns: Vec<String> = verdict.detected_concerns.iter().cloned().collect();
        warn!(
            conversation_id = %conversation.id,
            user_id = %conversation.user_id,
            danger_level = %verdict.danger_level,
            source = verdict.source.as_str(),
            concerns = ?concerns,
            "Unsafe content detected"
        );
        self.audit.log(self.entry(
            conversation,
            verdict,
            AuditEvent::UnsafeContent { source: verdict.source },
            Some(excerpt(trigger_text, self.excerpt_chars)),
        ));

        if !verdict.blocks() {
            return Ok(SafetyAction::Flagged);
        }

        let supportive_message = verdict
            .safety_message
            .clone()
            .unwrap_or_else(|| self.supportive_message.clone());

        self.escalate(conversation, verdict, supportive_message).await
    }

    async fn escalate(
        &self,
        conversation: &Conversation,
        verdict: &SafetyVerdict,
        supportive_message: String,
    ) -> dialoguard_core::Result<SafetyAction> {
        let reason = format!(
            "{} {} safety signal: {}",
            verdict.source.as_str(),
            verdict.danger_level,
            verdict.detected_concerns.iter().cloned().collect::<Vec<_>>().join(", ")
        );

        match self.store.block_conversation(&conversation.id, &reason).await {
            Ok(()) => {}
            Err(StoreError::AlreadyBlocked(_)) => {
                warn!(conversation_id = %conversation.id, "Conversation already blocked, not re-applying");
                return Ok(SafetyAction::AlreadyBlocked { supportive_message });
            }
            Err(e) => {
                error!(conversation_id = %conversation.id, error = %e, "Failed to block conversation");
                return Err(e.into());
            }
        }

        info!(conversation_id = %conversation.id, reason = %reason, "Conversation blocked");
        self.audit.log(self.entry(
            conversation,
            verdict,
            AuditEvent::ConversationBlocked { reason: reason.clone() },
            None,
        ));

        let deliveries = self.notify(conversation, verdict, &reason).await;
        let delivered = deliveries.iter().filter(|d| d.delivered).count();
        self.audit.log(self.entry(
            conversation,
            verdict,
            AuditEvent::NotificationsSent {
                delivered,
                failed: deliveries.len() - delivered,
            },
            None,
        ));

        Ok(SafetyAction::Blocked {
            supportive_message,
            deliveries,
        })
    }

    async fn notify(&self, conversation: &Conversation, verdict: &SafetyVerdict, reason: &str) -> Vec<DeliveryReport> {
        if self.recipients.is_empty() {
            warn!(conversation_id = %conversation.id, "No safety recipients configured");
            return Vec::new();
        }

        let subject = format!("Safety escalation in conversation {}", conversation.id);
        let body = format!(
            "Conversation: {}\nUser: {}\nLevel: {}\nSource: {}\nReason: {}\nDetected at: {}",
            conversation.id,
            conversation.user_id,
            verdict.danger_level,
            verdict.source.as_str(),
            reason,
            Utc::now().to_rfc3339(),
        );

        notify_all(self.notifier.as_ref(), &self.recipients, &subject, &body).await
    }

    fn entry(
        &self,
        conversation: &Conversation,
        verdict: &SafetyVerdict,
        event: AuditEvent,
        excerpt: Option<String>,
    ) -> AuditEntry {
        AuditEntry {
            timestamp: Utc::now(),
            event,
            conversation_id: conversation.id.to_string(),
            user_id: conversation.user_id.clone(),
            danger_level: verdict.danger_level,
            concerns: verdict.detected_concerns.iter().cloned().collect(),
            excerpt,
        }
    }
}
