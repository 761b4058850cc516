//! Safety verdicts — derived per turn, never stored on their own.

use std::collections::BTreeSet;

use dialoguard_protocol::{DangerLevel, SafetySection};
use serde::{Deserialize, Serialize};

/// Where a verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    /// Keyword scan of the raw user text, before any upstream call
    Preflight,
    /// The `safety` section of a validated envelope
    Model,
}

impl VerdictSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preflight => "preflight",
            Self::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub is_safe: bool,
    pub danger_level: DangerLevel,
    pub detected_concerns: BTreeSet<String>,
    pub requires_intervention: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_message: Option<String>,
    pub source: VerdictSource,
}

impl SafetyVerdict {
    pub fn safe(source: VerdictSource) -> Self {
        Self {
            is_safe: true,
            danger_level: DangerLevel::None,
            detected_concerns: BTreeSet::new(),
            requires_intervention: false,
            safety_message: None,
            source,
        }
    }

    /// Lift the model's own safety assessment into a verdict.
    ///
    /// A model that reports a danger level but forgets `is_safe = false` is
    /// still treated as unsafe.
    pub fn from_section(section: &SafetySection) -> Self {
        let level = section.level();
        Self {
            is_safe: section.is_safe && level == DangerLevel::None,
            danger_level: level,
            detected_concerns: section.detected_concerns.iter().cloned().collect(),
            requires_intervention: section.requires_intervention || level.blocks(),
            safety_message: section.safety_message.clone().filter(|m| !m.trim().is_empty()),
            source: VerdictSource::Model,
        }
    }

    /// Whether this verdict warrants an audit entry.
    pub fn is_unsafe(&self) -> bool {
        !self.is_safe || self.danger_level > DangerLevel::None
    }

    pub fn blocks(&self) -> bool {
        self.danger_level.blocks()
    }
}
