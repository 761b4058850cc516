//! Response envelope — the structured payload every assistant turn carries.

use serde::{Deserialize, Serialize};

/// Severity of a safety signal. Ordering is total:
/// `None < Warning < Critical < Emergency`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DangerLevel {
    #[default]
    None,
    Warning,
    Critical,
    Emergency,
}

impl DangerLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
        }
    }

    /// Only emergencies block a conversation.
    pub fn blocks(&self) -> bool {
        matches!(self, Self::Emergency)
    }
}

impl std::fmt::Display for DangerLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DangerLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            "emergency" => Ok(Self::Emergency),
            other => Err(format!("unknown danger level '{other}'")),
        }
    }
}

/// The validated payload of one assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Always "response"
    #[serde(rename = "type")]
    pub kind: String,

    pub safety: SafetySection,

    pub content: Content,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressUpdate>,

    pub metadata: EnvelopeMetadata,
}

impl ResponseEnvelope {
    /// A minimal safe envelope with one paragraph.
    pub fn text(model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: "response".into(),
            safety: SafetySection::safe(),
            content: Content {
                text_blocks: vec![TextBlock::paragraph(text)],
                ..Content::default()
            },
            progress: None,
            metadata: EnvelopeMetadata {
                model: model.into(),
                tokens_used: None,
                language: None,
            },
        }
    }

    /// Plain text of all text blocks, the form stored as message content.
    pub fn plain_text(&self) -> String {
        self.content
            .text_blocks
            .iter()
            .map(|b| b.content.trim())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetySection {
    pub is_safe: bool,

    /// `null` means no danger
    #[serde(default)]
    pub danger_level: Option<DangerLevel>,

    #[serde(default)]
    pub detected_concerns: Vec<String>,

    #[serde(default)]
    pub requires_intervention: bool,

    #[serde(default)]
    pub safety_message: Option<String>,
}

impl SafetySection {
    pub fn safe() -> Self {
        Self {
            is_safe: true,
            danger_level: None,
            detected_concerns: Vec::new(),
            requires_intervention: false,
            safety_message: None,
        }
    }

    pub fn level(&self) -> DangerLevel {
        self.danger_level.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub text_blocks: Vec<TextBlock>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form: Option<Form>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaItem>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    /// paragraph, heading, list, quote, ...
    #[serde(rename = "type")]
    pub kind: String,

    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

impl TextBlock {
    pub fn paragraph(content: impl Into<String>) -> Self {
        Self {
            kind: "paragraph".into(),
            content: content.into(),
            style: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Form {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    pub fields: Vec<FormField>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,

    #[serde(default)]
    pub label: String,

    #[serde(rename = "type")]
    pub kind: FieldKind,

    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<FieldOption>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Number,
    Textarea,
    Radio,
    Checkbox,
    Select,
}

impl FieldKind {
    pub const ALL: &'static [&'static str] = &["text", "number", "textarea", "radio", "checkbox", "select"];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::Textarea => "textarea",
            Self::Radio => "radio",
            Self::Checkbox => "checkbox",
            Self::Select => "select",
        }
    }

    /// Choice fields must carry options; free-entry fields must not.
    pub fn takes_options(&self) -> bool {
        matches!(self, Self::Radio | Self::Checkbox | Self::Select)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "number" => Some(Self::Number),
            "textarea" => Some(Self::Textarea),
            "radio" => Some(Self::Radio),
            "checkbox" => Some(Self::Checkbox),
            "select" => Some(Self::Select),
            _ => None,
        }
    }
}

/// An option is either a bare string or a value/label pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldOption {
    Simple(String),
    Labeled { value: String, label: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    /// image, video, audio, link
    #[serde(rename = "type")]
    pub kind: String,

    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// What the model reports about topic coverage. Informational only: coverage
/// changes solely through confirmation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    #[serde(default)]
    pub percentage: f32,

    #[serde(default)]
    pub current_topic: Option<String>,

    #[serde(default)]
    pub topics_covered: u32,

    #[serde(default)]
    pub topics_remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}
