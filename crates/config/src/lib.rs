//! Configuration loading, validation, and management for Dialoguard.
//!
//! Loads configuration from `~/.dialoguard/config.toml` with environment
//! variable overrides. Validates all settings at startup. The loaded
//! [`AppConfig`] is immutable and passed explicitly into each component.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.dialoguard/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the upstream endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible endpoint
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model identifier sent upstream
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max tokens per upstream response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Whole-request timeout for blocking calls
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum silence between two stream chunks
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,

    /// Conversation language (ISO 639-1)
    #[serde(default = "default_language")]
    pub language: String,

    /// How many previous messages are replayed upstream
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default)]
    pub instructions: InstructionsConfig,

    #[serde(default)]
    pub protocol: ProtocolConfig,

    #[serde(default)]
    pub safety: SafetyConfig,

    #[serde(default)]
    pub progress: ProgressConfig,

    #[serde(default)]
    pub modes: ModesConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub notifications: NotificationsConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_request_timeout_secs() -> u64 {
    60
}
fn default_stream_idle_timeout_secs() -> u64 {
    30
}
fn default_language() -> String {
    "en".into()
}
fn default_history_limit() -> usize {
    20
}
fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("stream_idle_timeout_secs", &self.stream_idle_timeout_secs)
            .field("language", &self.language)
            .field("history_limit", &self.history_limit)
            .field("instructions", &self.instructions)
            .field("protocol", &self.protocol)
            .field("safety", &self.safety)
            .field("progress", &self.progress)
            .field("modes", &self.modes)
            .field("rate_limit", &self.rate_limit)
            .field("store", &self.store)
            .field("notifications", &self.notifications)
            .field("gateway", &self.gateway)
            .finish()
    }
}

impl std::fmt::Debug for NotificationsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationsConfig")
            .field("webhook_url", &self.webhook_url)
            .field("secret", &redact(&self.secret))
            .finish()
    }
}

/// Base instructions and the topic configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionsConfig {
    /// Host-supplied base instructions (always the last layer)
    #[serde(default = "default_base_instructions")]
    pub base: String,

    /// Document holding topic definitions; defaults to `base` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics_file: Option<PathBuf>,
}

fn default_base_instructions() -> String {
    "You are a calm, supportive assistant. Answer clearly and kindly.".into()
}

impl Default for InstructionsConfig {
    fn default() -> Self {
        Self {
            base: default_base_instructions(),
            topics_file: None,
        }
    }
}

impl InstructionsConfig {
    /// Text the topic catalog is parsed from: the topics file if set, otherwise `base`.
    pub fn topics_source(&self) -> Result<String, ConfigError> {
        match &self.topics_file {
            Some(path) => std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
                path: path.clone(),
                reason: e.to_string(),
            }),
            None => Ok(self.base.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Upstream attempts per blocking turn before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

/// A configured danger keyword: either a bare phrase or a table.
///
/// ```toml
/// keywords = ["harm myself", { phrase = "hopeless", level = "warning", category = "mood" }]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeywordEntry {
    Phrase(String),
    Detailed {
        phrase: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
        /// "warning", "critical" or "emergency" (default)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<String>,
    },
}

impl KeywordEntry {
    pub fn phrase(&self) -> &str {
        match self {
            Self::Phrase(p) => p,
            Self::Detailed { phrase, .. } => phrase,
        }
    }

    pub fn category(&self) -> Option<&str> {
        match self {
            Self::Phrase(_) => None,
            Self::Detailed { category, .. } => category.as_deref(),
        }
    }

    pub fn level(&self) -> Option<&str> {
        match self {
            Self::Phrase(_) => None,
            Self::Detailed { level, .. } => level.as_deref(),
        }
    }
}

pub const KEYWORD_LEVELS: &[&str] = &["warning", "critical", "emergency"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub keywords: Vec<KeywordEntry>,

    /// Who is notified when a conversation is blocked
    #[serde(default)]
    pub recipients: Vec<String>,

    /// Returned to the user instead of model output on an emergency
    #[serde(default = "default_supportive_message")]
    pub supportive_message: String,

    /// Max characters allowed between two consecutive words of a phrase
    #[serde(default = "default_phrase_max_gap")]
    pub phrase_max_gap: usize,

    /// Jaro-Winkler similarity needed to accept a misspelled word
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,

    /// Characters of triggering text kept in audit entries
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,

    /// JSON-lines file receiving audit entries; log-only when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<PathBuf>,
}

fn default_supportive_message() -> String {
    "It sounds like you are going through something really difficult. You don't have to face it alone. \
     Please reach out to someone you trust or contact your local emergency number right now."
        .into()
}
fn default_phrase_max_gap() -> usize {
    20
}
fn default_fuzzy_threshold() -> f64 {
    0.88
}
fn default_excerpt_chars() -> usize {
    200
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keywords: vec![],
            recipients: vec![],
            supportive_message: default_supportive_message(),
            phrase_max_gap: default_phrase_max_gap(),
            fuzzy_threshold: default_fuzzy_threshold(),
            excerpt_chars: default_excerpt_chars(),
            audit_log: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Interaction-mode overlays. At most one is applied per turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModesConfig {
    /// Prefer forms over free text for collecting answers
    #[serde(default)]
    pub guided_form: bool,

    /// Keep answers short for small screens
    #[serde(default)]
    pub narrow_viewport: bool,

    /// Restrict the conversation to this subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_restricted: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Conversations a user may have open (not deleted, not blocked) at once
    #[serde(default = "default_max_open_conversations")]
    pub max_open_conversations: u32,
}

fn default_requests_per_minute() -> u32 {
    20
}
fn default_max_open_conversations() -> u32 {
    10
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            max_open_conversations: default_max_open_conversations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "sqlite" or "memory"
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// SQLite database file; defaults to `~/.dialoguard/dialoguard.db`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_store_backend() -> String {
    "sqlite".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: None,
        }
    }
}

impl StoreConfig {
    pub fn database_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("dialoguard.db"))
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Webhook receiving safety notifications; log-only when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,

    /// HMAC-SHA256 secret for signing webhook bodies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    8787
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.dialoguard/config.toml).
    ///
    /// Also checks environment variables:
    /// - `DIALOGUARD_API_KEY` (highest priority), then `OPENAI_API_KEY`
    /// - `DIALOGUARD_MODEL`
    /// - `DIALOGUARD_BASE_URL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

            toml::from_str::<Self>(&content).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        } else {
            tracing::info!("No config file found at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        // DIALOGUARD_API_KEY beats the file; OPENAI_API_KEY only fills a gap
        if let Ok(key) = std::env::var("DIALOGUARD_API_KEY") {
            self.api_key = Some(key);
        } else if self.api_key.is_none() {
            self.api_key = std::env::var("OPENAI_API_KEY").ok();
        }

        if let Ok(model) = std::env::var("DIALOGUARD_MODEL") {
            self.model = model;
        }

        if let Ok(url) = std::env::var("DIALOGUARD_BASE_URL") {
            self.base_url = url;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".dialoguard")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if !(1..=16384).contains(&self.max_tokens) {
            return Err(ConfigError::ValidationError(
                "max_tokens must be between 1 and 16384".into(),
            ));
        }

        if self.protocol.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "protocol.max_attempts must be at least 1".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.safety.fuzzy_threshold) {
            return Err(ConfigError::ValidationError(
                "safety.fuzzy_threshold must be between 0.0 and 1.0".into(),
            ));
        }

        for keyword in &self.safety.keywords {
            if keyword.phrase().trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "safety.keywords must not contain empty phrases".into(),
                ));
            }
            if let Some(level) = keyword.level() {
                if !KEYWORD_LEVELS.contains(&level) {
                    return Err(ConfigError::ValidationError(format!(
                        "safety keyword '{}' has unknown level '{level}' (expected one of {})",
                        keyword.phrase(),
                        KEYWORD_LEVELS.join(", ")
                    )));
                }
            }
        }

        if !matches!(self.store.backend.as_str(), "sqlite" | "memory") {
            return Err(ConfigError::ValidationError(format!(
                "store.backend must be \"sqlite\" or \"memory\", got \"{}\"",
                self.store.backend
            )));
        }

        if self.rate_limit.requests_per_minute == 0 {
            return Err(ConfigError::ValidationError(
                "rate_limit.requests_per_minute must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
            language: default_language(),
            history_limit: default_history_limit(),
            instructions: InstructionsConfig::default(),
            protocol: ProtocolConfig::default(),
            safety: SafetyConfig::default(),
            progress: ProgressConfig::default(),
            modes: ModesConfig::default(),
            rate_limit: RateLimitConfig::default(),
            store: StoreConfig::default(),
            notifications: NotificationsConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for dialoguard_core::Error {
    fn from(e: ConfigError) -> Self {
        dialoguard_core::Error::Config {
            message: e.to_string(),
        }
    }
}
