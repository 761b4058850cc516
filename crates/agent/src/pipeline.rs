//! The turn pipeline — one user message in, one committed assistant message out.
//!
//! ```text
//! rate limit → conversation → store user turn → pre-flight scan
//!   → pending-topic confirmation → assemble layers
//!   → upstream (blocking: validate/retry loop | streaming: buffer)
//!   → safety review of the envelope → progress update → commit
//! ```
//!
//! Streaming turns commit through [`StreamDeliveryBuffer`] and are
//! validated once after completion; the content was already delivered, so
//! the upstream is never re-invoked for them.

use std::sync::Arc;
use std::time::Duration;

use dialoguard_config::{AppConfig, ModesConfig};
use dialoguard_core::error::{Error, Result, StoreError};
use dialoguard_core::provider::Usage;
use dialoguard_core::{
    Conversation, ConversationId, ConversationStore, Message, MessagePayload, Notifier, Provider, ProviderRequest,
};
use dialoguard_progress::{ProgressReport, TopicProgressTracker};
use dialoguard_protocol::{ResponseEnvelope, ResponseProtocol, strip_code_fence};
use dialoguard_safety::{SafetyAction, SafetyAssessor, SafetyVerdict};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::context::{AssemblyOptions, ContextAssembler, InteractionMode, render_user_turn};
use crate::rate_limit::RateLimiter;
use crate::stream_buffer::{CommitOutcome, StreamDeliveryBuffer};
use crate::stream_event::StreamEvent;

/// Buffered events between the turn task and a slow client.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// One incoming user turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnRequest {
    pub user_id: String,

    /// Continue this conversation; a new one is opened when absent
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,

    pub message: String,

    #[serde(default)]
    pub payload: MessagePayload,

    /// Overrides the configured conversation language
    #[serde(default)]
    pub language: Option<String>,

    /// The client renders in a narrow viewport
    #[serde(default)]
    pub narrow_viewport: bool,
}

impl TurnRequest {
    pub fn new(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn in_conversation(mut self, conversation_id: ConversationId) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }
}

/// The outcome of a blocking turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnResponse {
    pub conversation_id: ConversationId,
    pub message_id: String,
    /// Plain text committed for the turn
    pub text: String,
    /// The validated envelope; absent when a pre-flight emergency halted the turn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub envelope: Option<ResponseEnvelope>,
    pub safety: SafetyVerdict,
    /// The conversation is blocked after this turn
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Upstream attempts used (0 when the upstream was never called)
    pub attempts: u32,
}

/// Everything decided before the upstream call.
struct PreparedTurn {
    conversation: Conversation,
    user_text: String,
    request: ProviderRequest,
    snapshot: serde_json::Value,
    preflight: SafetyVerdict,
    confirmed: Option<ProgressReport>,
}

enum Prepared {
    Ready(Box<PreparedTurn>),
    /// A pre-flight emergency ended the turn before any upstream call
    Halted(TurnResponse),
}

pub struct TurnPipeline {
    model: String,
    temperature: f32,
    max_tokens: u32,
    language: String,
    history_limit: usize,
    request_timeout: Duration,
    stream_idle_timeout: Duration,
    modes: ModesConfig,
    supportive_message: String,
    provider: Arc<dyn Provider>,
    store: Arc<dyn ConversationStore>,
    assessor: Arc<SafetyAssessor>,
    tracker: Arc<TopicProgressTracker>,
    assembler: ContextAssembler,
    protocol: ResponseProtocol,
    limiter: RateLimiter,
}

impl std::fmt::Debug for TurnPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnPipeline")
            .field("model", &self.model)
            .field("provider", &self.provider.name())
            .field("store", &self.store.name())
            .field("tracker", &self.tracker)
            .finish()
    }
}

impl TurnPipeline {
    /// Wire a pipeline from configuration and explicit collaborators.
    ///
    /// Topics and keyword matchers are parsed here, once.
    pub fn new(
        config: &AppConfig,
        provider: Arc<dyn Provider>,
        store: Arc<dyn ConversationStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let assessor = SafetyAssessor::new(&config.safety, store.clone(), notifier);
        let tracker = TopicProgressTracker::from_config(config, store.clone()).map_err(|e| Error::Config {
            message: e.to_string(),
        })?;

        Ok(Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            language: config.language.clone(),
            history_limit: config.history_limit,
            request_timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
            stream_idle_timeout: Duration::from_secs(config.stream_idle_timeout_secs.max(1)),
            modes: config.modes.clone(),
            supportive_message: config.safety.supportive_message.clone(),
            provider,
            store,
            assessor: Arc::new(assessor),
            tracker: Arc::new(tracker),
            assembler: ContextAssembler::new(config.instructions.base.clone(), config.history_limit),
            protocol: ResponseProtocol::new(config.protocol.max_attempts),
            limiter: RateLimiter::from_config(&config.rate_limit),
        })
    }

    /// Build the configured provider, store and notifier, then the pipeline.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let provider = dialoguard_providers::OpenAiCompatProvider::from_config(config)?;
        let store = dialoguard_store::open_store(&config.store).await?;
        let notifier = dialoguard_notify::from_config(&config.notifications).map_err(|e| Error::Config {
            message: e.to_string(),
        })?;
        info!(
            model = %config.model,
            store = store.name(),
            notifier = notifier.name(),
            "Turn pipeline ready"
        );
        Self::new(config, Arc::new(provider), store, notifier)
    }

    /// Replace the safety assessor (tests that inspect the audit log).
    pub fn with_assessor(mut self, assessor: SafetyAssessor) -> Self {
        self.assessor = Arc::new(assessor);
        self
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<TopicProgressTracker> {
        &self.tracker
    }

    pub fn assessor(&self) -> &Arc<SafetyAssessor> {
        &self.assessor
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    // ── Blocking turns ────────────────────────────────────────────────────

    /// Run one turn through the validate/retry loop and commit it.
    pub async fn handle_turn(&self, request: TurnRequest) -> Result<TurnResponse> {
        let turn = match self.prepare(request).await? {
            Prepared::Halted(response) => return Ok(response),
            Prepared::Ready(turn) => *turn,
        };
        let conversation_id = turn.conversation.id.clone();

        let outcome = self
            .protocol
            .run_with_provider(self.provider.as_ref(), &turn.request)
            .await
            .inspect_err(|e| error!(conversation_id = %conversation_id, error = %e, "Upstream call failed"))?;

        let validated = outcome.into_result().inspect_err(|e| {
            error!(
                conversation_id = %conversation_id,
                attempts = e.attempts,
                errors = ?e.errors,
                last_raw = %dialoguard_safety::excerpt(&e.last_raw, 200),
                "No schema-valid response after retries"
            )
        })?;

        let (verdict, action, progress) = self.review(&turn, &validated.envelope).await?;
        let text = match action.supportive_message() {
            Some(message) => message.to_string(),
            None => validated.envelope.plain_text(),
        };

        let mut message = Message::assistant(&conversation_id, text.clone()).with_usage(Some(validated.usage.clone()));
        message.raw_payload = serde_json::from_str(strip_code_fence(&validated.raw)).ok();
        message.context_sent = Some(turn.snapshot);
        let message_id = self.store.add_message(message).await?;

        info!(
            conversation_id = %conversation_id,
            message_id = %message_id,
            attempts = validated.attempts,
            tokens = validated.usage.total_tokens,
            danger_level = %verdict.danger_level,
            "Turn committed"
        );

        Ok(TurnResponse {
            conversation_id,
            message_id,
            text,
            envelope: Some(validated.envelope),
            blocked: action.halts_turn(),
            safety: most_severe(turn.preflight, verdict),
            progress: progress.or(turn.confirmed),
            usage: Some(validated.usage),
            attempts: validated.attempts,
        })
    }

    // ── Streaming turns ───────────────────────────────────────────────────

    /// Start a streaming turn and return its event channel.
    ///
    /// Errors that happen before the upstream call (rate limit, blocked or
    /// unknown conversation) are returned directly. Everything after that
    /// arrives as events; the turn keeps draining and commits even when the
    /// receiver is dropped.
    pub async fn handle_turn_streaming(self: &Arc<Self>, request: TurnRequest) -> Result<mpsc::Receiver<StreamEvent>> {
        let prepared = self.prepare(request).await?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        match prepared {
            Prepared::Halted(response) => {
                let _ = tx
                    .send(StreamEvent::Safety {
                        danger_level: response.safety.danger_level,
                        blocked: true,
                        message: Some(response.text.clone()),
                    })
                    .await;
                let _ = tx
                    .send(StreamEvent::Done {
                        conversation_id: response.conversation_id.to_string(),
                        message_id: response.message_id,
                        usage: None,
                        valid: true,
                    })
                    .await;
            }
            Prepared::Ready(turn) => {
                let pipeline = Arc::clone(self);
                tokio::spawn(async move { pipeline.run_stream(*turn, tx).await });
            }
        }

        Ok(rx)
    }

    async fn run_stream(&self, turn: PreparedTurn, tx: mpsc::Sender<StreamEvent>) {
        let conversation_id = turn.conversation.id.clone();
        let mut buffer = StreamDeliveryBuffer::new(conversation_id.clone(), self.store.clone(), Some(tx))
            .with_context_snapshot(turn.snapshot.clone());

        let mut request = turn.request.clone();
        request.stream = true;

        let opened = tokio::time::timeout(self.request_timeout, self.provider.stream(request)).await;
        let mut chunks = match opened {
            Ok(Ok(chunks)) => chunks,
            Ok(Err(e)) => {
                error!(conversation_id = %conversation_id, error = %e, "Upstream stream failed to open");
                let _ = buffer.emergency_save(&e.to_string()).await;
                return;
            }
            Err(_) => {
                error!(conversation_id = %conversation_id, "Upstream stream did not open in time");
                let _ = buffer.emergency_save("upstream did not respond in time").await;
                return;
            }
        };

        buffer.start();
        let mut usage = None;
        let committed = loop {
            match tokio::time::timeout(self.stream_idle_timeout, chunks.recv()).await {
                Ok(Some(Ok(chunk))) => {
                    if let Some(text) = chunk.content.as_deref() {
                        buffer.append(text).await;
                    }
                    if chunk.usage.is_some() {
                        usage = chunk.usage;
                    }
                    if chunk.done {
                        break buffer.finalize(usage.take()).await;
                    }
                }
                Ok(Some(Err(e))) => {
                    error!(conversation_id = %conversation_id, error = %e, "Upstream stream failed");
                    break buffer.emergency_save(&e.to_string()).await;
                }
                Ok(None) => break buffer.fallback(usage.take()).await,
                Err(_) => {
                    let reason = format!("no data from upstream for {}s", self.stream_idle_timeout.as_secs());
                    error!(conversation_id = %conversation_id, "{reason}");
                    break buffer.emergency_save(&reason).await;
                }
            }
        };

        let envelope = match committed {
            Ok(CommitOutcome::Finalized { envelope, .. }) => envelope,
            Ok(_) => return,
            Err(e) => {
                error!(conversation_id = %conversation_id, error = %e, "Streaming turn could not be committed");
                return;
            }
        };

        let Some(envelope) = envelope else {
            if let Some(report) = turn.confirmed.clone() {
                buffer.emit(StreamEvent::Progress { progress: report }).await;
            }
            return;
        };

        match self.review(&turn, &envelope).await {
            Ok((verdict, action, progress)) => {
                if verdict.is_unsafe() {
                    buffer
                        .emit(StreamEvent::Safety {
                            danger_level: verdict.danger_level,
                            blocked: action.halts_turn(),
                            message: action.supportive_message().map(String::from),
                        })
                        .await;
                }
                if let Some(report) = progress.or(turn.confirmed) {
                    buffer.emit(StreamEvent::Progress { progress: report }).await;
                }
            }
            Err(e) => error!(conversation_id = %conversation_id, error = %e, "Post-commit review failed"),
        }
    }

    // ── Shared stages ─────────────────────────────────────────────────────

    async fn prepare(&self, request: TurnRequest) -> Result<Prepared> {
        match &request.conversation_id {
            Some(_) => self.limiter.check_request(&request.user_id)?,
            None => {
                let open = self.store.count_open_conversations(&request.user_id).await?;
                self.limiter.check_new_conversation(&request.user_id, open)?
            }
        }

        let conversation = self.resolve_conversation(&request).await?;
        let conversation_id = conversation.id.clone();
        let language = request
            .language
            .clone()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| self.language.clone());

        let history = self.store.get_messages(&conversation_id, self.history_limit).await?;

        let user_message = Message::user(&conversation_id, request.message.clone()).with_payload(request.payload);
        let user_text = render_user_turn(&user_message);
        self.store.add_message(user_message.clone()).await?;
        debug!(conversation_id = %conversation_id, chars = user_text.len(), "User turn stored");

        let (preflight, matches) = self.assessor.preflight(&user_text);
        if preflight.is_unsafe() {
            debug!(
                conversation_id = %conversation_id,
                keywords = ?matches.iter().map(|m| m.phrase.as_str()).collect::<Vec<_>>(),
                "Pre-flight keyword match"
            );
            let action = self.assessor.assess(&conversation, &preflight, &user_text).await?;
            if let Some(supportive) = action.supportive_message() {
                return self
                    .halt(&conversation_id, supportive.to_string(), preflight)
                    .await
                    .map(Prepared::Halted);
            }
        }

        let confirmed = self
            .tracker
            .confirm_pending_if_affirmed(&conversation_id, &request.message, &language)
            .await
            .unwrap_or_else(|e| {
                warn!(conversation_id = %conversation_id, error = %e, "Pending topic confirmation failed");
                None
            });

        let options = AssemblyOptions {
            language: Some(language.clone()),
            safety_keywords: self.assessor.keyword_phrases(),
            progress_addendum: self.tracker.addendum(&language),
            mode: InteractionMode::from_config(&self.modes, request.narrow_viewport),
        };
        let layers = self.assembler.assemble(&options);
        let messages = self.assembler.to_prompt_messages(&layers, &history, &user_message);
        let snapshot = self.assembler.snapshot(&layers, &messages);

        let provider_request = ProviderRequest {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            ..ProviderRequest::new(conversation.model.clone(), messages)
        };
        provider_request.validate()?;

        debug!(
            conversation_id = %conversation_id,
            layers = layers.len(),
            history = history.len(),
            "Context assembled"
        );

        Ok(Prepared::Ready(Box::new(PreparedTurn {
            conversation,
            user_text,
            request: provider_request,
            snapshot,
            preflight,
            confirmed,
        })))
    }

    async fn resolve_conversation(&self, request: &TurnRequest) -> Result<Conversation> {
        let Some(id) = &request.conversation_id else {
            let conversation = self.store.create_conversation(&request.user_id, &self.model).await?;
            info!(conversation_id = %conversation.id, user_id = %request.user_id, "Conversation opened");
            return Ok(conversation);
        };

        let conversation = self
            .store
            .get_conversation(id)
            .await?
            .filter(|c| c.user_id == request.user_id && !c.is_deleted())
            .ok_or_else(|| StoreError::ConversationNotFound(id.to_string()))?;

        if conversation.blocked {
            warn!(conversation_id = %id, "Turn rejected: conversation is blocked");
            return Err(Error::SafetyBlocked {
                conversation_id: id.to_string(),
                reason: conversation.blocked_reason.clone().unwrap_or_default(),
                supportive_message: self.supportive_message.clone(),
            });
        }
        Ok(conversation)
    }

    /// Commit the supportive message in place of any model output.
    async fn halt(
        &self,
        conversation_id: &ConversationId,
        supportive_message: String,
        verdict: SafetyVerdict,
    ) -> Result<TurnResponse> {
        let mut message = Message::assistant(conversation_id, supportive_message.clone());
        message.raw_payload = Some(serde_json::json!({
            "safety_intervention": {
                "danger_level": verdict.danger_level,
                "source": verdict.source.as_str(),
            }
        }));
        let message_id = self.store.add_message(message).await?;
        info!(conversation_id = %conversation_id, "Turn halted before upstream call");

        Ok(TurnResponse {
            conversation_id: conversation_id.clone(),
            message_id,
            text: supportive_message,
            envelope: None,
            safety: verdict,
            blocked: true,
            progress: None,
            usage: None,
            attempts: 0,
        })
    }

    /// Safety review of a validated envelope, then its progress update.
    async fn review(
        &self,
        turn: &PreparedTurn,
        envelope: &ResponseEnvelope,
    ) -> Result<(SafetyVerdict, SafetyAction, Option<ProgressReport>)> {
        let verdict = self.assessor.from_envelope(&envelope.safety);
        let action = self.assessor.assess(&turn.conversation, &verdict, &turn.user_text).await?;

        let progress = match &envelope.progress {
            Some(update) if !action.halts_turn() => self
                .tracker
                .apply_update(&turn.conversation.id, update)
                .await
                .unwrap_or_else(|e| {
                    warn!(conversation_id = %turn.conversation.id, error = %e, "Progress update failed");
                    None
                }),
            _ => None,
        };

        Ok((verdict, action, progress))
    }
}

fn most_severe(preflight: SafetyVerdict, model: SafetyVerdict) -> SafetyVerdict {
    if preflight.danger_level > model.danger_level {
        preflight
    } else {
        model
    }
}
