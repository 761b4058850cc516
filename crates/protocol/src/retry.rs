//! Bounded corrective retry loop around a blocking upstream call.
//!
//! Each attempt sends the instruction list; an invalid reply appends a
//! corrective system instruction naming the problems and the loop tries
//! again. Transport errors end the loop immediately.

use std::future::Future;

use dialoguard_core::error::{ProviderError, SchemaValidationError};
use dialoguard_core::provider::{PromptMessage, Provider, ProviderRequest, ProviderResponse, Usage};
use tracing::{debug, warn};

use crate::envelope::ResponseEnvelope;
use crate::validate::validate;

/// Default number of upstream attempts per blocking turn.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A schema-valid reply.
#[derive(Debug, Clone)]
pub struct Validated {
    pub envelope: ResponseEnvelope,
    /// The raw text of the accepted attempt
    pub raw: String,
    pub attempts: u32,
    /// Summed over every attempt of the turn
    pub usage: Usage,
    pub model: String,
}

/// What the loop produced. Exhaustion is a value here, not an error.
#[derive(Debug, Clone)]
pub enum RetryOutcome {
    Validated(Validated),
    Exhausted {
        attempts: u32,
        errors: Vec<String>,
        last_raw: String,
        usage: Usage,
    },
}

impl RetryOutcome {
    /// Convert exhaustion into the terminal error surfaced to callers.
    pub fn into_result(self) -> Result<Validated, SchemaValidationError> {
        match self {
            Self::Validated(v) => Ok(v),
            Self::Exhausted {
                attempts,
                errors,
                last_raw,
                ..
            } => Err(SchemaValidationError {
                attempts,
                errors,
                last_raw,
            }),
        }
    }
}

/// The corrective instruction appended after an invalid attempt.
pub fn corrective_instruction(errors: &[String]) -> String {
    let mut text = String::from(
        "Your previous reply did not match the required response format. Problems found:\n",
    );
    for error in errors {
        text.push_str("- ");
        text.push_str(error);
        text.push('\n');
    }
    text.push_str(
        "Reply again with exactly one JSON object that follows the RESPONSE FORMAT. Do not add any other text.",
    );
    text
}

/// Owns the schema contract's retry policy.
#[derive(Debug, Clone)]
pub struct ResponseProtocol {
    max_attempts: u32,
}

impl Default for ResponseProtocol {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl ResponseProtocol {
    /// `max_attempts` is clamped to at least one.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run the bounded loop with an arbitrary sender.
    pub async fn run<F, Fut>(&self, messages: Vec<PromptMessage>, mut send: F) -> Result<RetryOutcome, ProviderError>
    where
        F: FnMut(Vec<PromptMessage>) -> Fut,
        Fut: Future<Output = Result<ProviderResponse, ProviderError>>,
    {
        let mut messages = messages;
        let mut usage = Usage::default();
        let mut last_errors = Vec::new();
        let mut last_raw = String::new();

        for attempt in 1..=self.max_attempts {
            let response = send(messages.clone()).await?;
            if let Some(u) = &response.usage {
                usage = usage.add(u);
            }

            let outcome = validate(&response.content);
            if let Some(envelope) = outcome.envelope.filter(|_| outcome.valid) {
                debug!(attempt, "Upstream reply validated");
                return Ok(RetryOutcome::Validated(Validated {
                    envelope,
                    raw: response.content,
                    attempts: attempt,
                    usage,
                    model: response.model,
                }));
            }

            warn!(
                attempt,
                max_attempts = self.max_attempts,
                errors = ?outcome.errors,
                "Upstream reply failed schema validation"
            );

            if attempt < self.max_attempts {
                messages.push(PromptMessage::system(corrective_instruction(&outcome.errors)));
            }
            last_errors = outcome.errors;
            last_raw = response.content;
        }

        Ok(RetryOutcome::Exhausted {
            attempts: self.max_attempts,
            errors: last_errors,
            last_raw,
            usage,
        })
    }

    /// Run the loop and surface exhaustion as [`SchemaValidationError`].
    pub async fn call_with_validation<F, Fut>(
        &self,
        messages: Vec<PromptMessage>,
        send: F,
    ) -> dialoguard_core::Result<Validated>
    where
        F: FnMut(Vec<PromptMessage>) -> Fut,
        Fut: Future<Output = Result<ProviderResponse, ProviderError>>,
    {
        let outcome = self.run(messages, send).await?;
        Ok(outcome.into_result()?)
    }

    /// Run the loop against a provider, reusing `template` for every attempt.
    pub async fn run_with_provider(
        &self,
        provider: &dyn Provider,
        template: &ProviderRequest,
    ) -> Result<RetryOutcome, ProviderError> {
        self.run(template.messages.clone(), |messages| {
            let request = ProviderRequest {
                messages,
                ..template.clone()
            };
            provider.complete(request)
        })
        .await
    }
}
