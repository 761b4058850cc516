//! Scripted provider for tests and offline runs.
//!
//! Each call to `complete` pops the next scripted reply; each call to
//! `stream` pops the next scripted stream. An exhausted script answers with
//! a `NotConfigured` error rather than panicking, so a test that makes an
//! unexpected call fails on an assertion instead of inside a spawned task.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dialoguard_core::error::ProviderError;
use dialoguard_core::provider::{ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage};
use dialoguard_protocol::{DangerLevel, ProgressUpdate, ResponseEnvelope};

/// How a scripted stream ends after its chunks.
#[derive(Debug, Clone)]
pub enum StreamEnd {
    /// Terminator with optional usage
    Done(Option<Usage>),
    /// Transport error mid-stream
    Error(ProviderError),
    /// Producer closes without a terminator
    Close,
    /// Producer stays open and silent
    Stall,
}

#[derive(Debug, Clone)]
pub struct StreamScript {
    pub chunks: Vec<String>,
    pub end: StreamEnd,
}

impl StreamScript {
    /// Split `text` into `parts` roughly equal chunks followed by a terminator.
    pub fn split(text: &str, parts: usize) -> Self {
        let chars: Vec<char> = text.chars().collect();
        let size = chars.len().div_ceil(parts.max(1)).max(1);
        Self {
            chunks: chars.chunks(size).map(|c| c.iter().collect()).collect(),
            end: StreamEnd::Done(Some(usage())),
        }
    }

    pub fn ending(mut self, end: StreamEnd) -> Self {
        self.end = end;
        self
    }
}

#[derive(Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<String, ProviderError>>>,
    streams: Mutex<VecDeque<StreamScript>>,
    requests: Mutex<Vec<ProviderRequest>>,
    complete_calls: AtomicUsize,
    stream_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let provider = Self::new();
        for reply in replies {
            provider.push_reply(reply);
        }
        provider
    }

    pub fn with_stream(script: StreamScript) -> Self {
        let provider = Self::new();
        provider.push_stream(script);
        provider
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        lock(&self.replies).push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, error: ProviderError) {
        lock(&self.replies).push_back(Err(error));
    }

    pub fn push_stream(&self, script: StreamScript) {
        lock(&self.streams).push_back(script);
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        lock(&self.requests).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        let model = request.model.clone();
        lock(&self.requests).push(request);

        let reply = lock(&self.replies)
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::NotConfigured("reply script exhausted".into())))?;
        Ok(ProviderResponse {
            content: reply,
            usage: Some(usage()),
            model,
        })
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(request);

        let script = lock(&self.streams)
            .pop_front()
            .ok_or_else(|| ProviderError::NotConfigured("stream script exhausted".into()))?;

        let (tx, rx) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move {
            for chunk in script.chunks {
                if tx.send(Ok(StreamChunk::text(chunk))).await.is_err() {
                    return;
                }
            }
            match script.end {
                StreamEnd::Done(usage) => {
                    let _ = tx.send(Ok(StreamChunk::done(usage))).await;
                }
                StreamEnd::Error(e) => {
                    let _ = tx.send(Err(e)).await;
                }
                StreamEnd::Close => {}
                StreamEnd::Stall => {
                    tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                    drop(tx);
                }
            }
        });
        Ok(rx)
    }
}

/// Usage reported by every scripted call.
pub fn usage() -> Usage {
    Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    }
}

/// A schema-valid reply carrying one paragraph.
pub fn envelope_reply(text: &str) -> String {
    serde_json::to_string(&ResponseEnvelope::text("scripted", text)).unwrap_or_default()
}

/// A schema-valid reply that asks about `topic`.
pub fn envelope_asking_about(text: &str, topic: &str) -> String {
    let mut envelope = ResponseEnvelope::text("scripted", text);
    envelope.progress = Some(ProgressUpdate {
        current_topic: Some(topic.to_string()),
        ..ProgressUpdate::default()
    });
    serde_json::to_string(&envelope).unwrap_or_default()
}

/// A schema-valid reply whose safety section reports `level`.
pub fn envelope_with_danger(text: &str, level: DangerLevel, safety_message: Option<&str>) -> String {
    let mut envelope = ResponseEnvelope::text("scripted", text);
    envelope.safety.is_safe = false;
    envelope.safety.danger_level = Some(level);
    envelope.safety.detected_concerns = vec!["self_harm".into()];
    envelope.safety.requires_intervention = level == DangerLevel::Emergency;
    envelope.safety.safety_message = safety_message.map(String::from);
    serde_json::to_string(&envelope).unwrap_or_default()
}
