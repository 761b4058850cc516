//! Audit logging — structured safety event logging.
//!
//! Every unsafe detection, every applied block and every notification batch
//! is recorded here. Entries carry a bounded excerpt of the triggering text,
//! never the full message. The logger only keeps the most recent entries in
//! memory; durable history belongs to the sinks.

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use dialoguard_protocol::DangerLevel;
use serde::{Deserialize, Serialize};

use crate::verdict::VerdictSource;

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
    pub conversation_id: String,
    pub user_id: String,
    pub danger_level: DangerLevel,
    #[serde(default)]
    pub concerns: Vec<String>,
    /// Bounded excerpt of the triggering text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

/// Types of auditable safety events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A verdict flagged user input or model output as unsafe
    UnsafeContent { source: VerdictSource },
    /// The conversation was blocked
    ConversationBlocked { reason: String },
    /// Recipients were notified of a block
    NotificationsSent { delivered: usize, failed: usize },
}

/// Trait for audit log sinks (where events are written).
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// Entries kept in memory when no retention is given.
pub const DEFAULT_RETAINED_ENTRIES: usize = 1_000;

/// Audit logger that forwards entries to sinks and keeps the most recent
/// ones in memory.
pub struct AuditLogger {
    entries: Mutex<VecDeque<AuditEntry>>,
    retained: usize,
    sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("entry_count", &self.count())
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLogger {
    /// Create a new audit logger with no sinks.
    pub fn new() -> Self {
        Self::with_sinks(Vec::new())
    }

    /// Create a new audit logger with the given sinks.
    pub fn with_sinks(sinks: Vec<Box<dyn AuditSink>>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            retained: DEFAULT_RETAINED_ENTRIES,
            sinks,
        }
    }

    /// Keep at most `entries` in memory; older ones are dropped first.
    pub fn with_retention(mut self, entries: usize) -> Self {
        self.retained = entries;
        self
    }

    /// Record an audit entry.
    pub fn log(&self, entry: AuditEntry) {
        for sink in &self.sinks {
            sink.record(&entry);
        }
        if self.retained == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= self.retained {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// The retained entries, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Entries for one conversation, oldest first.
    pub fn entries_for(&self, conversation_id: &str) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    /// Count of stored entries.
    pub fn count(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A tracing-based audit sink that logs entries via `tracing::warn!`.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, entry: &AuditEntry) {
        tracing::warn!(
            event = ?entry.event,
            conversation_id = %entry.conversation_id,
            user_id = %entry.user_id,
            danger_level = %entry.danger_level,
            concerns = ?entry.concerns,
            "AUDIT"
        );
    }
}

/// Appends one JSON object per entry to a file.
///
/// File I/O runs on a dedicated writer thread so recording never blocks the
/// async runtime. Lines are written in the order they were recorded; dropping
/// the sink flushes what is queued.
pub struct JsonLinesSink {
    path: PathBuf,
    lines: Mutex<Option<std_mpsc::Sender<String>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tx, rx) = std_mpsc::channel::<String>();
        let writer_path = path.clone();
        let writer = std::thread::Builder::new()
            .name("audit-jsonl".into())
            .spawn(move || write_lines(&writer_path, rx))
            .inspect_err(|e| tracing::error!(path = %path.display(), error = %e, "Audit writer thread failed to start"))
            .ok();

        Self {
            path,
            lines: Mutex::new(writer.as_ref().map(|_| tx)),
            writer: Mutex::new(writer),
        }
    }
}

fn write_lines(path: &std::path::Path, rx: std_mpsc::Receiver<String>) {
    let mut file: Option<std::fs::File> = None;
    for line in rx {
        if file.is_none() {
            match open_append(path) {
                Ok(f) => file = Some(f),
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Failed to open audit log");
                    continue;
                }
            }
        }
        if let Some(f) = file.as_mut()
            && let Err(e) = writeln!(f, "{line}")
        {
            tracing::error!(path = %path.display(), error = %e, "Failed to write audit entry");
        }
    }
}

fn open_append(path: &std::path::Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

impl AuditSink for JsonLinesSink {
    fn record(&self, entry: &AuditEntry) {
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "Failed to encode audit entry");
                return;
            }
        };
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.as_ref().is_none_or(|tx| tx.send(line).is_err()) {
            tracing::error!(path = %self.path.display(), "Audit writer is not running; entry dropped");
        }
    }
}

impl Drop for JsonLinesSink {
    fn drop(&mut self) {
        // Closing the channel ends the writer loop once the queue is written
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(writer) = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = writer.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(conversation_id: &str, event: AuditEvent) -> AuditEntry {
        AuditEntry {
            timestamp: Utc::now(),
            event,
            conversation_id: conversation_id.into(),
            user_id: "user-1".into(),
            danger_level: DangerLevel::Emergency,
            concerns: vec!["self_harm".into()],
            excerpt: Some("I want to harm myself".into()),
        }
    }

    #[test]
    fn log_and_retrieve_entries() {
        let logger = AuditLogger::new();
        logger.log(entry("c1", AuditEvent::UnsafeContent { source: VerdictSource::Preflight }));
        logger.log(entry("c2", AuditEvent::ConversationBlocked { reason: "keyword".into() }));
        logger.log(entry("c1", AuditEvent::NotificationsSent { delivered: 2, failed: 1 }));

        assert_eq!(logger.count(), 3);
        let c1 = logger.entries_for("c1");
        assert_eq!(c1.len(), 2);
        assert!(matches!(c1[1].event, AuditEvent::NotificationsSent { failed: 1, .. }));
    }

    #[test]
    fn audit_entry_serialization() {
        let e = entry("c1", AuditEvent::UnsafeContent { source: VerdictSource::Model });
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["event"]["type"], "unsafe_content");
        assert_eq!(json["event"]["source"], "model");
        assert_eq!(json["danger_level"], "emergency");

        let back: AuditEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back.conversation_id, "c1");
    }

    #[test]
    fn custom_sink_receives_events() {
        struct TestSink {
            received: Arc<Mutex<Vec<String>>>,
        }

        impl AuditSink for TestSink {
            fn record(&self, entry: &AuditEntry) {
                self.received.lock().unwrap().push(entry.conversation_id.clone());
            }
        }

        let received = Arc::new(Mutex::new(Vec::new()));
        let logger = AuditLogger::with_sinks(vec![Box::new(TestSink { received: received.clone() })]);
        logger.log(entry("c9", AuditEvent::ConversationBlocked { reason: "r".into() }));

        assert_eq!(*received.lock().unwrap(), vec!["c9".to_string()]);
    }

    #[test]
    fn json_lines_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("safety.jsonl");
        let sink = JsonLinesSink::new(&path);

        sink.record(&entry("c1", AuditEvent::UnsafeContent { source: VerdictSource::Preflight }));
        sink.record(&entry("c1", AuditEvent::ConversationBlocked { reason: "r".into() }));
        drop(sink);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: AuditEntry = serde_json::from_str(lines[1]).unwrap();
        assert!(matches!(second.event, AuditEvent::ConversationBlocked { .. }));
    }

    #[test]
    fn memory_keeps_only_recent_entries() {
        let logger = AuditLogger::new().with_retention(3);
        for i in 0..10 {
            logger.log(entry(&format!("c{i}"), AuditEvent::ConversationBlocked { reason: "r".into() }));
        }

        assert_eq!(logger.count(), 3);
        let ids: Vec<String> = logger.entries().into_iter().map(|e| e.conversation_id).collect();
        assert_eq!(ids, vec!["c7", "c8", "c9"]);
    }

    #[test]
    fn sinks_see_entries_the_memory_dropped() {
        struct Counting(Arc<Mutex<usize>>);
        impl AuditSink for Counting {
            fn record(&self, _entry: &AuditEntry) {
                *self.0.lock().unwrap() += 1;
            }
        }

        let seen = Arc::new(Mutex::new(0));
        let logger = AuditLogger::with_sinks(vec![Box::new(Counting(seen.clone()))]).with_retention(0);
        for _ in 0..5 {
            logger.log(entry("c1", AuditEvent::ConversationBlocked { reason: "r".into() }));
        }

        assert_eq!(logger.count(), 0);
        assert_eq!(*seen.lock().unwrap(), 5);
    }

    #[tokio::test]
    async fn json_lines_sink_does_not_block_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("safety.jsonl");
        let sink = JsonLinesSink::new(&path);

        for i in 0..50 {
            sink.record(&entry(&format!("c{i}"), AuditEvent::ConversationBlocked { reason: "r".into() }));
        }
        tokio::task::spawn_blocking(move || drop(sink)).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let ids: Vec<String> = content
            .lines()
            .map(|l| serde_json::from_str::<AuditEntry>(l).unwrap().conversation_id)
            .collect();
        assert_eq!(ids.len(), 50);
        assert_eq!(ids[0], "c0");
        assert_eq!(ids[49], "c49");
    }

    #[test]
    fn debug_format() {
        let logger = AuditLogger::new();
        let debug_str = format!("{logger:?}");
        assert!(debug_str.contains("entry_count"));
    }
}
