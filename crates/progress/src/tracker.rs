//! Confirmation-based topic progress.
//!
//! A topic only counts as covered once it is confirmed, either through
//! `confirm_topic` directly or by an affirmative user answer to a pending
//! confirmation question. The stored percentage never decreases.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dialoguard_config::{AppConfig, ConfigError};
use dialoguard_core::error::{ProgressError, Result};
use dialoguard_core::{ConversationId, ConversationStore, ProgressRecord, TopicCoverage};
use dialoguard_protocol::ProgressUpdate;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::prompts;
use crate::topics::TopicCatalog;

const NO_TOPICS_DIAGNOSTIC: &str =
    "No trackable topics were found in the configuration document; progress stays at 0%.";

/// Per-topic line of a progress report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicStatus {
    pub id: String,
    pub title: String,
    pub is_covered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,
}

/// Progress of one conversation as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressReport {
    pub conversation_id: ConversationId,
    pub percentage: f32,
    pub covered: usize,
    pub total: usize,
    pub topics: Vec<TopicStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_topic: Option<String>,
    pub is_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

pub struct TopicProgressTracker {
    catalog: Arc<TopicCatalog>,
    enabled: bool,
    store: Arc<dyn ConversationStore>,
    /// Serialises read-compute-write cycles within this process
    lock: Mutex<()>,
}

impl std::fmt::Debug for TopicProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicProgressTracker")
            .field("topics", &self.catalog.len())
            .field("enabled", &self.enabled)
            .field("store", &self.store.name())
            .finish()
    }
}

impl TopicProgressTracker {
    pub fn new(catalog: TopicCatalog, enabled: bool, store: Arc<dyn ConversationStore>) -> Self {
        if enabled && catalog.is_empty() {
            warn!("{NO_TOPICS_DIAGNOSTIC}");
        }
        Self {
            catalog: Arc::new(catalog),
            enabled,
            store,
            lock: Mutex::new(()),
        }
    }

    /// Parse the topic document named by the configuration once.
    pub fn from_config(config: &AppConfig, store: Arc<dyn ConversationStore>) -> std::result::Result<Self, ConfigError> {
        let source = config.instructions.topics_source()?;
        let catalog = TopicCatalog::parse(&source);
        info!(
            topics = catalog.len(),
            strategy = ?catalog.strategy(),
            enabled = config.progress.enabled,
            "Topic catalog loaded"
        );
        Ok(Self::new(catalog, config.progress.enabled, store))
    }

    pub fn catalog(&self) -> &TopicCatalog {
        &self.catalog
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Enabled and at least one topic to track.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.catalog.is_empty()
    }

    /// The instruction layer text, when tracking is active.
    pub fn addendum(&self, language: &str) -> Option<String> {
        self.is_active()
            .then(|| prompts::progress_addendum(&self.catalog, language))
    }

    /// Mark a topic covered. Re-confirming a covered topic changes nothing.
    pub async fn confirm_topic(&self, conversation_id: &ConversationId, topic_id: &str) -> Result<ProgressReport> {
        if !self.enabled {
            return Err(ProgressError::Disabled.into());
        }
        let topic = self
            .catalog
            .resolve(topic_id)
            .ok_or_else(|| ProgressError::UnknownTopic(topic_id.to_string()))?;

        let _guard = self.lock.lock().await;

        let mut record = self
            .store
            .get_progress(conversation_id)
            .await?
            .unwrap_or_else(|| ProgressRecord::empty(conversation_id));

        let already_covered = record.topics.get(&topic.id).is_some_and(|t| t.is_covered);
        let clears_pending = record.pending_topic.as_deref() == Some(topic.id.as_str());
        if already_covered && !clears_pending {
            debug!(conversation_id = %conversation_id, topic = %topic.id, "Topic already confirmed");
            return Ok(self.build_report(&record));
        }

        let now = Utc::now();
        if !already_covered {
            record.topics.insert(topic.id.clone(), TopicCoverage::confirmed(now));
        }
        if clears_pending {
            record.pending_topic = None;
        }
        record.percentage = self.computed_percentage(&record).max(record.percentage);
        record.updated_at = now;

        let mut merged = self.store.update_progress(&record).await?;

        // Another writer may have covered topics between our read and write
        let recomputed = self.computed_percentage(&merged);
        if recomputed > merged.percentage {
            merged.percentage = recomputed;
            merged = self.store.update_progress(&merged).await?;
        }

        info!(
            conversation_id = %conversation_id,
            topic = %topic.id,
            percentage = merged.percentage,
            "Topic confirmed"
        );
        Ok(self.build_report(&merged))
    }

    /// Current progress; conversations without a record report 0%.
    pub async fn report(&self, conversation_id: &ConversationId) -> Result<ProgressReport> {
        let record = self
            .store
            .get_progress(conversation_id)
            .await?
            .unwrap_or_else(|| ProgressRecord::empty(conversation_id));
        Ok(self.build_report(&record))
    }

    /// Record the topic the assistant is asking about as pending.
    ///
    /// The model's own percentage and counters are ignored; only the
    /// `current_topic` is used. Unknown or already covered topics clear the
    /// pending slot.
    pub async fn apply_update(
        &self,
        conversation_id: &ConversationId,
        update: &ProgressUpdate,
    ) -> Result<Option<ProgressReport>> {
        if !self.is_active() {
            return Ok(None);
        }

        let _guard = self.lock.lock().await;

        let mut record = self
            .store
            .get_progress(conversation_id)
            .await?
            .unwrap_or_else(|| ProgressRecord::empty(conversation_id));

        let pending = update
            .current_topic
            .as_deref()
            .and_then(|t| self.catalog.resolve(t))
            .filter(|t| !record.topics.get(&t.id).is_some_and(|c| c.is_covered))
            .map(|t| t.id.clone());

        if let Some(reported) = update.current_topic.as_deref()
            && self.catalog.resolve(reported).is_none()
        {
            debug!(conversation_id = %conversation_id, topic = %reported, "Model referenced an unknown topic");
        }

        if pending == record.pending_topic {
            return Ok(Some(self.build_report(&record)));
        }

        record.pending_topic = pending;
        record.updated_at = Utc::now();
        let merged = self.store.update_progress(&record).await?;
        debug!(
            conversation_id = %conversation_id,
            pending_topic = ?merged.pending_topic,
            "Pending confirmation updated"
        );
        Ok(Some(self.build_report(&merged)))
    }

    /// Confirm the pending topic when `user_text` answers it affirmatively.
    pub async fn confirm_pending_if_affirmed(
        &self,
        conversation_id: &ConversationId,
        user_text: &str,
        language: &str,
    ) -> Result<Option<ProgressReport>> {
        if !self.is_active() {
            return Ok(None);
        }

        let pending = self
            .store
            .get_progress(conversation_id)
            .await?
            .and_then(|r| r.pending_topic);

        match pending {
            Some(topic_id) if prompts::is_affirmative(user_text, language) => {
                self.confirm_topic(conversation_id, &topic_id).await.map(Some)
            }
            _ => Ok(None),
        }
    }

    fn computed_percentage(&self, record: &ProgressRecord) -> f32 {
        let total = self.catalog.len();
        if total == 0 {
            return 0.0;
        }
        let covered = self.covered_in_catalog(record);
        covered as f32 / total as f32 * 100.0
    }

    fn covered_in_catalog(&self, record: &ProgressRecord) -> usize {
        self.catalog
            .topics()
            .iter()
            .filter(|t| record.topics.get(&t.id).is_some_and(|c| c.is_covered))
            .count()
    }

    fn build_report(&self, record: &ProgressRecord) -> ProgressReport {
        let total = self.catalog.len();
        let covered = self.covered_in_catalog(record);
        let topics = self
            .catalog
            .topics()
            .iter()
            .map(|t| {
                let coverage = record.topics.get(&t.id);
                TopicStatus {
                    id: t.id.clone(),
                    title: t.title.clone(),
                    is_covered: coverage.is_some_and(|c| c.is_covered),
                    confirmed_at: coverage.and_then(|c| c.confirmed_at),
                }
            })
            .collect();

        ProgressReport {
            conversation_id: record.conversation_id.clone(),
            percentage: if total == 0 {
                0.0
            } else {
                record.percentage.max(self.computed_percentage(record))
            },
            covered,
            total,
            topics,
            pending_topic: record.pending_topic.clone(),
            is_complete: total > 0 && covered == total,
            diagnostic: (total == 0).then(|| NO_TOPICS_DIAGNOSTIC.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialoguard_core::error::Error;
    use dialoguard_store::InMemoryStore;

    fn tracker(doc: &str) -> (TopicProgressTracker, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let tracker = TopicProgressTracker::new(TopicCatalog::parse(doc), true, store.clone());
        (tracker, store)
    }

    fn cid() -> ConversationId {
        ConversationId::from("conv-1")
    }

    #[tokio::test]
    async fn two_topic_scenario() {
        let (tracker, _) = tracker(r#"[TOPIC:id="t1" name="One"] [TOPIC:id="t2" name="Two"]"#);

        let r = tracker.confirm_topic(&cid(), "t1").await.unwrap();
        assert_eq!(r.percentage, 50.0);
        assert!(!r.is_complete);

        let r = tracker.confirm_topic(&cid(), "t1").await.unwrap();
        assert_eq!(r.percentage, 50.0);
        assert_eq!(r.covered, 1);

        let r = tracker.confirm_topic(&cid(), "t2").await.unwrap();
        assert_eq!(r.percentage, 100.0);
        assert!(r.is_complete);
    }

    #[tokio::test]
    async fn reconfirm_keeps_first_timestamp() {
        let (tracker, _) = tracker("[TOPIC: Sleep]");
        let first = tracker.confirm_topic(&cid(), "sleep").await.unwrap();
        let second = tracker.confirm_topic(&cid(), "Sleep").await.unwrap();
        assert_eq!(first.topics[0].confirmed_at, second.topics[0].confirmed_at);
    }

    #[tokio::test]
    async fn unknown_topic_is_rejected() {
        let (tracker, _) = tracker("[TOPIC: Sleep]");
        let err = tracker.confirm_topic(&cid(), "holidays").await.unwrap_err();
        assert!(matches!(err, Error::Progress(ProgressError::UnknownTopic(t)) if t == "holidays"));
    }

    #[tokio::test]
    async fn disabled_tracker_rejects_confirmation() {
        let store = Arc::new(InMemoryStore::new());
        let tracker = TopicProgressTracker::new(TopicCatalog::parse("[TOPIC: Sleep]"), false, store);
        assert!(tracker.addendum("en").is_none());
        let err = tracker.confirm_topic(&cid(), "sleep").await.unwrap_err();
        assert!(matches!(err, Error::Progress(ProgressError::Disabled)));
    }

    #[tokio::test]
    async fn zero_topics_reports_diagnostic() {
        let (tracker, _) = tracker("Just be kind.");
        assert!(!tracker.is_active());
        let report = tracker.report(&cid()).await.unwrap();
        assert_eq!(report.percentage, 0.0);
        assert_eq!(report.total, 0);
        assert!(!report.is_complete);
        assert!(report.diagnostic.is_some());
    }

    #[tokio::test]
    async fn concurrent_confirms_stay_monotonic() {
        let doc = "[TOPIC: A] [TOPIC: B] [TOPIC: C] [TOPIC: D]";
        let (tracker, _) = tracker(doc);
        let tracker = Arc::new(tracker);

        let handles: Vec<_> = ["a", "b", "c", "d", "a", "c"]
            .into_iter()
            .map(|id| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.confirm_topic(&cid(), id).await.unwrap() })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        let report = tracker.report(&cid()).await.unwrap();
        assert_eq!(report.percentage, 100.0);
        assert!(report.is_complete);
    }

    #[tokio::test]
    async fn separate_trackers_sharing_a_store_converge() {
        let doc = "[TOPIC: A] [TOPIC: B]";
        let store = Arc::new(InMemoryStore::new());
        let first = Arc::new(TopicProgressTracker::new(TopicCatalog::parse(doc), true, store.clone()));
        let second = Arc::new(TopicProgressTracker::new(TopicCatalog::parse(doc), true, store.clone()));

        let id = cid();
        let (a, b) = tokio::join!(first.confirm_topic(&id, "a"), second.confirm_topic(&id, "b"));
        a.unwrap();
        b.unwrap();

        let stored = store.get_progress(&cid()).await.unwrap().unwrap();
        assert_eq!(stored.percentage, 100.0);
        assert_eq!(stored.covered_count(), 2);
    }

    #[tokio::test]
    async fn percentage_never_decreases_in_store() {
        let (tracker, store) = tracker("[TOPIC: A] [TOPIC: B]");
        tracker.confirm_topic(&cid(), "a").await.unwrap();

        let mut lower = ProgressRecord::empty(&cid());
        lower.percentage = 10.0;
        let merged = store.update_progress(&lower).await.unwrap();
        assert_eq!(merged.percentage, 50.0);
        assert_eq!(merged.covered_count(), 1);
    }

    #[tokio::test]
    async fn model_update_only_sets_pending_topic() {
        let (tracker, _) = tracker("[TOPIC: Sleep] [TOPIC: Work]");
        let update = ProgressUpdate {
            percentage: 90.0,
            current_topic: Some("Sleep".into()),
            topics_covered: 2,
            topics_remaining: 0,
        };

        let report = tracker.apply_update(&cid(), &update).await.unwrap().unwrap();
        assert_eq!(report.percentage, 0.0);
        assert_eq!(report.pending_topic.as_deref(), Some("sleep"));
    }

    #[tokio::test]
    async fn affirmative_answer_confirms_pending_topic() {
        let (tracker, _) = tracker("[TOPIC: Sleep] [TOPIC: Work]");
        let update = ProgressUpdate {
            current_topic: Some("work".into()),
            ..ProgressUpdate::default()
        };
        tracker.apply_update(&cid(), &update).await.unwrap();

        let none = tracker
            .confirm_pending_if_affirmed(&cid(), "nein, noch nicht", "de")
            .await
            .unwrap();
        assert!(none.is_none());

        let report = tracker
            .confirm_pending_if_affirmed(&cid(), "Ja, das passt", "de")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.percentage, 50.0);
        assert!(report.pending_topic.is_none());
        assert!(report.topics.iter().any(|t| t.id == "work" && t.is_covered));
    }

    #[tokio::test]
    async fn covered_topic_is_not_pending_again() {
        let (tracker, _) = tracker("[TOPIC: Sleep] [TOPIC: Work]");
        tracker.confirm_topic(&cid(), "sleep").await.unwrap();
        let update = ProgressUpdate {
            current_topic: Some("sleep".into()),
            ..ProgressUpdate::default()
        };
        let report = tracker.apply_update(&cid(), &update).await.unwrap().unwrap();
        assert!(report.pending_topic.is_none());
    }

    // ── Random confirmation sequences ────────────────────────────────────

    mod generated {
        use super::*;
        use proptest::prelude::*;

        const CATALOG: &str = r#"[TOPIC:id="sleep" name="Sleep"] [TOPIC:id="food" name="Food"] [TOPIC:id="work" name="Work"] [TOPIC:id="family" name="Family"]"#;

        #[derive(Debug, Clone)]
        enum Step {
            Confirm(&'static str),
            Ask(&'static str),
        }

        fn step() -> impl Strategy<Value = Step> {
            let topic = prop::sample::select(vec!["sleep", "food", "work", "family", "Sleep", "holidays", ""]);
            prop_oneof![
                3 => topic.clone().prop_map(Step::Confirm),
                1 => topic.prop_map(Step::Ask),
            ]
        }

        proptest! {
            #[test]
            fn percentage_never_decreases(steps in prop::collection::vec(step(), 1..24)) {
                let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
                runtime.block_on(async {
                    let (tracker, store) = tracker(CATALOG);
                    let mut last = 0.0f32;
                    for step in &steps {
                        match step {
                            Step::Confirm(topic) => {
                                if let Ok(report) = tracker.confirm_topic(&cid(), topic).await {
                                    prop_assert!(report.percentage >= last);
                                    prop_assert!(report.percentage <= 100.0);
                                }
                            }
                            Step::Ask(topic) => {
                                let update = ProgressUpdate {
                                    percentage: 0.0,
                                    current_topic: Some(topic.to_string()),
                                    ..ProgressUpdate::default()
                                };
                                tracker.apply_update(&cid(), &update).await.unwrap();
                            }
                        }
                        let stored = store.get_progress(&cid()).await.unwrap().map_or(0.0, |r| r.percentage);
                        prop_assert!(stored >= last, "{stored} dropped below {last}");
                        prop_assert!(stored <= 100.0);
                        last = stored;
                    }
                    Ok(())
                })?;
            }
        }
    }
}
