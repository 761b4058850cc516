//! In-memory backend — useful for testing and ephemeral sessions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dialoguard_core::error::StoreError;
use dialoguard_core::{Conversation, ConversationId, ConversationStore, Message, ProgressRecord};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    conversations: HashMap<String, Conversation>,
    /// Insertion order is chronological order
    messages: Vec<Message>,
    progress: HashMap<String, ProgressRecord>,
}

/// A store that keeps everything in process memory behind one lock, so
/// every read-modify-write is atomic.
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
        }
    }

    /// Live conversations owned by `user_id`, oldest first.
    pub async fn conversations_for(&self, user_id: &str) -> Vec<Conversation> {
        let state = self.state.read().await;
        let mut owned: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| c.user_id == user_id && !c.is_deleted())
            .cloned()
            .collect();
        owned.sort_by_key(|c| c.created_at);
        owned
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn live<'a>(state: &'a mut State, id: &ConversationId) -> Result<&'a mut Conversation, StoreError> {
    state
        .conversations
        .get_mut(id.as_str())
        .filter(|c| !c.is_deleted())
        .ok_or_else(|| StoreError::ConversationNotFound(id.to_string()))
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn create_conversation(&self, user_id: &str, model: &str) -> Result<Conversation, StoreError> {
        let conversation = Conversation::new(user_id, model);
        self.state
            .write()
            .await
            .conversations
            .insert(conversation.id.to_string(), conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .conversations
            .get(id.as_str())
            .filter(|c| !c.is_deleted())
            .cloned())
    }

    async fn add_message(&self, mut message: Message) -> Result<String, StoreError> {
        if message.id.is_empty() {
            message.id = Uuid::new_v4().to_string();
        }
        let mut state = self.state.write().await;
        live(&mut state, &message.conversation_id)?.updated_at = Utc::now();
        let id = message.id.clone();
        state.messages.push(message);
        Ok(id)
    }

    async fn update_message(&self, message: &Message) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let stored = state
            .messages
            .iter_mut()
            .find(|m| m.id == message.id)
            .ok_or_else(|| StoreError::MessageNotFound(message.id.clone()))?;
        *stored = message.clone();
        Ok(())
    }

    async fn get_messages(&self, conversation_id: &ConversationId, limit: usize) -> Result<Vec<Message>, StoreError> {
        let state = self.state.read().await;
        let all: Vec<&Message> = state
            .messages
            .iter()
            .filter(|m| &m.conversation_id == conversation_id)
            .collect();
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).cloned().collect())
    }

    async fn block_conversation(&self, id: &ConversationId, reason: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let conversation = live(&mut state, id)?;
        if conversation.blocked {
            return Err(StoreError::AlreadyBlocked(id.to_string()));
        }
        conversation.blocked = true;
        conversation.blocked_reason = Some(reason.to_string());
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn unblock_conversation(&self, id: &ConversationId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let conversation = live(&mut state, id)?;
        if !conversation.blocked {
            return Err(StoreError::NotBlocked(id.to_string()));
        }
        conversation.blocked = false;
        conversation.blocked_reason = None;
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn soft_delete_conversation(&self, id: &ConversationId) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match live(&mut state, id) {
            Ok(conversation) => {
                conversation.deleted_at = Some(Utc::now());
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn get_progress(&self, id: &ConversationId) -> Result<Option<ProgressRecord>, StoreError> {
        Ok(self.state.read().await.progress.get(id.as_str()).cloned())
    }

    async fn update_progress(&self, record: &ProgressRecord) -> Result<ProgressRecord, StoreError> {
        let mut state = self.state.write().await;
        let stored = state
            .progress
            .entry(record.conversation_id.to_string())
            .or_insert_with(|| ProgressRecord::empty(&record.conversation_id));
        stored.merge(record);
        Ok(stored.clone())
    }

    async fn count_open_conversations(&self, user_id: &str) -> Result<usize, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .conversations
            .values()
            .filter(|c| c.user_id == user_id && !c.blocked && !c.is_deleted())
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialoguard_core::TopicCoverage;

    #[tokio::test]
    async fn create_and_fetch_conversation() {
        let store = InMemoryStore::new();
        let conversation = store.create_conversation("user-1", "gpt-4o-mini").await.unwrap();

        let fetched = store.get_conversation(&conversation.id).await.unwrap().unwrap();
        assert_eq!(fetched.user_id, "user-1");
        assert!(!fetched.blocked);
    }

    #[tokio::test]
    async fn messages_come_back_oldest_first_and_limited() {
        let store = InMemoryStore::new();
        let conversation = store.create_conversation("u", "m").await.unwrap();
        for i in 0..5 {
            store
                .add_message(Message::user(&conversation.id, format!("message {i}")))
                .await
                .unwrap();
        }

        let recent = store.get_messages(&conversation.id, 3).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["message 2", "message 3", "message 4"]);
    }

    #[tokio::test]
    async fn add_message_to_unknown_conversation_fails() {
        let store = InMemoryStore::new();
        let err = store
            .add_message(Message::user(&ConversationId::from("missing"), "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConversationNotFound(_)));
    }

    #[tokio::test]
    async fn update_message_replaces_content() {
        let store = InMemoryStore::new();
        let conversation = store.create_conversation("u", "m").await.unwrap();
        let mut message = Message::assistant(&conversation.id, "draft");
        store.add_message(message.clone()).await.unwrap();

        message.content = "final".into();
        message.valid = false;
        store.update_message(&message).await.unwrap();

        let stored = store.get_messages(&conversation.id, 10).await.unwrap();
        assert_eq!(stored[0].content, "final");
        assert!(!stored[0].valid);

        let unknown = Message::assistant(&conversation.id, "x");
        assert!(matches!(
            store.update_message(&unknown).await.unwrap_err(),
            StoreError::MessageNotFound(_)
        ));
    }

    #[tokio::test]
    async fn blocking_is_not_reapplied() {
        let store = InMemoryStore::new();
        let conversation = store.create_conversation("u", "m").await.unwrap();

        store.block_conversation(&conversation.id, "emergency").await.unwrap();
        let err = store.block_conversation(&conversation.id, "again").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyBlocked(_)));

        let fetched = store.get_conversation(&conversation.id).await.unwrap().unwrap();
        assert_eq!(fetched.blocked_reason.as_deref(), Some("emergency"));

        store.unblock_conversation(&conversation.id).await.unwrap();
        assert!(matches!(
            store.unblock_conversation(&conversation.id).await.unwrap_err(),
            StoreError::NotBlocked(_)
        ));
    }

    #[tokio::test]
    async fn soft_deleted_conversations_disappear() {
        let store = InMemoryStore::new();
        let conversation = store.create_conversation("u", "m").await.unwrap();

        assert!(store.soft_delete_conversation(&conversation.id).await.unwrap());
        assert!(store.get_conversation(&conversation.id).await.unwrap().is_none());
        assert!(!store.soft_delete_conversation(&conversation.id).await.unwrap());
        assert_eq!(store.count_open_conversations("u").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn open_conversation_count_is_per_user() {
        let store = InMemoryStore::new();
        let a = store.create_conversation("alice", "m").await.unwrap();
        store.create_conversation("alice", "m").await.unwrap();
        store.create_conversation("bob", "m").await.unwrap();
        store.block_conversation(&a.id, "r").await.unwrap();

        assert_eq!(store.count_open_conversations("alice").await.unwrap(), 1);
        assert_eq!(store.count_open_conversations("bob").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn progress_merges_monotonically() {
        let store = InMemoryStore::new();
        let id = ConversationId::from("c1");

        let mut first = ProgressRecord::empty(&id);
        first.percentage = 50.0;
        first.topics.insert("t1".into(), TopicCoverage::confirmed(Utc::now()));
        store.update_progress(&first).await.unwrap();

        let mut stale = ProgressRecord::empty(&id);
        stale.percentage = 0.0;
        stale.topics.insert("t1".into(), TopicCoverage::uncovered());
        let merged = store.update_progress(&stale).await.unwrap();

        assert_eq!(merged.percentage, 50.0);
        assert!(merged.topics["t1"].is_covered);
        assert_eq!(store.get_progress(&id).await.unwrap(), Some(merged));
    }
}
