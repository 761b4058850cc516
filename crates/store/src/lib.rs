//! Conversation store backends for Dialoguard.

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::sync::Arc;

use dialoguard_config::StoreConfig;
use dialoguard_core::ConversationStore;
use dialoguard_core::error::StoreError;

pub use in_memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Open the backend named by the configuration.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn ConversationStore>, StoreError> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryStore::new())),
        #[cfg(feature = "sqlite")]
        "sqlite" => Ok(Arc::new(SqliteStore::open(&config.database_path()).await?)),
        other => Err(StoreError::Storage(format!("Unsupported store backend '{other}'"))),
    }
}
