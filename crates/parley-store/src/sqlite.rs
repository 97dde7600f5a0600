//! [`ConversationStore`] backed by a SQLite [`Database`].
//!
//! `rusqlite::Connection` is synchronous and not `Sync`, so the handle sits
//! behind a mutex and every call runs on the blocking thread pool.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use parley_shared::types::{ConversationId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Conversation, Message, NewMessage};
use crate::ConversationStore;

#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Open the database at `path`, or in the platform data directory.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let db = match path {
            Some(path) => Database::open_at(path)?,
            None => Database::new()?,
        };
        Ok(Self::new(db))
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = db
                .lock()
                .map_err(|e| StoreError::Task(format!("lock poisoned: {e}")))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create_conversation(&self, owner: UserId) -> Result<ConversationId> {
        let conversation = Conversation::new(owner);
        let id = conversation.id;
        self.with_db(move |db| db.insert_conversation(&conversation))
            .await?;
        Ok(id)
    }

    async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        self.with_db(move |db| db.get_conversation(id)).await
    }

    async fn append_message(
        &self,
        conversation_id: ConversationId,
        message: NewMessage,
    ) -> Result<u64> {
        self.with_db(move |db| db.append_message(conversation_id, &message))
            .await
    }

    async fn get_history(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        self.with_db(move |db| db.get_history(conversation_id)).await
    }

    async fn set_title(&self, conversation_id: ConversationId, title: &str) -> Result<()> {
        let title = title.to_string();
        let updated = self
            .with_db(move |db| db.set_conversation_title(conversation_id, &title))
            .await?;
        if updated {
            Ok(())
        } else {
            Err(StoreError::ConversationNotFound(conversation_id))
        }
    }

    fn backend_name(&self) -> &str {
        "sqlite"
    }
}
