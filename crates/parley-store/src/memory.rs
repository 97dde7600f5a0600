//! In-memory store, used by default in development and throughout tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use parley_shared::types::{ConversationId, UserId};

use crate::error::{Result, StoreError};
use crate::models::{Conversation, Message, NewMessage};
use crate::ConversationStore;

#[derive(Debug)]
struct Entry {
    conversation: Conversation,
    messages: Vec<Message>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<ConversationId, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages stored across all conversations.
    pub async fn message_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.values().map(|entry| entry.messages.len()).sum()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_conversation(&self, owner: UserId) -> Result<ConversationId> {
        let conversation = Conversation::new(owner);
        let id = conversation.id;
        self.inner.write().await.insert(
            id,
            Entry {
                conversation,
                messages: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let inner = self.inner.read().await;
        Ok(inner.get(&id).map(|entry| entry.conversation.clone()))
    }

    async fn append_message(
        &self,
        conversation_id: ConversationId,
        message: NewMessage,
    ) -> Result<u64> {
        let mut inner = self.inner.write().await;

        if let Some((other, _)) = inner
            .iter()
            .find(|(id, entry)| {
                **id != conversation_id && entry.messages.iter().any(|m| m.id == message.id)
            })
        {
            tracing::warn!(message_id = %message.id, conversation = %other, "message id reused");
            return Err(StoreError::MessageIdConflict(message.id));
        }

        let entry = inner
            .get_mut(&conversation_id)
            .ok_or(StoreError::ConversationNotFound(conversation_id))?;

        if let Some(existing) = entry.messages.iter().find(|m| m.id == message.id) {
            return Ok(existing.sequence);
        }

        let sequence = entry.messages.last().map(|m| m.sequence).unwrap_or(0) + 1;
        entry.messages.push(Message {
            id: message.id,
            conversation_id,
            parent_id: message.parent_id,
            author: message.author,
            content: message.content,
            created_at: message.created_at,
            sequence,
        });
        entry.conversation.last_activity_at = Utc::now();
        Ok(sequence)
    }

    async fn get_history(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        let inner = self.inner.read().await;
        Ok(inner
            .get(&conversation_id)
            .map(|entry| entry.messages.clone())
            .unwrap_or_default())
    }

    async fn set_title(&self, conversation_id: ConversationId, title: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .get_mut(&conversation_id)
            .ok_or(StoreError::ConversationNotFound(conversation_id))?;
        entry.conversation.title = Some(title.to_string());
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::types::Role;

    #[tokio::test]
    async fn test_create_and_append() {
        let store = MemoryStore::new();
        let owner = UserId::new();
        let id = store.create_conversation(owner).await.unwrap();

        let seq1 = store
            .append_message(id, NewMessage::new(Role::User, "hello"))
            .await
            .unwrap();
        let seq2 = store
            .append_message(id, NewMessage::new(Role::Assistant, "hi"))
            .await
            .unwrap();
        assert_eq!((seq1, seq2), (1, 2));

        let conversation = store.get_conversation(id).await.unwrap().unwrap();
        assert_eq!(conversation.owner, owner);
        assert_eq!(store.get_history(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_append_same_id_twice() {
        let store = MemoryStore::new();
        let id = store.create_conversation(UserId::new()).await.unwrap();
        let message = NewMessage::new(Role::User, "retry me");

        let first = store.append_message(id, message.clone()).await.unwrap();
        let second = store.append_message(id, message).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.message_count().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_conversation() {
        let store = MemoryStore::new();
        let err = store
            .append_message(ConversationId::new(), NewMessage::new(Role::User, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConversationNotFound(_)));
        assert!(store.set_title(ConversationId::new(), "t").await.is_err());
    }

    #[tokio::test]
    async fn test_message_id_conflict_across_conversations() {
        let store = MemoryStore::new();
        let a = store.create_conversation(UserId::new()).await.unwrap();
        let b = store.create_conversation(UserId::new()).await.unwrap();
        let message = NewMessage::new(Role::User, "shared id");

        store.append_message(a, message.clone()).await.unwrap();
        let err = store.append_message(b, message).await.unwrap_err();
        assert!(matches!(err, StoreError::MessageIdConflict(_)));
    }
}
