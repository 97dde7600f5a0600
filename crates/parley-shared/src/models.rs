//! Domain models exchanged between the store, the server and the client.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be returned
//! directly from the HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, MessageId, Role, UserId};

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A conversation between one user and the assistant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    /// The user that created the conversation.
    pub owner: UserId,
    /// Short summary generated after the first exchange.
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Bumped every time a message is appended.
    pub last_activity_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(owner: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            owner,
            title: None,
            created_at: now,
            last_activity_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A message before the store has assigned it a sequence number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub id: MessageId,
    pub parent_id: Option<MessageId>,
    pub author: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn new(author: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            parent_id: None,
            author,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    pub fn with_parent(mut self, parent_id: Option<MessageId>) -> Self {
        self.parent_id = parent_id;
        self
    }
}

/// A stored, complete message. Content never changes once stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub parent_id: Option<MessageId>,
    pub author: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Monotonic per conversation, starting at 1.
    pub sequence: u64,
}

/// A conversation together with its ordered messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationWithMessages {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}
