//! # parley-store
//!
//! Conversation persistence for the Parley server.
//!
//! The streaming core never talks to a database directly; it goes through
//! the narrow [`ConversationStore`] trait. Two adapters ship with the crate:
//! [`MemoryStore`] for development and tests, and [`SqliteStore`], which wraps
//! a synchronous [`Database`] handle around a `rusqlite::Connection`.

pub mod conversations;
pub mod database;
pub mod memory;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod sqlite;

mod error;

use async_trait::async_trait;

use parley_shared::types::{ConversationId, UserId};

pub use database::Database;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use models::*;
pub use sqlite::SqliteStore;

/// Persistence collaborator of the request pipeline.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create an empty conversation owned by `owner`.
    async fn create_conversation(&self, owner: UserId) -> error::Result<ConversationId>;

    async fn get_conversation(&self, id: ConversationId) -> error::Result<Option<Conversation>>;

    /// Append a message and return its sequence number.
    ///
    /// Idempotent on `message.id`: appending an id that is already stored in
    /// the same conversation returns the existing sequence and stores nothing.
    async fn append_message(
        &self,
        conversation_id: ConversationId,
        message: NewMessage,
    ) -> error::Result<u64>;

    /// All messages of a conversation in sequence order.
    async fn get_history(&self, conversation_id: ConversationId) -> error::Result<Vec<Message>>;

    async fn set_title(&self, conversation_id: ConversationId, title: &str) -> error::Result<()>;

    /// Name of this backend (for logging/debug)
    fn backend_name(&self) -> &str;
}
