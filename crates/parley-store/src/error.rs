use thiserror::Error;

use parley_shared::protocol::FieldError;
use parley_shared::types::{ConversationId, MessageId};
use parley_shared::ChatError;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The conversation does not exist.
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    /// A message id is already stored under a different conversation.
    #[error("Message {0} already belongs to another conversation")]
    MessageIdConflict(MessageId),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A blocking database task panicked or was cancelled.
    #[error("Store task failed: {0}")]
    Task(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConversationNotFound(id) => {
                ChatError::NotFound(format!("conversation {id}"))
            }
            StoreError::MessageIdConflict(_) => ChatError::Validation(vec![FieldError::new(
                "clientMessageId",
                "already used in another conversation",
            )]),
            other => ChatError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::ErrorKind;

    #[test]
    fn test_chat_error_mapping() {
        let missing: ChatError = StoreError::ConversationNotFound(ConversationId::new()).into();
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let conflict: ChatError = StoreError::MessageIdConflict(MessageId::new()).into();
        assert_eq!(conflict.kind(), ErrorKind::Validation);

        let io: ChatError = StoreError::Task("worker gone".into()).into();
        assert_eq!(io.kind(), ErrorKind::Internal);
    }
}
