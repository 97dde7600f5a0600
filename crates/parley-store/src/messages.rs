use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use parley_shared::types::{ConversationId, MessageId, Role};

use crate::conversations::{parse_timestamp, parse_uuid};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Message, NewMessage};

impl Database {
    /// Append a message, assigning the next sequence number of the
    /// conversation. Re-appending a stored id returns its sequence.
    pub fn append_message(
        &mut self,
        conversation_id: ConversationId,
        message: &NewMessage,
    ) -> Result<u64> {
        let tx = self.conn_mut().transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1)",
            params![conversation_id.to_string()],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StoreError::ConversationNotFound(conversation_id));
        }

        let existing: Option<(String, i64)> = tx
            .query_row(
                "SELECT conversation_id, sequence FROM messages WHERE id = ?1",
                params![message.id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((stored_conversation, sequence)) = existing {
            if stored_conversation != conversation_id.to_string() {
                return Err(StoreError::MessageIdConflict(message.id));
            }
            tracing::debug!(message_id = %message.id, sequence, "message already stored");
            return Ok(sequence as u64);
        }

        let sequence: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM messages WHERE conversation_id = ?1",
            params![conversation_id.to_string()],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO messages (id, conversation_id, parent_id, author, content, created_at, sequence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id.to_string(),
                conversation_id.to_string(),
                message.parent_id.map(|p| p.to_string()),
                message.author.as_str(),
                message.content,
                message.created_at.to_rfc3339(),
                sequence,
            ],
        )?;
        tx.execute(
            "UPDATE conversations SET last_activity_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), conversation_id.to_string()],
        )?;
        tx.commit()?;

        Ok(sequence as u64)
    }

    /// All messages of a conversation, oldest first.
    pub fn get_history(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, conversation_id, parent_id, author, content, created_at, sequence
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY sequence ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id.to_string()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let conversation_str: String = row.get(1)?;
    let parent_str: Option<String> = row.get(2)?;
    let author_str: String = row.get(3)?;
    let content: String = row.get(4)?;
    let created_str: String = row.get(5)?;
    let sequence: i64 = row.get(6)?;

    let parent_id = parent_str
        .map(|s| parse_uuid(2, &s))
        .transpose()?
        .map(MessageId);

    let author: Role = author_str.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(Message {
        id: MessageId(parse_uuid(0, &id_str)?),
        conversation_id: ConversationId(parse_uuid(1, &conversation_str)?),
        parent_id,
        author,
        content,
        created_at: parse_timestamp(5, &created_str)?,
        sequence: sequence as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Conversation;
    use parley_shared::types::UserId;

    fn test_db() -> (Database, Conversation, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        let conversation = Conversation::new(UserId::new());
        db.insert_conversation(&conversation).unwrap();
        (db, conversation, dir)
    }

    #[test]
    fn sequences_are_monotonic() {
        let (mut db, conversation, _dir) = test_db();

        let first = db
            .append_message(conversation.id, &NewMessage::new(Role::User, "hello"))
            .unwrap();
        let second = db
            .append_message(conversation.id, &NewMessage::new(Role::Assistant, "hi"))
            .unwrap();
        assert_eq!((first, second), (1, 2));

        let history = db.get_history(conversation.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[1].author, Role::Assistant);
    }

    #[test]
    fn append_is_idempotent_on_id() {
        let (mut db, conversation, _dir) = test_db();
        let message = NewMessage::new(Role::User, "once");

        let first = db.append_message(conversation.id, &message).unwrap();
        let again = db.append_message(conversation.id, &message).unwrap();
        assert_eq!(first, again);
        assert_eq!(db.get_history(conversation.id).unwrap().len(), 1);
    }

    #[test]
    fn append_to_unknown_conversation_fails() {
        let (mut db, _conversation, _dir) = test_db();
        let err = db
            .append_message(ConversationId::new(), &NewMessage::new(Role::User, "x"))
            .unwrap_err();
        assert!(matches!(err, StoreError::ConversationNotFound(_)));
    }

    #[test]
    fn parent_id_round_trips() {
        let (mut db, conversation, _dir) = test_db();
        let parent = NewMessage::new(Role::User, "q");
        db.append_message(conversation.id, &parent).unwrap();
        let child = NewMessage::new(Role::Assistant, "a").with_parent(Some(parent.id));
        db.append_message(conversation.id, &child).unwrap();

        let history = db.get_history(conversation.id).unwrap();
        assert_eq!(history[1].parent_id, Some(parent.id));
    }
}
