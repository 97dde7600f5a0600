//! CRUD operations for [`Conversation`] records.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use parley_shared::types::{ConversationId, UserId};

use crate::database::Database;
use crate::error::Result;
use crate::models::Conversation;

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new conversation.
    pub fn insert_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.conn().execute(
            "INSERT INTO conversations (id, owner_id, title, created_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                conversation.id.to_string(),
                conversation.owner.to_string(),
                conversation.title,
                conversation.created_at.to_rfc3339(),
                conversation.last_activity_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single conversation, `None` when it does not exist.
    pub fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let conversation = self
            .conn()
            .query_row(
                "SELECT id, owner_id, title, created_at, last_activity_at
                 FROM conversations
                 WHERE id = ?1",
                params![id.to_string()],
                row_to_conversation,
            )
            .optional()?;
        Ok(conversation)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Set the title. Returns `true` if the conversation exists.
    pub fn set_conversation_title(&self, id: ConversationId, title: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE conversations SET title = ?1 WHERE id = ?2",
            params![title, id.to_string()],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Conversation`].
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id_str: String = row.get(0)?;
    let owner_str: String = row.get(1)?;
    let title: Option<String> = row.get(2)?;
    let created_str: String = row.get(3)?;
    let activity_str: String = row.get(4)?;

    Ok(Conversation {
        id: ConversationId(parse_uuid(0, &id_str)?),
        owner: UserId(parse_uuid(1, &owner_str)?),
        title,
        created_at: parse_timestamp(3, &created_str)?,
        last_activity_at: parse_timestamp(4, &activity_str)?,
    })
}

pub(crate) fn parse_uuid(idx: usize, value: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (db, dir)
    }

    #[test]
    fn insert_and_get() {
        let (db, _dir) = test_db();
        let conversation = Conversation::new(UserId::new());
        db.insert_conversation(&conversation).unwrap();

        let loaded = db.get_conversation(conversation.id).unwrap().unwrap();
        assert_eq!(loaded.id, conversation.id);
        assert_eq!(loaded.owner, conversation.owner);
        assert_eq!(loaded.title, None);
    }

    #[test]
    fn missing_conversation_is_none() {
        let (db, _dir) = test_db();
        assert!(db.get_conversation(ConversationId::new()).unwrap().is_none());
    }

    #[test]
    fn set_title() {
        let (db, _dir) = test_db();
        let conversation = Conversation::new(UserId::new());
        db.insert_conversation(&conversation).unwrap();

        assert!(db.set_conversation_title(conversation.id, "Doc summary").unwrap());
        let loaded = db.get_conversation(conversation.id).unwrap().unwrap();
        assert_eq!(loaded.title.as_deref(), Some("Doc summary"));

        assert!(!db.set_conversation_title(ConversationId::new(), "nope").unwrap());
    }
}
