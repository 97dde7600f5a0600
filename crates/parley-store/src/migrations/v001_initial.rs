//! v001 -- Initial schema creation.
//!
//! Creates `conversations` and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id               TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    owner_id         TEXT NOT NULL,               -- UUID of the owning user
    title            TEXT,
    created_at       TEXT NOT NULL,               -- RFC-3339
    last_activity_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_owner
    ON conversations(owner_id, last_activity_at DESC);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,    -- UUID v4, client or server generated
    conversation_id TEXT NOT NULL,                -- FK -> conversations(id)
    parent_id       TEXT,                         -- threading, nullable
    author          TEXT NOT NULL,                -- user | assistant | system
    content         TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    sequence        INTEGER NOT NULL,             -- monotonic per conversation

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    UNIQUE (conversation_id, sequence)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
