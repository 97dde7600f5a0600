use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::types::{ConversationId, MessageId, Role};

/// Body of `POST /chat/stream`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub content: String,
    #[serde(default)]
    pub parent_message_id: Option<MessageId>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Identifier of the optimistic user message. Resubmitting with the
    /// same id never stores the message twice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<MessageId>,
}

/// One prior message sent along with a new user message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub content: String,
    pub author: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl HistoryEntry {
    pub fn new(author: Role, content: impl Into<String>) -> Self {
        Self {
            id: None,
            content: content.into(),
            author,
            created_at: None,
        }
    }
}

/// Response of `POST /conversations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedConversation {
    pub id: ConversationId,
}

/// Response of `POST /conversations/:id/title`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitleResponse {
    pub title: String,
}

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

/// One framed event of an exchange stream.
///
/// Serialized as `{"type": "...", "sequence": n, "payload": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Data { sequence: u64, payload: DataPayload },
    Error { sequence: u64, payload: ErrorPayload },
    Done { sequence: u64, payload: DonePayload },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataPayload {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Machine-readable code, see [`crate::constants::codes`].
    pub code: String,
    pub message: String,
}

/// Canonical identity the server assigned to both messages of the exchange.
/// Every field is optional; `{}` is a valid payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DonePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_sequence: Option<u64>,
}

/// The `event:` tag of an SSE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Data,
    Error,
    Done,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Error => "error",
            Self::Done => "done",
        }
    }
}

impl StreamEvent {
    pub fn data(sequence: u64, content: impl Into<String>) -> Self {
        Self::Data {
            sequence,
            payload: DataPayload {
                content: content.into(),
            },
        }
    }

    pub fn error(sequence: u64, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            sequence,
            payload: ErrorPayload {
                code: code.into(),
                message: message.into(),
            },
        }
    }

    pub fn done(sequence: u64, payload: DonePayload) -> Self {
        Self::Done { sequence, payload }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            Self::Data { sequence, .. }
            | Self::Error { sequence, .. }
            | Self::Done { sequence, .. } => *sequence,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Data { .. } => EventKind::Data,
            Self::Error { .. } => EventKind::Error,
            Self::Done { .. } => EventKind::Done,
        }
    }

    /// `done` and `error` end the exchange; nothing follows them.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Data { .. })
    }
}

// ---------------------------------------------------------------------------
// Non-stream error responses
// ---------------------------------------------------------------------------

/// A single failed field rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// JSON body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}
