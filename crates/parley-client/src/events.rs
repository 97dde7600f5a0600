//! Transcript events published by the [`Reconciler`](crate::reconciler::Reconciler)
//! for whatever renders the conversation.

use serde::Serialize;
use tokio::sync::mpsc;

use parley_shared::types::{ConversationId, MessageId};

use crate::reconciler::TranscriptEntry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptEvent {
    /// A new entry became visible (optimistic user message or placeholder).
    EntryAdded {
        conversation_id: ConversationId,
        entry: TranscriptEntry,
    },
    /// `content` was appended to the placeholder `entry_id`.
    FragmentAppended {
        conversation_id: ConversationId,
        entry_id: MessageId,
        content: String,
    },
    /// Both entries of the exchange are complete and carry their final ids.
    ExchangeFinalized {
        conversation_id: ConversationId,
        user: TranscriptEntry,
        assistant: TranscriptEntry,
    },
    /// The exchange ended without a reply. The partial buffer stays visible.
    ExchangeFailed {
        conversation_id: ConversationId,
        user_id: MessageId,
        assistant_id: MessageId,
        reason: String,
        retryable: bool,
    },
    /// A failed exchange is being sent again; the placeholder was cleared.
    ExchangeRetried {
        conversation_id: ConversationId,
        user_id: MessageId,
        assistant_id: MessageId,
    },
    TitleChanged {
        conversation_id: ConversationId,
        title: String,
    },
}

/// Optional subscriber channel. Publishing never blocks and a closed
/// receiver is logged once and then ignored.
#[derive(Debug, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<TranscriptEvent>>,
}

impl EventSink {
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TranscriptEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx = Some(tx);
        rx
    }

    pub fn emit(&mut self, event: TranscriptEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(event).is_err() {
            tracing::debug!("Transcript subscriber went away, dropping events");
            self.tx = None;
        }
    }
}
