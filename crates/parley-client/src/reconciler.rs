//! Client-side transcript state.
//!
//! Every submission first inserts two optimistic entries, the user message
//! and an empty assistant placeholder, then walks one exchange through
//!
//! ```text
//! Idle ─submit─▶ Pending ─data─▶ Streaming ─done─▶ Finalized
//!                   │                │
//!                   └──── error ─────┴──────────▶ Failed ─retry─▶ Pending
//! ```
//!
//! A conversation has at most one exchange in `Pending` or `Streaming`.
//! Optimistic entries carry client-generated ids until the `done` event
//! resolves them to the server's canonical ids, exactly once.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use parley_shared::models::{ConversationWithMessages, Message};
use parley_shared::protocol::{DonePayload, HistoryEntry, SendMessageRequest, StreamEvent};
use parley_shared::types::{ConversationId, MessageId, Role};
use parley_shared::ErrorKind;

use crate::events::{EventSink, TranscriptEvent};

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Delivery {
    /// Created locally, nothing received yet.
    Optimistic,
    /// Fragments are arriving.
    Streaming,
    Complete,
    Failed { retryable: bool, reason: String },
}

/// One visible message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    /// Id generated when the entry was created. Never changes.
    pub client_id: MessageId,
    /// Canonical id: the server's once resolved, `client_id` before that.
    pub id: MessageId,
    pub parent_id: Option<MessageId>,
    pub author: Role,
    /// The accumulating buffer while streaming, final content afterwards.
    pub content: String,
    pub sequence: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub delivery: Delivery,
}

impl TranscriptEntry {
    fn optimistic(author: Role, content: String, parent_id: Option<MessageId>) -> Self {
        let id = MessageId::new();
        Self {
            client_id: id,
            id,
            parent_id,
            author,
            content,
            sequence: None,
            created_at: Utc::now(),
            delivery: Delivery::Optimistic,
        }
    }

    fn stored(message: &Message) -> Self {
        Self {
            client_id: message.id,
            id: message.id,
            parent_id: message.parent_id,
            author: message.author,
            content: message.content.clone(),
            sequence: Some(message.sequence),
            created_at: message.created_at,
            delivery: Delivery::Complete,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.delivery, Delivery::Streaming)
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.delivery, Delivery::Complete)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.delivery, Delivery::Failed { retryable: true, .. })
    }
}

// ---------------------------------------------------------------------------
// Exchange phases
// ---------------------------------------------------------------------------

/// Client ids of the two entries of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeRef {
    pub user: MessageId,
    pub assistant: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Pending(ExchangeRef),
    Streaming {
        exchange: ExchangeRef,
        last_sequence: u64,
    },
    Finalized(ExchangeRef),
    Failed {
        exchange: ExchangeRef,
        failure: FailureKind,
    },
}

impl Phase {
    /// The exchange still waiting for a terminal event, if any.
    pub fn in_flight(&self) -> Option<ExchangeRef> {
        match self {
            Phase::Pending(exchange) | Phase::Streaming { exchange, .. } => Some(*exchange),
            _ => None,
        }
    }
}

/// Why an exchange ended without a reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Non-2xx response: the request itself was refused.
    #[error("{message}")]
    Rejected { kind: ErrorKind, message: String },

    /// Terminal `error` event from the server.
    #[error("{message} ({code})")]
    Upstream { code: String, message: String },

    /// Connection dropped, idle timeout or a malformed stream.
    #[error("connection lost: {0}")]
    Transport(String),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl FailureKind {
    /// Whether sending the same message again can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureKind::Rejected { kind, .. } => {
                matches!(kind, ErrorKind::Internal | ErrorKind::UpstreamFailure)
            }
            _ => true,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("An exchange is already in flight in conversation {0}")]
    Busy(ConversationId),

    #[error("Conversation {0} is not open")]
    UnknownConversation(ConversationId),

    #[error("No exchange in flight in conversation {0}")]
    NoActiveExchange(ConversationId),

    #[error("Nothing to retry in conversation {0}")]
    NothingToRetry(ConversationId),

    #[error("Event sequence {got} arrived after {last}")]
    OutOfOrder { got: u64, last: u64 },

    #[error("Message {0} was already resolved")]
    AlreadyResolved(MessageId),
}

// ---------------------------------------------------------------------------
// Identity map
// ---------------------------------------------------------------------------

/// Client id → canonical id, each key written once.
#[derive(Debug, Default)]
pub struct IdentityMap {
    resolved: HashMap<MessageId, MessageId>,
}

impl IdentityMap {
    pub fn is_resolved(&self, client_id: MessageId) -> bool {
        self.resolved.contains_key(&client_id)
    }

    pub fn resolve(
        &mut self,
        client_id: MessageId,
        canonical: MessageId,
    ) -> Result<(), ReconcileError> {
        match self.resolved.entry(client_id) {
            Entry::Occupied(_) => Err(ReconcileError::AlreadyResolved(client_id)),
            Entry::Vacant(slot) => {
                slot.insert(canonical);
                Ok(())
            }
        }
    }

    pub fn canonical(&self, client_id: MessageId) -> Option<MessageId> {
        self.resolved.get(&client_id).copied()
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// What the session has to send for a submission or a retry.
#[derive(Debug, Clone)]
pub struct OutgoingExchange {
    pub exchange: ExchangeRef,
    pub request: SendMessageRequest,
    /// `true` when this reuses the entries of a failed exchange.
    pub is_retry: bool,
}

#[derive(Debug)]
struct ConversationState {
    entries: Vec<TranscriptEntry>,
    phase: Phase,
    title: Option<String>,
    title_requested: bool,
}

impl ConversationState {
    fn new(entries: Vec<TranscriptEntry>, title: Option<String>) -> Self {
        Self {
            entries,
            phase: Phase::Idle,
            title_requested: title.is_some(),
            title,
        }
    }

    fn position(&self, client_id: MessageId) -> Option<usize> {
        self.entries.iter().position(|e| e.client_id == client_id)
    }

    fn entry_mut(&mut self, client_id: MessageId) -> Option<&mut TranscriptEntry> {
        self.entries.iter_mut().find(|e| e.client_id == client_id)
    }

    /// Complete entries before `before` (all of them when `None`).
    fn history(&self, before: Option<usize>) -> Vec<HistoryEntry> {
        let end = before.unwrap_or(self.entries.len());
        self.entries[..end]
            .iter()
            .filter(|e| e.is_complete())
            .map(|e| HistoryEntry {
                id: Some(e.id),
                content: e.content.clone(),
                author: e.author,
                created_at: Some(e.created_at),
            })
            .collect()
    }

    fn last_complete_id(&self, before: Option<usize>) -> Option<MessageId> {
        let end = before.unwrap_or(self.entries.len());
        self.entries[..end]
            .iter()
            .rev()
            .find(|e| e.is_complete())
            .map(|e| e.id)
    }
}

#[derive(Debug, Default)]
pub struct Reconciler {
    conversations: HashMap<ConversationId, ConversationState>,
    identities: IdentityMap,
    events: EventSink,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every [`TranscriptEvent`] from now on. A later call replaces
    /// the previous subscriber.
    pub fn subscribe(&mut self) -> tokio::sync::mpsc::UnboundedReceiver<TranscriptEvent> {
        self.events.subscribe()
    }

    /// Start tracking a conversation that has no messages yet.
    pub fn open_empty(&mut self, id: ConversationId) -> Result<(), ReconcileError> {
        self.install(id, ConversationState::new(Vec::new(), None))
    }

    /// Start tracking a conversation loaded from the server, replacing any
    /// local state for it.
    pub fn open(&mut self, conversation: &ConversationWithMessages) -> Result<(), ReconcileError> {
        let entries = conversation.messages.iter().map(TranscriptEntry::stored).collect();
        let state = ConversationState::new(entries, conversation.conversation.title.clone());
        self.install(conversation.conversation.id, state)
    }

    fn install(
        &mut self,
        id: ConversationId,
        state: ConversationState,
    ) -> Result<(), ReconcileError> {
        if let Some(existing) = self.conversations.get(&id) {
            if existing.phase.in_flight().is_some() {
                return Err(ReconcileError::Busy(id));
            }
        }
        self.conversations.insert(id, state);
        Ok(())
    }

    fn state(&self, id: ConversationId) -> Result<&ConversationState, ReconcileError> {
        self.conversations
            .get(&id)
            .ok_or(ReconcileError::UnknownConversation(id))
    }

    fn state_mut(&mut self, id: ConversationId) -> Result<&mut ConversationState, ReconcileError> {
        self.conversations
            .get_mut(&id)
            .ok_or(ReconcileError::UnknownConversation(id))
    }

    pub fn entries(&self, id: ConversationId) -> Option<&[TranscriptEntry]> {
        self.conversations.get(&id).map(|s| s.entries.as_slice())
    }

    pub fn phase(&self, id: ConversationId) -> Option<&Phase> {
        self.conversations.get(&id).map(|s| &s.phase)
    }

    pub fn title(&self, id: ConversationId) -> Option<&str> {
        self.conversations.get(&id).and_then(|s| s.title.as_deref())
    }

    pub fn canonical_id(&self, client_id: MessageId) -> Option<MessageId> {
        self.identities.canonical(client_id)
    }

    /// Insert the optimistic entries for `content` and return the request
    /// to send. Content identical to a failed, retryable message is sent
    /// again as a retry of that exchange instead.
    pub fn submit(
        &mut self,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<OutgoingExchange, ReconcileError> {
        let state = self.state(conversation_id)?;
        if state.phase.in_flight().is_some() {
            return Err(ReconcileError::Busy(conversation_id));
        }
        let resubmission = match &state.phase {
            Phase::Failed { exchange, failure } => {
                failure.is_retryable()
                    && state
                        .position(exchange.user)
                        .is_some_and(|i| state.entries[i].content == content)
            }
            _ => false,
        };
        if resubmission {
            return self.retry(conversation_id);
        }

        let state = self.state_mut(conversation_id)?;
        let parent_id = state.last_complete_id(None);
        let history = state.history(None);

        let user = TranscriptEntry::optimistic(Role::User, content.to_string(), parent_id);
        let assistant =
            TranscriptEntry::optimistic(Role::Assistant, String::new(), Some(user.client_id));
        let exchange = ExchangeRef {
            user: user.client_id,
            assistant: assistant.client_id,
        };
        state.entries.push(user.clone());
        state.entries.push(assistant.clone());
        state.phase = Phase::Pending(exchange);

        self.events.emit(TranscriptEvent::EntryAdded {
            conversation_id,
            entry: user,
        });
        self.events.emit(TranscriptEvent::EntryAdded {
            conversation_id,
            entry: assistant,
        });

        Ok(OutgoingExchange {
            exchange,
            request: SendMessageRequest {
                conversation_id,
                content: content.to_string(),
                parent_message_id: parent_id,
                history,
                client_message_id: Some(exchange.user),
            },
            is_retry: false,
        })
    }

    /// Send the last failed exchange again, reusing its user entry and
    /// clearing its placeholder.
    pub fn retry(
        &mut self,
        conversation_id: ConversationId,
    ) -> Result<OutgoingExchange, ReconcileError> {
        let state = self.state_mut(conversation_id)?;
        let exchange = match &state.phase {
            Phase::Failed { exchange, failure } if failure.is_retryable() => *exchange,
            Phase::Pending(_) | Phase::Streaming { .. } => {
                return Err(ReconcileError::Busy(conversation_id))
            }
            _ => return Err(ReconcileError::NothingToRetry(conversation_id)),
        };
        let user_pos = state
            .position(exchange.user)
            .ok_or(ReconcileError::NothingToRetry(conversation_id))?;

        let parent_id = state.last_complete_id(Some(user_pos));
        let history = state.history(Some(user_pos));
        let content = {
            let user = &mut state.entries[user_pos];
            user.delivery = Delivery::Optimistic;
            user.parent_id = parent_id;
            user.content.clone()
        };
        if let Some(assistant) = state.entry_mut(exchange.assistant) {
            assistant.content.clear();
            assistant.delivery = Delivery::Optimistic;
        }
        state.phase = Phase::Pending(exchange);

        self.events.emit(TranscriptEvent::ExchangeRetried {
            conversation_id,
            user_id: exchange.user,
            assistant_id: exchange.assistant,
        });

        Ok(OutgoingExchange {
            exchange,
            request: SendMessageRequest {
                conversation_id,
                content,
                parent_message_id: parent_id,
                history,
                client_message_id: Some(exchange.user),
            },
            is_retry: true,
        })
    }

    /// Apply one decoded stream event to the in-flight exchange.
    pub fn apply(
        &mut self,
        conversation_id: ConversationId,
        event: &StreamEvent,
    ) -> Result<(), ReconcileError> {
        let state = self.state(conversation_id)?;
        let exchange = match &state.phase {
            Phase::Pending(exchange) => *exchange,
            Phase::Streaming {
                exchange,
                last_sequence,
            } => {
                if event.sequence() < *last_sequence {
                    return Err(ReconcileError::OutOfOrder {
                        got: event.sequence(),
                        last: *last_sequence,
                    });
                }
                *exchange
            }
            _ => return Err(ReconcileError::NoActiveExchange(conversation_id)),
        };

        match event {
            StreamEvent::Data { sequence, payload } => {
                let state = self.state_mut(conversation_id)?;
                if let Some(assistant) = state.entry_mut(exchange.assistant) {
                    assistant.content.push_str(&payload.content);
                    assistant.delivery = Delivery::Streaming;
                }
                state.phase = Phase::Streaming {
                    exchange,
                    last_sequence: *sequence,
                };
                self.events.emit(TranscriptEvent::FragmentAppended {
                    conversation_id,
                    entry_id: exchange.assistant,
                    content: payload.content.clone(),
                });
                Ok(())
            }
            StreamEvent::Done { payload, .. } => self.finalize(conversation_id, exchange, payload),
            StreamEvent::Error { payload, .. } => self.fail(
                conversation_id,
                FailureKind::Upstream {
                    code: payload.code.clone(),
                    message: payload.message.clone(),
                },
            ),
        }
    }

    fn finalize(
        &mut self,
        conversation_id: ConversationId,
        exchange: ExchangeRef,
        ids: &DonePayload,
    ) -> Result<(), ReconcileError> {
        for client_id in [exchange.user, exchange.assistant] {
            if self.identities.is_resolved(client_id) {
                return Err(ReconcileError::AlreadyResolved(client_id));
            }
        }
        let user_id = ids.user_message_id.unwrap_or(exchange.user);
        let assistant_id = ids.assistant_message_id.unwrap_or(exchange.assistant);
        self.identities.resolve(exchange.user, user_id)?;
        self.identities.resolve(exchange.assistant, assistant_id)?;

        let state = self.state_mut(conversation_id)?;
        let user = state.entry_mut(exchange.user).map(|entry| {
            entry.id = user_id;
            entry.sequence = ids.user_sequence.or(entry.sequence);
            entry.delivery = Delivery::Complete;
            entry.clone()
        });
        let assistant = state.entry_mut(exchange.assistant).map(|entry| {
            entry.id = assistant_id;
            entry.parent_id = Some(user_id);
            entry.sequence = ids.assistant_sequence.or(entry.sequence);
            entry.delivery = Delivery::Complete;
            entry.clone()
        });
        state.phase = Phase::Finalized(exchange);

        if let (Some(user), Some(assistant)) = (user, assistant) {
            self.events.emit(TranscriptEvent::ExchangeFinalized {
                conversation_id,
                user,
                assistant,
            });
        }
        Ok(())
    }

    /// Move the in-flight exchange to `Failed`, keeping its partial buffer.
    pub fn fail(
        &mut self,
        conversation_id: ConversationId,
        failure: FailureKind,
    ) -> Result<(), ReconcileError> {
        let state = self.state_mut(conversation_id)?;
        let exchange = state
            .phase
            .in_flight()
            .ok_or(ReconcileError::NoActiveExchange(conversation_id))?;

        let retryable = failure.is_retryable();
        let reason = failure.to_string();
        for client_id in [exchange.user, exchange.assistant] {
            if let Some(entry) = state.entry_mut(client_id) {
                entry.delivery = Delivery::Failed {
                    retryable,
                    reason: reason.clone(),
                };
            }
        }
        state.phase = Phase::Failed { exchange, failure };

        self.events.emit(TranscriptEvent::ExchangeFailed {
            conversation_id,
            user_id: exchange.user,
            assistant_id: exchange.assistant,
            reason,
            retryable,
        });
        Ok(())
    }

    /// `true` once per untitled conversation, after its first finalized
    /// exchange. Marks the title as requested.
    pub fn take_title_request(&mut self, conversation_id: ConversationId) -> bool {
        let Some(state) = self.conversations.get_mut(&conversation_id) else {
            return false;
        };
        let wanted = state.title.is_none()
            && !state.title_requested
            && matches!(state.phase, Phase::Finalized(_));
        if wanted {
            state.title_requested = true;
        }
        wanted
    }

    pub fn set_title(
        &mut self,
        conversation_id: ConversationId,
        title: String,
    ) -> Result<(), ReconcileError> {
        let state = self.state_mut(conversation_id)?;
        state.title = Some(title.clone());
        state.title_requested = true;
        self.events.emit(TranscriptEvent::TitleChanged {
            conversation_id,
            title,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::models::Conversation;
    use parley_shared::types::UserId;

    fn open() -> (Reconciler, ConversationId) {
        let mut reconciler = Reconciler::new();
        let id = ConversationId::new();
        reconciler.open_empty(id).unwrap();
        (reconciler, id)
    }

    fn assistant(reconciler: &Reconciler, id: ConversationId) -> &TranscriptEntry {
        reconciler
            .entries(id)
            .unwrap()
            .iter()
            .rev()
            .find(|e| e.author == Role::Assistant)
            .unwrap()
    }

    #[test]
    fn test_submit_inserts_optimistic_entries() {
        let (mut reconciler, id) = open();
        let out = reconciler.submit(id, "Summarize this doc").unwrap();

        let entries = reconciler.entries(id).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].content, "Summarize this doc");
        assert_eq!(entries[0].delivery, Delivery::Optimistic);
        assert_eq!(entries[1].content, "");
        assert_eq!(entries[1].parent_id, Some(entries[0].client_id));
        assert_eq!(reconciler.phase(id), Some(&Phase::Pending(out.exchange)));
        assert_eq!(out.request.client_message_id, Some(out.exchange.user));
        assert!(out.request.history.is_empty());
        assert!(!out.is_retry);
    }

    #[test]
    fn test_fragments_then_done_finalizes() {
        let (mut reconciler, id) = open();
        let out = reconciler.submit(id, "Summarize this doc").unwrap();

        for (seq, text) in ["Sum", "mar", "y: ..."].iter().enumerate() {
            reconciler.apply(id, &StreamEvent::data(seq as u64, *text)).unwrap();
            assert!(assistant(&reconciler, id).is_streaming());
        }

        let ids = DonePayload {
            user_message_id: Some(MessageId::new()),
            user_sequence: Some(1),
            assistant_message_id: Some(MessageId::new()),
            assistant_sequence: Some(2),
        };
        reconciler.apply(id, &StreamEvent::done(3, ids.clone())).unwrap();

        let reply = assistant(&reconciler, id);
        assert_eq!(reply.content, "Summary: ...");
        assert!(!reply.is_streaming());
        assert_eq!(reply.delivery, Delivery::Complete);
        assert_eq!(Some(reply.id), ids.assistant_message_id);
        assert_eq!(reply.sequence, Some(2));
        assert_eq!(reply.parent_id, ids.user_message_id);
        assert_eq!(reconciler.canonical_id(out.exchange.user), ids.user_message_id);
        assert_eq!(reconciler.phase(id), Some(&Phase::Finalized(out.exchange)));
    }

    #[test]
    fn test_done_without_ids_keeps_client_ids() {
        let (mut reconciler, id) = open();
        let out = reconciler.submit(id, "hi").unwrap();
        reconciler.apply(id, &StreamEvent::done(0, DonePayload::default())).unwrap();

        let reply = assistant(&reconciler, id);
        assert_eq!(reply.id, out.exchange.assistant);
        assert_eq!(reply.content, "");
        assert_eq!(reply.delivery, Delivery::Complete);
    }

    #[test]
    fn test_second_submission_is_rejected_while_in_flight() {
        let (mut reconciler, id) = open();
        reconciler.submit(id, "one").unwrap();
        assert!(matches!(
            reconciler.submit(id, "two"),
            Err(ReconcileError::Busy(c)) if c == id
        ));
        assert_eq!(reconciler.entries(id).unwrap().len(), 2);
    }

    #[test]
    fn test_error_after_fragments_keeps_partial_buffer() {
        let (mut reconciler, id) = open();
        let out = reconciler.submit(id, "go").unwrap();
        for (seq, text) in ["a", "b", "c"].iter().enumerate() {
            reconciler.apply(id, &StreamEvent::data(seq as u64, *text)).unwrap();
        }
        reconciler
            .apply(id, &StreamEvent::error(3, "upstream_failure", "connection reset"))
            .unwrap();

        let reply = assistant(&reconciler, id);
        assert_eq!(reply.content, "abc");
        assert!(reply.is_retryable());
        assert!(reconciler.entries(id).unwrap()[0].is_retryable());
        assert!(matches!(
            reconciler.phase(id),
            Some(Phase::Failed { exchange, .. }) if *exchange == out.exchange
        ));
        assert!(reconciler.canonical_id(out.exchange.user).is_none());
    }

    #[test]
    fn test_identical_resubmission_reuses_entries() {
        let (mut reconciler, id) = open();
        let first = reconciler.submit(id, "Summarize this doc").unwrap();
        reconciler.apply(id, &StreamEvent::data(0, "Sum")).unwrap();
        reconciler
            .fail(id, FailureKind::Transport("connection reset".into()))
            .unwrap();

        let again = reconciler.submit(id, "Summarize this doc").unwrap();
        assert!(again.is_retry);
        assert_eq!(again.exchange, first.exchange);
        assert_eq!(again.request.client_message_id, first.request.client_message_id);

        let entries = reconciler.entries(id).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].content, "");
        assert_eq!(entries[1].delivery, Delivery::Optimistic);
    }

    #[test]
    fn test_different_content_after_failure_is_a_new_exchange() {
        let (mut reconciler, id) = open();
        let first = reconciler.submit(id, "one").unwrap();
        reconciler.fail(id, FailureKind::Transport("reset".into())).unwrap();

        let second = reconciler.submit(id, "two").unwrap();
        assert_ne!(second.exchange, first.exchange);
        assert_eq!(reconciler.entries(id).unwrap().len(), 4);
        // Failed entries are not sent as history.
        assert!(second.request.history.is_empty());
    }

    #[test]
    fn test_rejected_validation_is_not_retryable() {
        let (mut reconciler, id) = open();
        reconciler.submit(id, "").unwrap();
        reconciler
            .fail(
                id,
                FailureKind::Rejected {
                    kind: ErrorKind::Validation,
                    message: "validation failed".into(),
                },
            )
            .unwrap();

        assert_eq!(
            reconciler.retry(id).map(|o| o.exchange),
            Err(ReconcileError::NothingToRetry(id))
        );
        let again = reconciler.submit(id, "").unwrap();
        assert!(!again.is_retry);
    }

    #[test]
    fn test_out_of_order_event_is_rejected() {
        let (mut reconciler, id) = open();
        reconciler.submit(id, "go").unwrap();
        reconciler.apply(id, &StreamEvent::data(2, "a")).unwrap();
        assert_eq!(
            reconciler.apply(id, &StreamEvent::data(1, "b")),
            Err(ReconcileError::OutOfOrder { got: 1, last: 2 })
        );
        assert_eq!(assistant(&reconciler, id).content, "a");
    }

    #[test]
    fn test_events_without_exchange_are_rejected() {
        let (mut reconciler, id) = open();
        assert_eq!(
            reconciler.apply(id, &StreamEvent::data(0, "a")),
            Err(ReconcileError::NoActiveExchange(id))
        );
        reconciler.submit(id, "go").unwrap();
        reconciler.apply(id, &StreamEvent::done(0, DonePayload::default())).unwrap();
        assert_eq!(
            reconciler.apply(id, &StreamEvent::done(1, DonePayload::default())),
            Err(ReconcileError::NoActiveExchange(id))
        );
    }

    #[test]
    fn test_identity_resolves_once() {
        let mut map = IdentityMap::default();
        let client = MessageId::new();
        let canonical = MessageId::new();
        map.resolve(client, canonical).unwrap();
        assert_eq!(
            map.resolve(client, MessageId::new()),
            Err(ReconcileError::AlreadyResolved(client))
        );
        assert_eq!(map.canonical(client), Some(canonical));
    }

    #[test]
    fn test_history_and_parent_follow_completed_entries() {
        let mut reconciler = Reconciler::new();
        let conversation = Conversation::new(UserId::new());
        let stored = Message {
            id: MessageId::new(),
            conversation_id: conversation.id,
            parent_id: None,
            author: Role::User,
            content: "earlier".into(),
            created_at: Utc::now(),
            sequence: 1,
        };
        let id = conversation.id;
        reconciler
            .open(&ConversationWithMessages {
                conversation,
                messages: vec![stored.clone()],
            })
            .unwrap();

        let out = reconciler.submit(id, "next").unwrap();
        assert_eq!(out.request.parent_message_id, Some(stored.id));
        assert_eq!(out.request.history.len(), 1);
        assert_eq!(out.request.history[0].content, "earlier");
    }

    #[test]
    fn test_title_requested_once_after_first_exchange() {
        let (mut reconciler, id) = open();
        assert!(!reconciler.take_title_request(id));

        reconciler.submit(id, "hi").unwrap();
        reconciler.apply(id, &StreamEvent::done(0, DonePayload::default())).unwrap();
        assert!(reconciler.take_title_request(id));
        assert!(!reconciler.take_title_request(id));

        reconciler.set_title(id, "Greetings".into()).unwrap();
        assert_eq!(reconciler.title(id), Some("Greetings"));
    }

    #[tokio::test]
    async fn test_subscriber_sees_transcript_events() {
        let (mut reconciler, id) = open();
        let mut rx = reconciler.subscribe();

        reconciler.submit(id, "hi").unwrap();
        reconciler.apply(id, &StreamEvent::data(0, "hey")).unwrap();
        reconciler.apply(id, &StreamEvent::done(1, DonePayload::default())).unwrap();
        drop(reconciler);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(match event {
                TranscriptEvent::EntryAdded { .. } => "added",
                TranscriptEvent::FragmentAppended { .. } => "fragment",
                TranscriptEvent::ExchangeFinalized { .. } => "finalized",
                TranscriptEvent::ExchangeFailed { .. } => "failed",
                TranscriptEvent::ExchangeRetried { .. } => "retried",
                TranscriptEvent::TitleChanged { .. } => "title",
            });
        }
        assert_eq!(kinds, vec!["added", "added", "fragment", "finalized"]);
    }
}
