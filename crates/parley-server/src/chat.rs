//! Request types carried by the pipeline and the service that handles them.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;

use parley_shared::models::{ConversationWithMessages, NewMessage};
use parley_shared::protocol::{DonePayload, FieldError, SendMessageRequest};
use parley_shared::types::{ConversationId, MessageId, Role};
use parley_shared::ChatError;
use parley_store::ConversationStore;

use crate::context::RequestContext;
use crate::fragment::{FragmentSource, FragmentStream};
use crate::pipeline::{Handler, Request, ValidationRules};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub struct CreateConversation;

impl Request for CreateConversation {
    type Response = ConversationId;
    const NAME: &'static str = "create_conversation";
}

pub struct GetConversation {
    pub conversation_id: ConversationId,
}

impl Request for GetConversation {
    type Response = ConversationWithMessages;
    const NAME: &'static str = "get_conversation";

    fn conversation_id(&self) -> Option<ConversationId> {
        Some(self.conversation_id)
    }
}

pub struct GenerateTitle {
    pub conversation_id: ConversationId,
}

impl Request for GenerateTitle {
    type Response = String;
    const NAME: &'static str = "generate_title";

    fn conversation_id(&self) -> Option<ConversationId> {
        Some(self.conversation_id)
    }
}

impl Request for SendMessageRequest {
    type Response = ExchangeStream;
    const NAME: &'static str = "send_message";

    fn validate(&self, rules: &ValidationRules) -> Vec<FieldError> {
        let mut errors = Vec::new();

        if self.content.trim().is_empty() {
            errors.push(FieldError::new("content", "must not be empty"));
        } else if self.content.chars().count() > rules.max_content_chars {
            errors.push(FieldError::new(
                "content",
                format!("must be at most {} characters", rules.max_content_chars),
            ));
        }

        if self.history.len() > rules.max_history_entries {
            errors.push(FieldError::new(
                "history",
                format!("must have at most {} entries", rules.max_history_entries),
            ));
        }
        for (i, entry) in self.history.iter().enumerate() {
            if entry.content.trim().is_empty() {
                errors.push(FieldError::new(
                    format!("history[{i}].content"),
                    "must not be empty",
                ));
            }
        }

        if let (Some(parent), Some(client)) = (self.parent_message_id, self.client_message_id) {
            if parent == client {
                errors.push(FieldError::new(
                    "parentMessageId",
                    "must differ from clientMessageId",
                ));
            }
        }

        errors
    }

    fn conversation_id(&self) -> Option<ConversationId> {
        Some(self.conversation_id)
    }
}

// ---------------------------------------------------------------------------
// Exchange stream
// ---------------------------------------------------------------------------

/// What the send handler yields to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeItem {
    Fragment(String),
    /// Both messages are stored; carries their canonical identity.
    Finished(DonePayload),
}

/// Ends with `Finished` or an `Err`; nothing follows either.
pub type ExchangeStream = BoxStream<'static, Result<ExchangeItem, ChatError>>;

struct Exchange {
    fragments: FragmentStream,
    store: Arc<dyn ConversationStore>,
    conversation_id: ConversationId,
    user_message_id: MessageId,
    user_sequence: u64,
    assistant_message_id: MessageId,
    reply: String,
    finished: bool,
}

impl Exchange {
    async fn next(&mut self) -> Option<Result<ExchangeItem, ChatError>> {
        if self.finished {
            return None;
        }
        match self.fragments.next().await {
            Some(Ok(text)) => {
                self.reply.push_str(&text);
                Some(Ok(ExchangeItem::Fragment(text)))
            }
            Some(Err(err)) => {
                self.finished = true;
                tracing::info!(
                    conversation_id = %self.conversation_id,
                    received_chars = self.reply.chars().count(),
                    "exchange failed mid-stream"
                );
                Some(Err(err))
            }
            None => {
                self.finished = true;
                Some(self.persist_reply().await)
            }
        }
    }

    async fn persist_reply(&mut self) -> Result<ExchangeItem, ChatError> {
        let reply = NewMessage::new(Role::Assistant, std::mem::take(&mut self.reply))
            .with_id(self.assistant_message_id)
            .with_parent(Some(self.user_message_id));
        let assistant_sequence = self
            .store
            .append_message(self.conversation_id, reply)
            .await?;

        tracing::info!(
            conversation_id = %self.conversation_id,
            assistant_sequence,
            "exchange complete"
        );

        Ok(ExchangeItem::Finished(DonePayload {
            user_message_id: Some(self.user_message_id),
            user_sequence: Some(self.user_sequence),
            assistant_message_id: Some(self.assistant_message_id),
            assistant_sequence: Some(assistant_sequence),
        }))
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Handler for every request type.
pub struct ChatService {
    store: Arc<dyn ConversationStore>,
    source: FragmentSource,
}

impl ChatService {
    pub fn new(store: Arc<dyn ConversationStore>, source: FragmentSource) -> Self {
        Self { store, source }
    }
}

#[async_trait]
impl Handler<CreateConversation> for ChatService {
    async fn handle(
        &self,
        ctx: &RequestContext,
        _req: CreateConversation,
    ) -> Result<ConversationId, ChatError> {
        let owner = ctx.user_id.ok_or(ChatError::Unauthenticated)?;
        let id = self.store.create_conversation(owner).await?;
        tracing::info!(conversation_id = %id, "conversation created");
        Ok(id)
    }
}

#[async_trait]
impl Handler<GetConversation> for ChatService {
    async fn handle(
        &self,
        _ctx: &RequestContext,
        req: GetConversation,
    ) -> Result<ConversationWithMessages, ChatError> {
        let conversation = self
            .store
            .get_conversation(req.conversation_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", req.conversation_id)))?;
        let messages = self.store.get_history(req.conversation_id).await?;
        Ok(ConversationWithMessages {
            conversation,
            messages,
        })
    }
}

#[async_trait]
impl Handler<GenerateTitle> for ChatService {
    async fn handle(&self, _ctx: &RequestContext, req: GenerateTitle) -> Result<String, ChatError> {
        let history = self.store.get_history(req.conversation_id).await?;
        if history.is_empty() {
            return Err(ChatError::Validation(vec![FieldError::new(
                "conversationId",
                "conversation has no messages",
            )]));
        }

        let title = self.source.summarize_title(&history).await?;
        self.store.set_title(req.conversation_id, &title).await?;
        tracing::info!(conversation_id = %req.conversation_id, %title, "title generated");
        Ok(title)
    }
}

#[async_trait]
impl Handler<SendMessageRequest> for ChatService {
    async fn handle(
        &self,
        _ctx: &RequestContext,
        req: SendMessageRequest,
    ) -> Result<ExchangeStream, ChatError> {
        let user_message = NewMessage::new(Role::User, req.content.clone())
            .with_id(req.client_message_id.unwrap_or_default())
            .with_parent(req.parent_message_id);
        let user_message_id = user_message.id;

        // Stored under the client's id, so a resubmission is a no-op here.
        let user_sequence = self
            .store
            .append_message(req.conversation_id, user_message)
            .await?;
        tracing::debug!(
            conversation_id = %req.conversation_id,
            message_id = %user_message_id,
            user_sequence,
            backend = self.source.backend_name(),
            "user message stored, opening fragment source"
        );

        let fragments = self.source.open(&req.history, &req.content).await?;

        let exchange = Exchange {
            fragments,
            store: self.store.clone(),
            conversation_id: req.conversation_id,
            user_message_id,
            user_sequence,
            assistant_message_id: MessageId::new(),
            reply: String::new(),
            finished: false,
        };
        Ok(stream::unfold(exchange, |mut exchange| async move {
            exchange.next().await.map(|item| (item, exchange))
        })
        .boxed())
    }
}
