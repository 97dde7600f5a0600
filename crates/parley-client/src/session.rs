//! A chat session: sends messages, streams the replies into the
//! [`Reconciler`] and retries connections that failed before any content.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use parley_shared::protocol::{ApiError, StreamEvent};
use parley_shared::types::ConversationId;

use crate::api::ApiClient;
use crate::config::ClientConfig;
use crate::consumer::{ConsumeError, StreamConsumer};
use crate::error::ClientError;
use crate::events::TranscriptEvent;
use crate::reconciler::{
    ExchangeRef, FailureKind, OutgoingExchange, Phase, ReconcileError, Reconciler, TranscriptEntry,
};
use crate::retry::RetryPolicy;

/// How an exchange ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Finalized {
        assistant: TranscriptEntry,
    },
    /// `partial` holds whatever was streamed before the failure.
    Failed {
        failure: FailureKind,
        partial: String,
    },
}

pub struct ChatSession {
    api: ApiClient,
    consumer: StreamConsumer,
    /// Locked only for synchronous updates, never across an `.await`.
    reconciler: Arc<Mutex<Reconciler>>,
    retry_policy: RetryPolicy,
}

impl ChatSession {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let api = ApiClient::new(config)?;
        Ok(Self {
            consumer: StreamConsumer::new(api.clone(), config.idle_timeout),
            api,
            reconciler: Arc::new(Mutex::new(Reconciler::new())),
            retry_policy: config.retry,
        })
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    fn lock(&self) -> MutexGuard<'_, Reconciler> {
        self.reconciler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TranscriptEvent> {
        self.lock().subscribe()
    }

    pub fn entries(&self, conversation_id: ConversationId) -> Vec<TranscriptEntry> {
        self.lock()
            .entries(conversation_id)
            .map(<[TranscriptEntry]>::to_vec)
            .unwrap_or_default()
    }

    pub fn phase(&self, conversation_id: ConversationId) -> Option<Phase> {
        self.lock().phase(conversation_id).cloned()
    }

    pub fn title(&self, conversation_id: ConversationId) -> Option<String> {
        self.lock().title(conversation_id).map(str::to_string)
    }

    /// Create a conversation on the server and start tracking it.
    pub async fn start_conversation(&self) -> Result<ConversationId, ClientError> {
        let id = self.api.create_conversation().await?;
        self.lock().open_empty(id)?;
        tracing::info!(conversation_id = %id, "Conversation created");
        Ok(id)
    }

    /// Load an existing conversation from the server.
    pub async fn load_conversation(&self, id: ConversationId) -> Result<(), ClientError> {
        let conversation = self.api.get_conversation(id).await?;
        self.lock().open(&conversation)?;
        tracing::info!(
            conversation_id = %id,
            messages = conversation.messages.len(),
            "Conversation loaded"
        );
        Ok(())
    }

    /// Submit `content` and stream the reply to completion.
    pub async fn send(
        &self,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<ExchangeOutcome, ClientError> {
        let outgoing = self.lock().submit(conversation_id, content)?;
        self.run_exchange(outgoing).await
    }

    /// Send the last failed exchange of the conversation again.
    pub async fn retry(
        &self,
        conversation_id: ConversationId,
    ) -> Result<ExchangeOutcome, ClientError> {
        let outgoing = self.lock().retry(conversation_id)?;
        self.run_exchange(outgoing).await
    }

    async fn run_exchange(
        &self,
        outgoing: OutgoingExchange,
    ) -> Result<ExchangeOutcome, ClientError> {
        let conversation_id = outgoing.request.conversation_id;
        // One id for every attempt of this exchange.
        let correlation_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "exchange",
            %correlation_id,
            %conversation_id,
            retry = outgoing.is_retry
        );

        self.drive(outgoing, correlation_id).instrument(span).await
    }

    /// Stream one exchange, reconnecting while nothing has been applied.
    async fn drive(
        &self,
        outgoing: OutgoingExchange,
        correlation_id: Uuid,
    ) -> Result<ExchangeOutcome, ClientError> {
        let conversation_id = outgoing.request.conversation_id;
        let mut attempt = 1u32;
        let failure = loop {
            let result = self
                .consumer
                .consume(&outgoing.request, correlation_id, |event| {
                    self.lock().apply(conversation_id, event)
                })
                .await;

            match result {
                Ok(terminal) => {
                    if let StreamEvent::Error { payload, .. } = &terminal {
                        tracing::warn!(
                            code = %payload.code,
                            message = %payload.message,
                            "Exchange failed upstream"
                        );
                    }
                    break None;
                }
                Err(e) if e.is_transient() && self.retry_policy.allows_retry(attempt) => {
                    let delay = self.retry_policy.delay(attempt);
                    tracing::warn!(
                        attempt,
                        ?delay,
                        error = %e,
                        "Stream failed before any content, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    break Some(FailureKind::RetriesExhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    })
                }
                Err(ConsumeError::Rejected { status, error }) => {
                    tracing::warn!(status, kind = ?error.kind, "Exchange rejected");
                    break Some(FailureKind::Rejected {
                        kind: error.kind,
                        message: describe(&error),
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Exchange stream failed");
                    break Some(FailureKind::Transport(e.to_string()));
                }
            }
        };

        if let Some(failure) = failure {
            self.lock().fail(conversation_id, failure)?;
        }
        let outcome = self.outcome(conversation_id, outgoing.exchange)?;

        if matches!(outcome, ExchangeOutcome::Finalized { .. }) {
            self.request_title(conversation_id).await;
        }
        Ok(outcome)
    }

    fn outcome(
        &self,
        conversation_id: ConversationId,
        exchange: ExchangeRef,
    ) -> Result<ExchangeOutcome, ClientError> {
        let reconciler = self.lock();
        let assistant = reconciler
            .entries(conversation_id)
            .and_then(|entries| entries.iter().find(|e| e.client_id == exchange.assistant))
            .cloned()
            .ok_or(ReconcileError::NoActiveExchange(conversation_id))?;

        match reconciler.phase(conversation_id) {
            Some(Phase::Finalized(_)) => Ok(ExchangeOutcome::Finalized { assistant }),
            Some(Phase::Failed { failure, .. }) => Ok(ExchangeOutcome::Failed {
                failure: failure.clone(),
                partial: assistant.content,
            }),
            _ => Err(ReconcileError::NoActiveExchange(conversation_id).into()),
        }
    }

    /// Ask the server for a title after the first finalized exchange of an
    /// untitled conversation. Failures only cost the title.
    async fn request_title(&self, conversation_id: ConversationId) {
        let wanted = self.lock().take_title_request(conversation_id);
        if !wanted {
            return;
        }
        match self.api.generate_title(conversation_id).await {
            Ok(title) => {
                tracing::info!(%title, "Conversation titled");
                if let Err(e) = self.lock().set_title(conversation_id, title) {
                    tracing::warn!(error = %e, "Could not store title");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Title generation failed"),
        }
    }
}

fn describe(error: &ApiError) -> String {
    if error.errors.is_empty() {
        return error.message.clone();
    }
    let fields: Vec<String> = error
        .errors
        .iter()
        .map(|f| format!("{}: {}", f.field, f.message))
        .collect();
    format!("{} ({})", error.message, fields.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::protocol::FieldError;
    use parley_shared::ErrorKind;

    #[test]
    fn test_describe_lists_fields() {
        let error = ApiError {
            kind: ErrorKind::Validation,
            message: "validation failed".into(),
            errors: vec![FieldError::new("content", "must not be empty")],
            correlation_id: None,
        };
        assert_eq!(describe(&error), "validation failed (content: must not be empty)");
    }
}
