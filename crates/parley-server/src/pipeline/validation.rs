use std::sync::Arc;

use async_trait::async_trait;

use parley_shared::constants::{DEFAULT_MAX_CONTENT_CHARS, DEFAULT_MAX_HISTORY_ENTRIES};
use parley_shared::ChatError;

use super::{Next, Request, Stage};
use crate::config::ServerConfig;
use crate::context::RequestContext;
use crate::identity::IdentityProvider;

/// Limits the field rules check against.
#[derive(Debug, Clone, Copy)]
pub struct ValidationRules {
    pub max_content_chars: usize,
    pub max_history_entries: usize,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
            max_history_entries: DEFAULT_MAX_HISTORY_ENTRIES,
        }
    }
}

impl From<&ServerConfig> for ValidationRules {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_content_chars: config.max_content_chars,
            max_history_entries: config.max_history_entries,
        }
    }
}

/// Identity, field rules, then ownership. Any failure short-circuits
/// before the handler runs.
pub struct ValidationStage {
    identity: Arc<dyn IdentityProvider>,
    rules: ValidationRules,
}

impl ValidationStage {
    pub fn new(identity: Arc<dyn IdentityProvider>, rules: ValidationRules) -> Self {
        Self { identity, rules }
    }
}

#[async_trait]
impl<R: Request> Stage<R> for ValidationStage {
    async fn call(
        &self,
        ctx: &RequestContext,
        req: R,
        next: Next<'_, R>,
    ) -> Result<R::Response, ChatError> {
        let user = ctx.user_id.ok_or(ChatError::Unauthenticated)?;

        let errors = req.validate(&self.rules);
        if !errors.is_empty() {
            tracing::debug!(
                correlation_id = %ctx.correlation_id,
                request = R::NAME,
                failures = errors.len(),
                "validation failed"
            );
            return Err(ChatError::Validation(errors));
        }

        if let Some(conversation) = req.conversation_id() {
            if !self.identity.owns_conversation(user, conversation).await? {
                tracing::info!(
                    correlation_id = %ctx.correlation_id,
                    conversation_id = %conversation,
                    "caller does not own conversation"
                );
                return Err(ChatError::Forbidden(format!(
                    "conversation {conversation} is not accessible"
                )));
            }
        }

        next.run(ctx, req).await
    }
}
