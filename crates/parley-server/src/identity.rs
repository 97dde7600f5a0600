//! Identity and authorization collaborator of the request pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use subtle::ConstantTimeEq;

use parley_shared::types::{ConversationId, UserId};
use parley_shared::ChatError;
use parley_store::ConversationStore;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The caller behind the request headers, if any.
    fn current_user_id(&self, headers: &HeaderMap) -> Option<UserId>;

    /// Unknown conversations are not owned by anyone.
    async fn owns_conversation(
        &self,
        user: UserId,
        conversation: ConversationId,
    ) -> Result<bool, ChatError>;
}

/// Bearer tokens from configuration; ownership comes from the store.
pub struct TokenIdentity {
    tokens: Vec<(String, UserId)>,
    store: Arc<dyn ConversationStore>,
}

impl TokenIdentity {
    pub fn new(tokens: Vec<(String, UserId)>, store: Arc<dyn ConversationStore>) -> Self {
        Self { tokens, store }
    }
}

#[async_trait]
impl IdentityProvider for TokenIdentity {
    fn current_user_id(&self, headers: &HeaderMap) -> Option<UserId> {
        let auth = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())?;
        let token = auth.strip_prefix("Bearer ")?.trim().as_bytes();

        // Every entry is compared so the match position does not leak.
        let mut found = None;
        for (expected, user) in &self.tokens {
            let expected = expected.as_bytes();
            if token.len() == expected.len() && token.ct_eq(expected).unwrap_u8() == 1 {
                found = Some(*user);
            }
        }
        found
    }

    async fn owns_conversation(
        &self,
        user: UserId,
        conversation: ConversationId,
    ) -> Result<bool, ChatError> {
        let owner = self
            .store
            .get_conversation(conversation)
            .await?
            .map(|c| c.owner);
        Ok(owner == Some(user))
    }
}
