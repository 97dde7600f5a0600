use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use parley_shared::constants::CORRELATION_HEADER;
use parley_shared::types::UserId;

use crate::api::AppState;

/// What every pipeline stage knows about the caller.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Echoed from `X-Correlation-Id`, or freshly generated.
    pub correlation_id: Uuid,
    pub user_id: Option<UserId>,
}

impl RequestContext {
    pub fn new(correlation_id: Uuid, user_id: Option<UserId>) -> Self {
        Self {
            correlation_id,
            user_id,
        }
    }

    /// Context for `user` with a new correlation id.
    pub fn for_user(user_id: UserId) -> Self {
        Self::new(Uuid::new_v4(), Some(user_id))
    }

    /// Span that tags every log line of the request.
    pub fn span(&self, request: &'static str) -> tracing::Span {
        tracing::info_span!(
            "request",
            request,
            correlation_id = %self.correlation_id,
            user = ?self.user_id.map(|u| u.short()),
        )
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for RequestContext {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let correlation_id = parts
            .headers
            .get(CORRELATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .unwrap_or_else(Uuid::new_v4);
        let user_id = state.identity.current_user_id(&parts.headers);
        Ok(Self::new(correlation_id, user_id))
    }
}
