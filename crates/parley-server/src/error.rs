use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use uuid::Uuid;

use parley_shared::constants::CORRELATION_HEADER;
use parley_shared::protocol::ApiError;
use parley_shared::{ChatError, ErrorKind};

#[derive(Debug, Error)]
pub enum ServerError {
    /// The body or path could not be parsed at all.
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Chat(#[from] ChatError),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Chat(err) => match err {
                ChatError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
                ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
                ChatError::NotFound(_) => StatusCode::NOT_FOUND,
                ChatError::Upstream { .. } => StatusCode::BAD_GATEWAY,
                ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Attach the request's correlation id to the response.
    pub fn correlated(self, correlation_id: Uuid) -> CorrelatedError {
        CorrelatedError {
            error: self,
            correlation_id,
        }
    }

    fn body(&self, correlation_id: Option<Uuid>) -> ApiError {
        let (kind, message, errors) = match self {
            ServerError::BadRequest(_) => (ErrorKind::Validation, self.to_string(), Vec::new()),
            ServerError::Chat(ChatError::Validation(fields)) => (
                ErrorKind::Validation,
                "validation failed".to_string(),
                fields.clone(),
            ),
            ServerError::Chat(ChatError::Internal(_)) => {
                (ErrorKind::Internal, "internal error".to_string(), Vec::new())
            }
            ServerError::Chat(err) => (err.kind(), err.to_string(), Vec::new()),
        };
        ApiError {
            kind,
            message,
            errors,
            correlation_id,
        }
    }

    fn render(&self, correlation_id: Option<Uuid>) -> Response {
        if let ServerError::Chat(ChatError::Internal(cause)) = self {
            tracing::error!(?correlation_id, %cause, "internal error");
        }
        let status = self.status();
        let body = axum::Json(self.body(correlation_id));
        match correlation_id {
            Some(id) => (status, [(CORRELATION_HEADER, id.to_string())], body).into_response(),
            None => (status, body).into_response(),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        self.render(None)
    }
}

/// A [`ServerError`] tagged with the request's correlation id.
#[derive(Debug)]
pub struct CorrelatedError {
    pub error: ServerError,
    pub correlation_id: Uuid,
}

impl IntoResponse for CorrelatedError {
    fn into_response(self) -> Response {
        self.error.render(Some(self.correlation_id))
    }
}
