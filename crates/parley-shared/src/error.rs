use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::codes;
use crate::protocol::FieldError;

/// Wire-visible classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Validation,
    Unauthorized,
    NotFound,
    UpstreamFailure,
    Internal,
}

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Validation failed: {}", join_fields(.0))]
    Validation(Vec<FieldError>),

    /// No identity attached to the request.
    #[error("Unauthenticated")]
    Unauthenticated,

    /// Identity present but it does not own the target.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream failure ({code}): {message}")]
    Upstream { code: String, message: String },

    /// Any unexpected fault. The text is logged, never sent to clients.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChatError {
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            code: codes::UPSTREAM_FAILURE.to_string(),
            message: message.into(),
        }
    }

    pub fn upstream_timeout(secs: u64) -> Self {
        Self::Upstream {
            code: codes::UPSTREAM_TIMEOUT.to_string(),
            message: format!("no output from the generation backend for {secs}s"),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Unauthenticated | Self::Forbidden(_) => ErrorKind::Unauthorized,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Upstream { .. } => ErrorKind::UpstreamFailure,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Code and message to put in a terminal `error` stream event.
    /// Internal causes are replaced by a generic message.
    pub fn stream_payload(&self) -> (String, String) {
        match self {
            Self::Upstream { code, message } => (code.clone(), message.clone()),
            Self::Internal(_) => (codes::INTERNAL.to_string(), "internal error".to_string()),
            other => (codes::INTERNAL.to_string(), other.to_string()),
        }
    }
}

fn join_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display_lists_fields() {
        let err = ChatError::Validation(vec![
            FieldError::new("content", "must not be empty"),
            FieldError::new("history[0].content", "must not be empty"),
        ]);
        assert_eq!(
            err.to_string(),
            "Validation failed: content: must not be empty; history[0].content: must not be empty"
        );
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_internal_payload_is_sanitized() {
        let err = ChatError::Internal("db password=hunter2 rejected".into());
        let (code, message) = err.stream_payload();
        assert_eq!(code, codes::INTERNAL);
        assert!(!message.contains("hunter2"));
    }
}
