use thiserror::Error;

use parley_shared::protocol::ApiError;

use crate::reconciler::ReconcileError;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-2xx status.
    #[error("Server rejected the request ({status}): {}", .error.message)]
    Rejected { status: u16, error: ApiError },

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}
