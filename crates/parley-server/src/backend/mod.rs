//! Generation backends: the upstream side of the fragment source.

mod echo;
mod openai;
mod scripted;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use parley_shared::protocol::HistoryEntry;

use crate::config::{BackendKind, ServerConfig};

pub use echo::EchoBackend;
pub use openai::OpenAiCompatBackend;
pub use scripted::{ScriptedBackend, Step};

/// Raw text chunks as the backend produces them. May contain empty chunks.
pub type TextStream = BoxStream<'static, Result<String, BackendError>>;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The upstream reported an error inside an otherwise valid response.
    #[error("Upstream error: {0}")]
    Api(String),

    #[error("Malformed upstream response: {0}")]
    Decode(String),

    #[error("Backend misconfigured: {0}")]
    Config(String),
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Start generating a reply to `content` given the prior `history`.
    ///
    /// Dropping the returned stream aborts the upstream call.
    async fn generate(
        &self,
        history: &[HistoryEntry],
        content: &str,
    ) -> Result<TextStream, BackendError>;

    /// One-shot, non-streaming completion of `instruction` over `history`.
    async fn complete(
        &self,
        history: &[HistoryEntry],
        instruction: &str,
    ) -> Result<String, BackendError>;

    fn name(&self) -> &str;
}

/// Build the backend selected by `GENERATION_BACKEND`.
pub fn from_config(config: &ServerConfig) -> Result<Arc<dyn GenerationBackend>, BackendError> {
    match config.backend {
        BackendKind::Echo => Ok(Arc::new(EchoBackend::new(config.echo_delay))),
        BackendKind::OpenAi => Ok(Arc::new(OpenAiCompatBackend::new(
            &config.llm_api_base,
            config.llm_api_key.clone(),
            &config.llm_model,
        )?)),
    }
}
