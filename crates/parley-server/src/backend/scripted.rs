use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};

use parley_shared::protocol::HistoryEntry;

use super::{BackendError, GenerationBackend, TextStream};

/// One step of a [`ScriptedBackend`] reply.
#[derive(Debug, Clone)]
pub enum Step {
    Fragment(String),
    /// Fail the stream with this message.
    Fail(String),
    /// Never produce anything again.
    Stall,
    Panic(String),
}

/// Replays a fixed reply, for tests and demos.
///
/// Records whether the last stream it handed out was dropped, which is how
/// cancellation of the upstream call is observed.
#[derive(Clone)]
pub struct ScriptedBackend {
    script: Vec<Step>,
    open_error: Option<String>,
    title: String,
    delay: Duration,
    dropped: Arc<AtomicBool>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script,
            open_error: None,
            title: String::new(),
            delay: Duration::ZERO,
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Reply with these fragments, then complete.
    pub fn fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            fragments
                .into_iter()
                .map(|f| Step::Fragment(f.into()))
                .collect(),
        )
    }

    /// Fail the call itself, before any fragment.
    pub fn failing(message: impl Into<String>) -> Self {
        let mut backend = Self::new(Vec::new());
        backend.open_error = Some(message.into());
        backend
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Pause before every step.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Whether the most recent stream was dropped by its consumer.
    pub fn stream_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn generate(
        &self,
        _history: &[HistoryEntry],
        _content: &str,
    ) -> Result<TextStream, BackendError> {
        if let Some(message) = &self.open_error {
            return Err(BackendError::Status {
                status: 503,
                body: message.clone(),
            });
        }

        self.dropped.store(false, Ordering::SeqCst);
        let flag = DropFlag(self.dropped.clone());
        let delay = self.delay;

        Ok(stream::iter(self.script.clone())
            .then(move |step| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                match step {
                    Step::Fragment(text) => Ok(text),
                    Step::Fail(message) => Err(BackendError::Api(message)),
                    Step::Stall => futures::future::pending().await,
                    Step::Panic(message) => panic!("{message}"),
                }
            })
            .map(move |item| {
                let _keep = &flag;
                item
            })
            .boxed())
    }

    async fn complete(
        &self,
        _history: &[HistoryEntry],
        _instruction: &str,
    ) -> Result<String, BackendError> {
        match &self.open_error {
            Some(message) => Err(BackendError::Api(message.clone())),
            None => Ok(self.title.clone()),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
