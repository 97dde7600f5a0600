//! The fragment source: one exchange's worth of generated text.
//!
//! [`FragmentSource::open`] waits for the first non-empty fragment before it
//! returns, so a call that fails up front is an `Err` rather than an empty
//! stream. Once open, every fragment received is yielded; a later failure
//! or idle timeout is yielded as the final item.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::StreamExt;

use parley_shared::constants::MAX_TITLE_CHARS;
use parley_shared::models::Message;
use parley_shared::protocol::HistoryEntry;
use parley_shared::types::Role;
use parley_shared::ChatError;

use crate::backend::{BackendError, GenerationBackend, TextStream};

/// Non-empty fragments. An `Err` item is always the last one.
pub type FragmentStream = BoxStream<'static, Result<String, ChatError>>;

const TITLE_INSTRUCTION: &str = "Write a short title (at most six words) for the conversation \
above. Reply with the title only, without quotes.";

#[derive(Clone)]
pub struct FragmentSource {
    backend: Arc<dyn GenerationBackend>,
    idle_timeout: Duration,
}

impl FragmentSource {
    pub fn new(backend: Arc<dyn GenerationBackend>, idle_timeout: Duration) -> Self {
        Self {
            backend,
            idle_timeout,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub async fn open(
        &self,
        history: &[HistoryEntry],
        content: &str,
    ) -> Result<FragmentStream, ChatError> {
        // The idle window also covers the wait for the upstream to respond.
        let upstream =
            match tokio::time::timeout(self.idle_timeout, self.backend.generate(history, content))
                .await
            {
                Ok(result) => result.map_err(upstream_error)?,
                Err(_) => {
                    tracing::warn!(
                        idle_secs = self.idle_timeout.as_secs(),
                        "generation backend did not respond"
                    );
                    return Err(ChatError::upstream_timeout(self.idle_timeout.as_secs()));
                }
            };

        let mut relay = Relay {
            upstream,
            idle_timeout: self.idle_timeout,
            finished: false,
        };

        let first = match relay.next().await {
            Some(Ok(text)) => text,
            Some(Err(err)) => return Err(err),
            None => return Ok(stream::empty().boxed()),
        };

        let rest = stream::unfold(relay, |mut relay| async move {
            relay.next().await.map(|item| (item, relay))
        });
        Ok(stream::once(async move { Ok(first) }).chain(rest).boxed())
    }

    /// A short plain-text title for `messages`.
    pub async fn summarize_title(&self, messages: &[Message]) -> Result<String, ChatError> {
        let history: Vec<HistoryEntry> = messages
            .iter()
            .map(|m| HistoryEntry {
                id: Some(m.id),
                content: m.content.clone(),
                author: m.author,
                created_at: Some(m.created_at),
            })
            .collect();

        let raw = self
            .backend
            .complete(&history, TITLE_INSTRUCTION)
            .await
            .map_err(upstream_error)?;

        Ok(clean_title(&raw).unwrap_or_else(|| fallback_title(messages)))
    }
}

struct Relay {
    upstream: TextStream,
    idle_timeout: Duration,
    finished: bool,
}

impl Relay {
    async fn next(&mut self) -> Option<Result<String, ChatError>> {
        if self.finished {
            return None;
        }
        loop {
            match tokio::time::timeout(self.idle_timeout, self.upstream.next()).await {
                Err(_) => {
                    self.finished = true;
                    tracing::warn!(
                        idle_secs = self.idle_timeout.as_secs(),
                        "generation backend went idle"
                    );
                    return Some(Err(ChatError::upstream_timeout(self.idle_timeout.as_secs())));
                }
                Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Ok(Some(Err(e))) => {
                    self.finished = true;
                    return Some(Err(upstream_error(e)));
                }
                Ok(Some(Ok(text))) if text.is_empty() => continue,
                Ok(Some(Ok(text))) => return Some(Ok(text)),
            }
        }
    }
}

fn upstream_error(err: BackendError) -> ChatError {
    tracing::warn!(error = %err, "generation backend failed");
    match err {
        BackendError::Config(message) => ChatError::Internal(message),
        other => ChatError::upstream(other.to_string()),
    }
}

/// One line, no surrounding quotes, at most [`MAX_TITLE_CHARS`].
fn clean_title(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line
        .trim_start_matches(|c| matches!(c, '"' | '\'' | '“' | '”' | '`'))
        .trim_end_matches(|c| matches!(c, '"' | '\'' | '“' | '”' | '`' | '.'))
        .trim();
    let title = truncate_chars(&collapse_whitespace(line), MAX_TITLE_CHARS);
    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}

fn fallback_title(messages: &[Message]) -> String {
    messages
        .iter()
        .find(|m| m.author == Role::User)
        .map(|m| truncate_chars(&collapse_whitespace(&m.content), MAX_TITLE_CHARS))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "New conversation".to_string())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect::<String>().trim_end().to_string()
}
