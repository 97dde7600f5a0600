use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};

use parley_shared::protocol::HistoryEntry;
use parley_shared::types::Role;

use super::{BackendError, GenerationBackend, TextStream};

/// Streams the user's words back, one per tick. Needs no network.
pub struct EchoBackend {
    delay: Duration,
}

impl EchoBackend {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl GenerationBackend for EchoBackend {
    async fn generate(
        &self,
        _history: &[HistoryEntry],
        content: &str,
    ) -> Result<TextStream, BackendError> {
        let words: Vec<String> = content.split_inclusive(' ').map(String::from).collect();
        let delay = self.delay;
        Ok(stream::iter(words)
            .then(move |word| async move {
                tokio::time::sleep(delay).await;
                Ok(word)
            })
            .boxed())
    }

    async fn complete(
        &self,
        history: &[HistoryEntry],
        _instruction: &str,
    ) -> Result<String, BackendError> {
        Ok(history
            .iter()
            .find(|entry| entry.author == Role::User)
            .map(|entry| entry.content.clone())
            .unwrap_or_default())
    }

    fn name(&self) -> &str {
        "echo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_echo_streams_words() {
        let backend = EchoBackend::new(Duration::ZERO);
        let words: Vec<String> = backend
            .generate(&[], "Summarize this doc")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(words, vec!["Summarize ", "this ", "doc"]);
    }

    #[tokio::test]
    async fn test_echo_complete_uses_first_user_message() {
        let backend = EchoBackend::new(Duration::ZERO);
        let history = vec![
            HistoryEntry::new(Role::System, "be brief"),
            HistoryEntry::new(Role::User, "Trip to Lisbon"),
        ];
        assert_eq!(
            backend.complete(&history, "title").await.unwrap(),
            "Trip to Lisbon"
        );
    }
}
