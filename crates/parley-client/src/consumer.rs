//! Reads one exchange stream from `POST /chat/stream`.
//!
//! Events are decoded in arrival order and handed to a callback one at a
//! time; the next chunk is not read until the callback has returned. The
//! read loop stops at the first terminal event.

use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use parley_shared::protocol::{ApiError, SendMessageRequest, StreamEvent};
use parley_shared::sse::{SseDecoder, SseFrame};

use crate::api::{self, ApiClient};
use crate::reconciler::ReconcileError;

#[derive(Error, Debug)]
pub enum ConsumeError {
    /// The request never got a response.
    #[error("Could not reach the server: {0}")]
    Connect(#[source] reqwest::Error),

    #[error("Server rejected the request ({status}): {}", .error.message)]
    Rejected { status: u16, error: ApiError },

    /// The connection closed before a terminal event.
    #[error("Stream ended after {events} events without a terminal event")]
    Incomplete { events: usize, bytes: usize },

    #[error("No event for {}s after {events} events", .after.as_secs())]
    Idle { events: usize, after: Duration },

    #[error("Malformed stream: {0}")]
    Protocol(String),

    #[error(transparent)]
    Apply(#[from] ReconcileError),
}

impl ConsumeError {
    /// Failures that happened before any event reached the callback. These
    /// are safe to retry because nothing was applied.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConsumeError::Connect(_) | ConsumeError::Incomplete { events: 0, .. }
        )
    }
}

/// Turns response body chunks into checked [`StreamEvent`]s.
#[derive(Debug, Default)]
pub struct EventReader {
    decoder: SseDecoder,
    last_sequence: Option<u64>,
    events: usize,
    bytes: usize,
    finished: bool,
}

impl EventReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events decoded so far.
    pub fn events(&self) -> usize {
        self.events
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// `true` once a terminal event was returned. Later input is ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>, ConsumeError> {
        if self.finished {
            return Ok(Vec::new());
        }
        self.bytes += chunk.len();
        let frames = self
            .decoder
            .push(chunk)
            .map_err(|e| ConsumeError::Protocol(e.to_string()))?;

        let mut events = Vec::with_capacity(frames.len());
        for frame in frames {
            let event = self.check(frame)?;
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                self.finished = true;
                break;
            }
        }
        Ok(events)
    }

    fn check(&mut self, frame: SseFrame) -> Result<StreamEvent, ConsumeError> {
        let event: StreamEvent = serde_json::from_str(&frame.data)
            .map_err(|e| ConsumeError::Protocol(format!("undecodable event: {e}")))?;

        if let Some(name) = frame.event.as_deref() {
            if name != event.kind().as_str() {
                return Err(ConsumeError::Protocol(format!(
                    "event tag `{name}` does not match payload type `{}`",
                    event.kind().as_str()
                )));
            }
        }
        if let Some(last) = self.last_sequence {
            if event.sequence() < last {
                return Err(ConsumeError::Protocol(format!(
                    "sequence {} arrived after {last}",
                    event.sequence()
                )));
            }
        }
        self.last_sequence = Some(event.sequence());
        self.events += 1;
        Ok(event)
    }

    fn incomplete(&self) -> ConsumeError {
        ConsumeError::Incomplete {
            events: self.events,
            bytes: self.bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConsumer {
    api: ApiClient,
    idle_timeout: Duration,
}

impl StreamConsumer {
    pub fn new(api: ApiClient, idle_timeout: Duration) -> Self {
        Self { api, idle_timeout }
    }

    /// Send `request` and feed every event to `on_event` until the terminal
    /// one, which is also returned. `on_event` failing ends the read loop.
    pub async fn consume<F>(
        &self,
        request: &SendMessageRequest,
        correlation_id: Uuid,
        mut on_event: F,
    ) -> Result<StreamEvent, ConsumeError>
    where
        F: FnMut(&StreamEvent) -> Result<(), ReconcileError>,
    {
        // The server answers with headers only once the first event exists,
        // so the idle window starts before the response does.
        let response = tokio::time::timeout(
            self.idle_timeout,
            self.api.open_stream(request, correlation_id),
        )
        .await
        .map_err(|_| ConsumeError::Idle {
            events: 0,
            after: self.idle_timeout,
        })?
        .map_err(ConsumeError::Connect)?;

        if !response.status().is_success() {
            let (status, error) = api::rejection(response).await;
            return Err(ConsumeError::Rejected { status, error });
        }

        let mut body = Box::pin(response.bytes_stream());
        let mut reader = EventReader::new();
        // Keep-alive comments do not count as activity.
        let mut deadline = Instant::now() + self.idle_timeout;

        loop {
            let chunk = match tokio::time::timeout_at(deadline, body.next()).await {
                Err(_) => {
                    return Err(ConsumeError::Idle {
                        events: reader.events(),
                        after: self.idle_timeout,
                    })
                }
                Ok(None) => return Err(reader.incomplete()),
                Ok(Some(Err(e))) => {
                    tracing::warn!(error = %e, events = reader.events(), "Stream read failed");
                    return Err(reader.incomplete());
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            let events = reader.feed(&chunk)?;
            if !events.is_empty() {
                deadline = Instant::now() + self.idle_timeout;
            }
            for event in events {
                on_event(&event)?;
                if event.is_terminal() {
                    tracing::debug!(events = reader.events(), "Stream finished");
                    return Ok(event);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::protocol::DonePayload;

    fn frame(event: &StreamEvent) -> String {
        format!(
            "event: {}\nid: {}\ndata: {}\n\n",
            event.kind().as_str(),
            event.sequence(),
            serde_json::to_string(event).unwrap()
        )
    }

    #[test]
    fn test_reader_handles_split_frames() {
        let wire = [
            frame(&StreamEvent::data(0, "Sum")),
            frame(&StreamEvent::data(1, "mary")),
            frame(&StreamEvent::done(2, DonePayload::default())),
        ]
        .concat();
        let (head, tail) = wire.as_bytes().split_at(30);

        let mut reader = EventReader::new();
        let mut events = reader.feed(head).unwrap();
        events.extend(reader.feed(tail).unwrap());

        assert_eq!(events.len(), 3);
        assert_eq!(events[1], StreamEvent::data(1, "mary"));
        assert!(reader.is_finished());
    }

    #[test]
    fn test_reader_stops_at_terminal_event() {
        let wire = [
            frame(&StreamEvent::error(0, "upstream_failure", "boom")),
            frame(&StreamEvent::data(1, "late")),
        ]
        .concat();

        let mut reader = EventReader::new();
        let events = reader.feed(wire.as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
        assert!(reader.feed(frame(&StreamEvent::data(2, "x")).as_bytes()).unwrap().is_empty());
    }

    #[test]
    fn test_reader_rejects_decreasing_sequence() {
        let wire = [
            frame(&StreamEvent::data(3, "a")),
            frame(&StreamEvent::data(2, "b")),
        ]
        .concat();
        let mut reader = EventReader::new();
        assert!(matches!(
            reader.feed(wire.as_bytes()),
            Err(ConsumeError::Protocol(_))
        ));
    }

    #[test]
    fn test_reader_ignores_keep_alive_comments() {
        let mut reader = EventReader::new();
        assert!(reader.feed(b":\n\n").unwrap().is_empty());
        assert_eq!(reader.events(), 0);
        assert_eq!(reader.bytes(), 3);
    }

    #[test]
    fn test_reader_rejects_garbage_payload() {
        let mut reader = EventReader::new();
        assert!(matches!(
            reader.feed(b"event: data\ndata: not json\n\n"),
            Err(ConsumeError::Protocol(_))
        ));
    }

    #[test]
    fn test_transient_classification() {
        assert!(ConsumeError::Incomplete { events: 0, bytes: 0 }.is_transient());
        assert!(!ConsumeError::Incomplete { events: 1, bytes: 80 }.is_transient());
        assert!(!ConsumeError::Idle {
            events: 0,
            after: Duration::from_secs(1)
        }
        .is_transient());
        assert!(!ConsumeError::Protocol("x".into()).is_transient());
    }
}
