//! Server-Sent Events framing of an exchange.
//!
//! A producer task drives the [`ExchangeStream`] and pushes numbered
//! [`StreamEvent`]s into a small bounded channel that backs the response
//! body. Every frame is written as
//!
//! ```text
//! event: data
//! id: 0
//! data: {"type":"data","sequence":0,"payload":{"content":"Sum"}}
//! ```
//!
//! The stream always ends with exactly one `done` or `error` event. When the
//! client goes away the producer drops the exchange, which drops the
//! upstream generation call with it.

use std::panic::AssertUnwindSafe;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{stream, FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;
use uuid::Uuid;

use parley_shared::constants::{codes, CORRELATION_HEADER, STREAM_CHANNEL_CAPACITY};
use parley_shared::protocol::StreamEvent;
use parley_shared::ChatError;

use crate::chat::{ExchangeItem, ExchangeStream};
use crate::pipeline::panic_message;

/// Stream `exchange` as an SSE response.
pub fn sse_response(
    exchange: ExchangeStream,
    correlation_id: Uuid,
    span: tracing::Span,
) -> Response {
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(pump(exchange, tx).instrument(span));

    let events = ReceiverStream::new(rx).map(|event| encode(&event));
    (
        [(CORRELATION_HEADER, correlation_id.to_string())],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

/// An SSE response holding a single `error` event at sequence 0.
pub fn failed_response(err: ChatError, correlation_id: Uuid, span: tracing::Span) -> Response {
    sse_response(stream::iter([Err(err)]).boxed(), correlation_id, span)
}

pub fn encode(event: &StreamEvent) -> Result<Event, axum::Error> {
    Event::default()
        .event(event.kind().as_str())
        .id(event.sequence().to_string())
        .json_data(event)
}

/// Drive `exchange` to its terminal event, numbering events from 0.
pub async fn pump(mut exchange: ExchangeStream, tx: mpsc::Sender<StreamEvent>) {
    let mut sequence = 0u64;
    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                tracing::info!(sent = sequence, "client disconnected, cancelling generation");
                return;
            }
            next = AssertUnwindSafe(exchange.next()).catch_unwind() => next,
        };

        let event = match next {
            Ok(Some(Ok(ExchangeItem::Fragment(text)))) => StreamEvent::data(sequence, text),
            Ok(Some(Ok(ExchangeItem::Finished(ids)))) => StreamEvent::done(sequence, ids),
            Ok(Some(Err(err))) => {
                if let ChatError::Internal(cause) = &err {
                    tracing::error!(%cause, "exchange failed");
                }
                let (code, message) = err.stream_payload();
                StreamEvent::error(sequence, code, message)
            }
            Ok(None) => {
                tracing::error!("exchange ended without a terminal item");
                StreamEvent::error(sequence, codes::INTERNAL, "internal error")
            }
            Err(panic) => {
                tracing::error!(cause = %panic_message(&*panic), "exchange panicked");
                StreamEvent::error(sequence, codes::INTERNAL, "internal error")
            }
        };

        let terminal = event.is_terminal();
        if tx.send(event).await.is_err() {
            tracing::info!(sent = sequence, "client disconnected, cancelling generation");
            return;
        }
        if terminal {
            tracing::debug!(events = sequence + 1, "exchange stream closed");
            return;
        }
        sequence += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use futures::stream::BoxStream;

    use crate::backend::{ScriptedBackend, Step};
    use crate::fragment::FragmentSource;

    async fn drain(exchange: ExchangeStream) -> Vec<StreamEvent> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        pump(exchange, tx).await;
        ReceiverStream::new(rx).collect().await
    }

    fn items(items: Vec<Result<ExchangeItem, ChatError>>) -> ExchangeStream {
        stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn test_sequences_and_terminal_done() {
        let events = drain(items(vec![
            Ok(ExchangeItem::Fragment("Sum".into())),
            Ok(ExchangeItem::Fragment("mary".into())),
            Ok(ExchangeItem::Finished(Default::default())),
            Ok(ExchangeItem::Fragment("after done".into())),
        ]))
        .await;

        let sequences: Vec<u64> = events.iter().map(StreamEvent::sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert!(events[2].is_terminal());
    }

    #[tokio::test]
    async fn test_error_event_after_fragments() {
        let events = drain(items(vec![
            Ok(ExchangeItem::Fragment("a".into())),
            Ok(ExchangeItem::Fragment("b".into())),
            Ok(ExchangeItem::Fragment("c".into())),
            Err(ChatError::upstream("connection reset")),
        ]))
        .await;

        assert_eq!(events.len(), 4);
        assert_eq!(
            events[3],
            StreamEvent::error(3, codes::UPSTREAM_FAILURE, "connection reset")
        );
    }

    #[tokio::test]
    async fn test_truncated_exchange_gets_error_event() {
        let events = drain(items(vec![Ok(ExchangeItem::Fragment("a".into()))])).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], StreamEvent::error(1, codes::INTERNAL, "internal error"));
    }

    #[tokio::test]
    async fn test_internal_cause_is_sanitized() {
        let events = drain(items(vec![Err(ChatError::Internal("disk /var/x full".into()))])).await;
        let StreamEvent::Error { payload, .. } = &events[0] else {
            panic!("expected error event");
        };
        assert_eq!(payload.message, "internal error");
    }

    #[tokio::test]
    async fn test_panic_becomes_error_event() {
        let source = FragmentSource::new(
            Arc::new(ScriptedBackend::new(vec![
                Step::Fragment("Sum".into()),
                Step::Panic("backend bug".into()),
            ])),
            Duration::from_secs(5),
        );
        let fragments = source.open(&[], "hi").await.unwrap();
        let exchange: BoxStream<'static, Result<ExchangeItem, ChatError>> =
            fragments.map(|f| f.map(ExchangeItem::Fragment)).boxed();

        let events = drain(exchange).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], StreamEvent::error(1, codes::INTERNAL, "internal error"));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_upstream() {
        let backend = ScriptedBackend::fragments(["a"; 64]).with_delay(Duration::from_millis(10));
        let source = FragmentSource::new(Arc::new(backend.clone()), Duration::from_secs(5));
        let fragments = source.open(&[], "hi").await.unwrap();
        let exchange = fragments.map(|f| f.map(ExchangeItem::Fragment)).boxed();

        let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let producer = tokio::spawn(pump(exchange, tx));

        assert!(rx.recv().await.is_some());
        drop(rx);

        tokio::time::timeout(Duration::from_secs(2), producer)
            .await
            .expect("producer should stop after disconnect")
            .unwrap();
        assert!(backend.stream_dropped());
    }
}
