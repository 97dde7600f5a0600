//! End-to-end exchanges against an in-process server.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::{stream, StreamExt};

use parley_client::reconciler::{Delivery, FailureKind};
use parley_client::retry::RetryPolicy;
use parley_client::{ChatSession, ClientConfig, ExchangeOutcome};
use parley_server::backend::{ScriptedBackend, Step};
use parley_server::{AppState, ServerConfig};
use parley_shared::constants::CORRELATION_HEADER;
use parley_shared::protocol::{CreatedConversation, DonePayload, SendMessageRequest, StreamEvent};
use parley_shared::types::{ConversationId, Role};
use parley_shared::ErrorKind;
use parley_store::{ConversationStore, MemoryStore};

async fn spawn(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    format!("http://{addr}")
}

fn client_config(server_url: String) -> ClientConfig {
    ClientConfig {
        server_url,
        idle_timeout: Duration::from_millis(500),
        retry: RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
        },
        ..ClientConfig::default()
    }
}

/// A real server backed by `backend` and a memory store.
async fn parley_server(backend: ScriptedBackend) -> (ChatSession, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(ServerConfig::default(), store.clone(), Arc::new(backend));
    let url = spawn(parley_server::build_router(state)).await;
    (ChatSession::new(&client_config(url)).unwrap(), store)
}

#[tokio::test]
async fn test_streamed_reply_is_finalized_and_titled() {
    let backend = ScriptedBackend::fragments(["Sum", "mar", "y: ..."]).with_title("Doc summary");
    let (session, store) = parley_server(backend).await;
    let conversation = session.start_conversation().await.unwrap();

    let outcome = session.send(conversation, "Summarize this doc").await.unwrap();
    let ExchangeOutcome::Finalized { assistant } = outcome else {
        panic!("expected a finalized exchange, got {outcome:?}");
    };
    assert_eq!(assistant.content, "Summary: ...");
    assert!(!assistant.is_streaming());

    let stored = store.get_history(conversation).await.unwrap();
    assert_eq!(stored.len(), 2);
    let entries = session.entries(conversation);
    assert_eq!(entries.len(), 2);
    for (entry, message) in entries.iter().zip(&stored) {
        assert_eq!(entry.id, message.id);
        assert_eq!(entry.sequence, Some(message.sequence));
        assert_eq!(entry.delivery, Delivery::Complete);
    }
    assert_eq!(stored[1].content, "Summary: ...");
    assert_eq!(session.title(conversation).as_deref(), Some("Doc summary"));
}

#[tokio::test]
async fn test_second_exchange_sends_history() {
    let (session, store) = parley_server(ScriptedBackend::fragments(["ok"])).await;
    let conversation = session.start_conversation().await.unwrap();

    session.send(conversation, "first").await.unwrap();
    session.send(conversation, "second").await.unwrap();

    let stored = store.get_history(conversation).await.unwrap();
    let authors: Vec<Role> = stored.iter().map(|m| m.author).collect();
    assert_eq!(authors, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
    assert_eq!(stored[2].parent_id, Some(stored[1].id));
}

#[tokio::test]
async fn test_upstream_error_keeps_partial_reply() {
    let backend = ScriptedBackend::new(vec![
        Step::Fragment("a".into()),
        Step::Fragment("b".into()),
        Step::Fragment("c".into()),
        Step::Fail("connection reset".into()),
    ]);
    let (session, store) = parley_server(backend).await;
    let conversation = session.start_conversation().await.unwrap();

    let outcome = session.send(conversation, "go").await.unwrap();
    let ExchangeOutcome::Failed { failure, partial } = outcome else {
        panic!("expected a failed exchange, got {outcome:?}");
    };
    assert_eq!(partial, "abc");
    assert!(matches!(failure, FailureKind::Upstream { .. }));
    assert!(failure.is_retryable());
    assert!(session.entries(conversation)[0].is_retryable());

    // Only the user message was stored.
    assert_eq!(store.get_history(conversation).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_empty_content_is_rejected() {
    let (session, store) = parley_server(ScriptedBackend::fragments(["never"])).await;
    let conversation = session.start_conversation().await.unwrap();

    let outcome = session.send(conversation, "   ").await.unwrap();
    let ExchangeOutcome::Failed { failure, .. } = outcome else {
        panic!("expected a rejected exchange, got {outcome:?}");
    };
    assert!(matches!(
        failure,
        FailureKind::Rejected { kind: ErrorKind::Validation, .. }
    ));
    assert!(!failure.is_retryable());
    assert!(store.get_history(conversation).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_token_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(
        ServerConfig::default(),
        store,
        Arc::new(ScriptedBackend::fragments(["x"])),
    );
    let url = spawn(parley_server::build_router(state)).await;
    let config = ClientConfig {
        token: Some("wrong".into()),
        ..client_config(url)
    };
    let session = ChatSession::new(&config).unwrap();

    let err = session.start_conversation().await.unwrap_err();
    assert!(matches!(
        err,
        parley_client::ClientError::Rejected { status: 401, .. }
    ));
}

// ---------------------------------------------------------------------------
// Scripted transport: each request to /chat/stream gets the next reply
// ---------------------------------------------------------------------------

enum Reply {
    /// Send these chunks, then close the body.
    Close(Vec<String>),
    /// Send these chunks, then stay open without sending anything.
    Stall(Vec<String>),
    /// Never answer the request at all.
    Silent,
}

#[derive(Default)]
struct Script {
    replies: VecDeque<Reply>,
    /// Correlation header and body of every stream request.
    seen: Vec<(Option<String>, SendMessageRequest)>,
}

type SharedScript = Arc<Mutex<Script>>;

fn frame(event: &StreamEvent) -> String {
    format!(
        "event: {}\nid: {}\ndata: {}\n\n",
        event.kind().as_str(),
        event.sequence(),
        serde_json::to_string(event).unwrap()
    )
}

fn finished(fragments: &[&str]) -> Vec<String> {
    let mut chunks: Vec<String> = fragments
        .iter()
        .enumerate()
        .map(|(i, f)| frame(&StreamEvent::data(i as u64, *f)))
        .collect();
    chunks.push(frame(&StreamEvent::done(
        fragments.len() as u64,
        DonePayload::default(),
    )));
    chunks
}

async fn create(State(_): State<SharedScript>) -> Json<CreatedConversation> {
    Json(CreatedConversation {
        id: ConversationId::new(),
    })
}

async fn scripted_stream(
    State(script): State<SharedScript>,
    headers: HeaderMap,
    Json(request): Json<SendMessageRequest>,
) -> Response {
    let reply = {
        let mut script = script.lock().unwrap();
        let correlation = headers
            .get(CORRELATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        script.seen.push((correlation, request));
        script.replies.pop_front().unwrap_or(Reply::Close(Vec::new()))
    };

    let body = match reply {
        Reply::Silent => return std::future::pending::<Response>().await,
        Reply::Close(chunks) => Body::from_stream(stream::iter(chunks).map(Ok::<_, Infallible>)),
        Reply::Stall(chunks) => Body::from_stream(
            stream::iter(chunks)
                .chain(stream::pending())
                .map(Ok::<_, Infallible>),
        ),
    };
    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

async fn scripted_session(replies: Vec<Reply>) -> (ChatSession, ConversationId, SharedScript) {
    let script: SharedScript = Arc::new(Mutex::new(Script {
        replies: replies.into(),
        seen: Vec::new(),
    }));
    let router = Router::new()
        .route("/conversations", post(create))
        .route("/chat/stream", post(scripted_stream))
        .with_state(script.clone());
    let url = spawn(router).await;

    let session = ChatSession::new(&client_config(url)).unwrap();
    let conversation = session.start_conversation().await.unwrap();
    (session, conversation, script)
}

#[tokio::test]
async fn test_drop_after_content_is_not_retried_and_resubmission_reuses_entries() {
    let (session, conversation, script) = scripted_session(vec![
        Reply::Close(vec![frame(&StreamEvent::data(0, "Sum"))]),
        Reply::Close(finished(&["Sum", "mary"])),
    ])
    .await;

    let outcome = session.send(conversation, "Summarize this doc").await.unwrap();
    let ExchangeOutcome::Failed { failure, partial } = outcome else {
        panic!("expected a failed exchange, got {outcome:?}");
    };
    assert_eq!(partial, "Sum");
    assert!(matches!(failure, FailureKind::Transport(_)));
    assert_eq!(script.lock().unwrap().seen.len(), 1);

    let outcome = session.send(conversation, "Summarize this doc").await.unwrap();
    assert!(matches!(
        outcome,
        ExchangeOutcome::Finalized { ref assistant } if assistant.content == "Summary"
    ));

    let entries = session.entries(conversation);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].content, "Summary");

    let seen = &script.lock().unwrap().seen;
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].1.client_message_id, seen[1].1.client_message_id);
    assert_ne!(seen[0].0, seen[1].0);
}

#[tokio::test]
async fn test_failure_before_content_is_retried_with_same_ids() {
    let (session, conversation, script) = scripted_session(vec![
        Reply::Close(Vec::new()),
        Reply::Close(finished(&["hello"])),
    ])
    .await;

    let outcome = session.send(conversation, "hi").await.unwrap();
    assert!(matches!(outcome, ExchangeOutcome::Finalized { .. }));

    let seen = &script.lock().unwrap().seen;
    assert_eq!(seen.len(), 2);
    assert!(seen[0].0.is_some());
    assert_eq!(seen[0].0, seen[1].0);
    assert_eq!(seen[0].1.client_message_id, seen[1].1.client_message_id);
    assert_eq!(session.entries(conversation).len(), 2);
}

#[tokio::test]
async fn test_retries_stop_at_attempt_ceiling() {
    let (session, conversation, script) = scripted_session(Vec::new()).await;

    let outcome = session.send(conversation, "hi").await.unwrap();
    let ExchangeOutcome::Failed { failure, partial } = outcome else {
        panic!("expected a failed exchange, got {outcome:?}");
    };
    assert!(matches!(failure, FailureKind::RetriesExhausted { attempts: 3, .. }));
    assert!(partial.is_empty());
    assert_eq!(script.lock().unwrap().seen.len(), 3);

    // The retry affordance resends the same message.
    let outcome = session.retry(conversation).await.unwrap();
    assert!(matches!(outcome, ExchangeOutcome::Failed { .. }));
    assert_eq!(session.entries(conversation).len(), 2);
}

#[tokio::test]
async fn test_idle_stream_fails_with_partial_buffer() {
    let (session, conversation, _script) =
        scripted_session(vec![Reply::Stall(vec![frame(&StreamEvent::data(0, "Sum"))])]).await;

    let outcome = session.send(conversation, "hi").await.unwrap();
    let ExchangeOutcome::Failed { failure, partial } = outcome else {
        panic!("expected a failed exchange, got {outcome:?}");
    };
    assert_eq!(partial, "Sum");
    assert!(matches!(failure, FailureKind::Transport(_)));
    assert!(matches!(
        session.entries(conversation)[1].delivery,
        Delivery::Failed { retryable: true, .. }
    ));
}

#[tokio::test]
async fn test_server_that_never_answers_fails_after_idle_window() {
    let (session, conversation, script) = scripted_session(vec![Reply::Silent]).await;

    let outcome = tokio::time::timeout(Duration::from_secs(3), session.send(conversation, "hi"))
        .await
        .expect("exchange must fail within the idle window")
        .unwrap();
    let ExchangeOutcome::Failed { failure, partial } = outcome else {
        panic!("expected a failed exchange, got {outcome:?}");
    };
    assert!(matches!(failure, FailureKind::Transport(_)));
    assert!(partial.is_empty());
    assert!(session.phase(conversation).unwrap().in_flight().is_none());
    assert_eq!(script.lock().unwrap().seen.len(), 1);
}

#[tokio::test]
async fn test_second_send_while_in_flight_is_busy() {
    let (session, conversation, _script) =
        scripted_session(vec![Reply::Stall(vec![frame(&StreamEvent::data(0, "Sum"))])]).await;
    let session = Arc::new(session);

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.send(conversation, "one").await })
    };
    // Give the first exchange time to submit.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = session.send(conversation, "two").await.unwrap_err();
    assert!(matches!(
        err,
        parley_client::ClientError::Reconcile(parley_client::reconciler::ReconcileError::Busy(_))
    ));
    assert!(first.await.unwrap().is_ok());
}
