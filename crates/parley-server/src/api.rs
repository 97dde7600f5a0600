use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        DefaultBodyLimit, Path, State,
    },
    http::{HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, Instrument};

use parley_shared::constants::CORRELATION_HEADER;
use parley_shared::protocol::{CreatedConversation, SendMessageRequest, TitleResponse};
use parley_shared::types::ConversationId;
use parley_shared::ChatError;
use parley_store::ConversationStore;

use crate::backend::GenerationBackend;
use crate::chat::{ChatService, CreateConversation, GenerateTitle, GetConversation};
use crate::config::ServerConfig;
use crate::context::RequestContext;
use crate::error::{CorrelatedError, ServerError};
use crate::fragment::FragmentSource;
use crate::identity::{IdentityProvider, TokenIdentity};
use crate::pipeline::{Pipeline, Request, ValidationRules};
use crate::transport;

/// Request bodies larger than this are rejected before parsing.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// One pipeline per request type, all sharing the same stages.
pub struct Pipelines {
    pub send: Pipeline<SendMessageRequest>,
    pub create: Pipeline<CreateConversation>,
    pub get: Pipeline<GetConversation>,
    pub title: Pipeline<GenerateTitle>,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ConversationStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub pipelines: Arc<Pipelines>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn ConversationStore>,
        backend: Arc<dyn GenerationBackend>,
    ) -> Self {
        let identity: Arc<dyn IdentityProvider> =
            Arc::new(TokenIdentity::new(config.effective_tokens(), store.clone()));
        let source = FragmentSource::new(backend, config.upstream_idle_timeout);
        let service = Arc::new(ChatService::new(store.clone(), source));
        let rules = ValidationRules::from(&config);
        let slow = config.slow_request_threshold;

        let pipelines = Pipelines {
            send: Pipeline::<SendMessageRequest>::standard(
                service.clone(),
                identity.clone(),
                rules,
                slow,
            ),
            create: Pipeline::<CreateConversation>::standard(
                service.clone(),
                identity.clone(),
                rules,
                slow,
            ),
            get: Pipeline::<GetConversation>::standard(
                service.clone(),
                identity.clone(),
                rules,
                slow,
            ),
            title: Pipeline::<GenerateTitle>::standard(
                service,
                identity.clone(),
                rules,
                slow,
            ),
        };

        Self {
            store,
            identity,
            pipelines: Arc::new(pipelines),
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(CORRELATION_HEADER)]);

    Router::new()
        .route("/health", get(health_check))
        .route("/conversations", post(create_conversation))
        .route("/conversations/:id", get(get_conversation))
        .route("/conversations/:id/title", post(generate_title))
        .route("/chat/stream", post(chat_stream))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    store: String,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        store: state.store.backend_name().to_string(),
    })
}

/// Run `req` through `pipeline` inside the request span.
async fn run<R: Request>(
    pipeline: &Pipeline<R>,
    ctx: &RequestContext,
    req: R,
) -> Result<R::Response, CorrelatedError> {
    pipeline
        .execute(ctx, req)
        .instrument(ctx.span(R::NAME))
        .await
        .map_err(|e| ServerError::from(e).correlated(ctx.correlation_id))
}

fn with_correlation(
    ctx: &RequestContext,
    status: StatusCode,
    body: impl IntoResponse,
) -> Response {
    (
        status,
        [(CORRELATION_HEADER, ctx.correlation_id.to_string())],
        body,
    )
        .into_response()
}

fn conversation_path(
    ctx: &RequestContext,
    path: Result<Path<ConversationId>, PathRejection>,
) -> Result<ConversationId, CorrelatedError> {
    path.map(|Path(id)| id)
        .map_err(|e| ServerError::BadRequest(e.body_text()).correlated(ctx.correlation_id))
}

async fn create_conversation(
    ctx: RequestContext,
    State(state): State<AppState>,
) -> Result<Response, CorrelatedError> {
    let id = run(&state.pipelines.create, &ctx, CreateConversation).await?;
    Ok(with_correlation(
        &ctx,
        StatusCode::CREATED,
        Json(CreatedConversation { id }),
    ))
}

async fn get_conversation(
    ctx: RequestContext,
    State(state): State<AppState>,
    path: Result<Path<ConversationId>, PathRejection>,
) -> Result<Response, CorrelatedError> {
    let conversation_id = conversation_path(&ctx, path)?;
    let conversation = run(&state.pipelines.get, &ctx, GetConversation { conversation_id }).await?;
    Ok(with_correlation(&ctx, StatusCode::OK, Json(conversation)))
}

async fn generate_title(
    ctx: RequestContext,
    State(state): State<AppState>,
    path: Result<Path<ConversationId>, PathRejection>,
) -> Result<Response, CorrelatedError> {
    let conversation_id = conversation_path(&ctx, path)?;
    let title = run(&state.pipelines.title, &ctx, GenerateTitle { conversation_id }).await?;
    Ok(with_correlation(&ctx, StatusCode::OK, Json(TitleResponse { title })))
}

/// `POST /chat/stream`. Rejections before the first fragment are plain JSON
/// errors, except upstream failures, which open the stream with a single
/// `error` event.
async fn chat_stream(
    ctx: RequestContext,
    State(state): State<AppState>,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return ServerError::BadRequest(rejection.body_text())
                .correlated(ctx.correlation_id)
                .into_response();
        }
    };

    let span = ctx.span(SendMessageRequest::NAME);
    let conversation_id = request.conversation_id;
    let result = state
        .pipelines
        .send
        .execute(&ctx, request)
        .instrument(span.clone())
        .await;

    match result {
        Ok(exchange) => {
            span.in_scope(|| info!(%conversation_id, "streaming exchange"));
            transport::sse_response(exchange, ctx.correlation_id, span)
        }
        Err(err @ ChatError::Upstream { .. }) => {
            transport::failed_response(err, ctx.correlation_id, span)
        }
        Err(err) => ServerError::from(err)
            .correlated(ctx.correlation_id)
            .into_response(),
    }
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
