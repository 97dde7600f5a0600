//! # parley-server
//!
//! HTTP server for Parley conversations.
//!
//! This binary provides:
//! - **Streaming chat** (`POST /chat/stream`): a message is validated,
//!   relayed to the generation backend and answered with Server-Sent Events
//! - **Conversation API** (axum) for creating conversations, reading them
//!   back and generating titles
//! - **Pluggable persistence**: in-memory, or SQLite on disk

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parley_server::config::{ServerConfig, StoreKind};
use parley_server::{backend, AppState};
use parley_store::{ConversationStore, MemoryStore, SqliteStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting Parley server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.api_tokens.is_empty() {
        warn!("No API_TOKENS configured, accepting the development token `dev`");
    }

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let store: Arc<dyn ConversationStore> = match &config.store {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::Sqlite(path) => Arc::new(SqliteStore::open(path.as_deref())?),
    };
    info!(store = store.backend_name(), "Conversation store ready");

    let backend = backend::from_config(&config)?;
    info!(backend = backend.name(), "Generation backend ready");

    let http_addr = config.http_addr;
    let app_state = AppState::new(config, store, backend);

    // -----------------------------------------------------------------------
    // 4. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    // tokio::select! ensures that if either the HTTP server or a shutdown
    // signal arrives, we exit cleanly. In-flight exchanges are dropped, which
    // aborts their upstream calls.
    tokio::select! {
        result = parley_server::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
