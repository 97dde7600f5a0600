//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use parley_shared::constants::{
    DEFAULT_HTTP_PORT, DEFAULT_MAX_CONTENT_CHARS, DEFAULT_MAX_HISTORY_ENTRIES,
};
use parley_shared::types::UserId;

/// Which [`ConversationStore`](parley_store::ConversationStore) to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    /// `None` uses the platform data directory.
    Sqlite(Option<PathBuf>),
}

/// Which generation backend feeds the fragment source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Echo,
    OpenAi,
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Env: `STORE` (`memory` | `sqlite`), `DATABASE_PATH`
    /// Default: memory. Setting `DATABASE_PATH` alone implies sqlite.
    pub store: StoreKind,

    /// Env: `GENERATION_BACKEND` (`echo` | `openai`)
    /// Default: `echo`
    pub backend: BackendKind,

    /// Base URL of the OpenAI-compatible API.
    /// Env: `LLM_API_BASE`
    pub llm_api_base: String,

    /// Env: `LLM_API_KEY`
    pub llm_api_key: Option<String>,

    /// Env: `LLM_MODEL`
    pub llm_model: String,

    /// Delay between words of the echo backend.
    /// Env: `ECHO_DELAY_MS`
    pub echo_delay: Duration,

    /// Bearer token → user table.
    /// Env: `API_TOKENS` as `token=user-uuid,token2=user-uuid`
    /// Default: empty, which registers the development token `dev`.
    pub api_tokens: Vec<(String, UserId)>,

    /// Requests slower than this log a warning.
    /// Env: `SLOW_REQUEST_THRESHOLD_MS`
    pub slow_request_threshold: Duration,

    /// Env: `UPSTREAM_IDLE_TIMEOUT_SECS`
    pub upstream_idle_timeout: Duration,

    /// Env: `MAX_CONTENT_CHARS`
    pub max_content_chars: usize,

    /// Env: `MAX_HISTORY_ENTRIES`
    pub max_history_entries: usize,
}

/// Fixed user behind the `dev` token.
pub const DEV_USER: UserId = UserId(uuid::Uuid::from_u128(0x0000_0000_0000_4000_8000_0000_0000_0001));

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            store: StoreKind::Memory,
            backend: BackendKind::Echo,
            llm_api_base: "https://api.openai.com".to_string(),
            llm_api_key: None,
            llm_model: "gpt-4o-mini".to_string(),
            echo_delay: Duration::from_millis(40),
            api_tokens: Vec::new(),
            slow_request_threshold: Duration::from_millis(2000),
            upstream_idle_timeout: Duration::from_secs(60),
            max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
            max_history_entries: DEFAULT_MAX_HISTORY_ENTRIES,
        }
    }
}

// Tokens and the API key stay out of logs.
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("store", &self.store)
            .field("backend", &self.backend)
            .field("llm_api_base", &self.llm_api_base)
            .field("llm_api_key", &self.llm_api_key.as_ref().map(|_| "<redacted>"))
            .field("llm_model", &self.llm_model)
            .field("echo_delay", &self.echo_delay)
            .field("api_tokens", &self.api_tokens.len())
            .field("slow_request_threshold", &self.slow_request_threshold)
            .field("upstream_idle_timeout", &self.upstream_idle_timeout)
            .field("max_content_chars", &self.max_content_chars)
            .field("max_history_entries", &self.max_history_entries)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        let db_path = lookup("DATABASE_PATH").filter(|p| !p.is_empty()).map(PathBuf::from);
        match lookup("STORE").as_deref() {
            Some("memory") => config.store = StoreKind::Memory,
            Some("sqlite") => config.store = StoreKind::Sqlite(db_path),
            Some(other) => {
                tracing::warn!(value = %other, "Invalid STORE, using default");
            }
            None if db_path.is_some() => config.store = StoreKind::Sqlite(db_path),
            None => {}
        }

        match lookup("GENERATION_BACKEND").as_deref() {
            Some("echo") | None => {}
            Some("openai") => config.backend = BackendKind::OpenAi,
            Some(other) => {
                tracing::warn!(value = %other, "Invalid GENERATION_BACKEND, using echo");
            }
        }

        if let Some(base) = lookup("LLM_API_BASE") {
            config.llm_api_base = base.trim_end_matches('/').to_string();
        }

        if let Some(key) = lookup("LLM_API_KEY") {
            if !key.is_empty() {
                config.llm_api_key = Some(key);
            }
        }

        if let Some(model) = lookup("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Some(ms) = parse_u64(&lookup, "ECHO_DELAY_MS") {
            config.echo_delay = Duration::from_millis(ms);
        }

        if let Some(raw) = lookup("API_TOKENS") {
            match parse_tokens(&raw) {
                Ok(tokens) => config.api_tokens = tokens,
                Err(e) => tracing::warn!(error = %e, "Invalid API_TOKENS, ignoring"),
            }
        }

        if let Some(ms) = parse_u64(&lookup, "SLOW_REQUEST_THRESHOLD_MS") {
            config.slow_request_threshold = Duration::from_millis(ms);
        }

        if let Some(secs) = parse_u64(&lookup, "UPSTREAM_IDLE_TIMEOUT_SECS") {
            config.upstream_idle_timeout = Duration::from_secs(secs.max(1));
        }

        if let Some(n) = parse_u64(&lookup, "MAX_CONTENT_CHARS") {
            config.max_content_chars = n as usize;
        }

        if let Some(n) = parse_u64(&lookup, "MAX_HISTORY_ENTRIES") {
            config.max_history_entries = n as usize;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// Token table in effect, including the development fallback.
    pub fn effective_tokens(&self) -> Vec<(String, UserId)> {
        if self.api_tokens.is_empty() {
            vec![("dev".to_string(), DEV_USER)]
        } else {
            self.api_tokens.clone()
        }
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid number, using default");
            None
        }
    }
}

/// Parse `token=uuid,token=uuid`.
fn parse_tokens(raw: &str) -> Result<Vec<(String, UserId)>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (token, user) = entry
                .split_once('=')
                .ok_or_else(|| format!("expected token=user-id, got {entry:?}"))?;
            if token.trim().is_empty() {
                return Err("empty token".to_string());
            }
            let user = user
                .parse::<UserId>()
                .map_err(|e| format!("invalid user id {user:?}: {e}"))?;
            Ok((token.trim().to_string(), user))
        })
        .collect()
}
