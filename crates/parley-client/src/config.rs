//! Client configuration loaded from environment variables.

use std::time::Duration;

use parley_shared::constants::DEFAULT_HTTP_PORT;

use crate::retry::RetryPolicy;

#[derive(Clone)]
pub struct ClientConfig {
    /// Base URL of the Parley server, without a trailing slash.
    /// Env: `PARLEY_SERVER_URL`
    /// Default: `http://127.0.0.1:8080`
    pub server_url: String,

    /// Bearer token sent with every request.
    /// Env: `PARLEY_TOKEN`
    /// Default: the development token `dev`.
    pub token: Option<String>,

    /// A stream that delivers no event for this long fails the exchange.
    /// Env: `IDLE_TIMEOUT_SECS`
    pub idle_timeout: Duration,

    /// Env: `RETRY_MAX_ATTEMPTS`, `RETRY_BASE_MS`, `RETRY_MAX_MS`
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: format!("http://127.0.0.1:{DEFAULT_HTTP_PORT}"),
            token: Some("dev".to_string()),
            idle_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_url", &self.server_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("idle_timeout", &self.idle_timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("PARLEY_SERVER_URL") {
            if url.starts_with("http://") || url.starts_with("https://") {
                config.server_url = url.trim_end_matches('/').to_string();
            } else {
                tracing::warn!(value = %url, "Invalid PARLEY_SERVER_URL, using default");
            }
        }

        if let Some(token) = lookup("PARLEY_TOKEN") {
            config.token = Some(token).filter(|t| !t.is_empty());
        }

        if let Some(secs) = parse_u64(&lookup, "IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(secs.max(1));
        }

        if let Some(n) = parse_u64(&lookup, "RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = n.clamp(1, u32::MAX as u64) as u32;
        }

        if let Some(ms) = parse_u64(&lookup, "RETRY_BASE_MS") {
            config.retry.base = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_u64(&lookup, "RETRY_MAX_MS") {
            config.retry.max = Duration::from_millis(ms);
        }

        if config.retry.max < config.retry.base {
            tracing::warn!("RETRY_MAX_MS is below RETRY_BASE_MS, raising it");
            config.retry.max = config.retry.base;
        }

        config
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
