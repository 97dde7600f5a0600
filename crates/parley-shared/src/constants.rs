/// Application name
pub const APP_NAME: &str = "Parley";

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Header carrying the per-exchange correlation identifier
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Maximum length of a generated conversation title, in characters
pub const MAX_TITLE_CHARS: usize = 80;

/// Default cap on the characters of one user message
pub const DEFAULT_MAX_CONTENT_CHARS: usize = 32_000;

/// Default cap on the number of history entries sent with one request
pub const DEFAULT_MAX_HISTORY_ENTRIES: usize = 500;

/// Fragments buffered between the producing task and the response body
pub const STREAM_CHANNEL_CAPACITY: usize = 16;

/// Longest SSE line accepted by the decoder (1 MiB)
pub const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;

/// Largest undispatched SSE frame accepted by the decoder (4 MiB)
pub const MAX_SSE_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Error codes carried by `error` stream events
pub mod codes {
    pub const UPSTREAM_FAILURE: &str = "upstream_failure";
    pub const UPSTREAM_TIMEOUT: &str = "upstream_timeout";
    pub const INTERNAL: &str = "internal";
}
