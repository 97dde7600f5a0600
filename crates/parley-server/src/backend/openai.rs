//! OpenAI-compatible chat completions backend.
//!
//! Speaks the `/v1/chat/completions` protocol used by OpenAI, DeepSeek,
//! Groq, Mistral and most self-hosted gateways. Streaming responses are
//! Server-Sent Events whose `data:` lines carry JSON chunks and end with
//! `data: [DONE]`.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use parley_shared::protocol::HistoryEntry;
use parley_shared::sse::SseDecoder;

use super::{BackendError, GenerationBackend, TextStream};

pub struct OpenAiCompatBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatBackend {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: &str,
    ) -> Result<Self, BackendError> {
        if base_url.is_empty() {
            return Err(BackendError::Config("LLM_API_BASE is empty".into()));
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("parley-server/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
        })
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, BackendError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl GenerationBackend for OpenAiCompatBackend {
    async fn generate(
        &self,
        history: &[HistoryEntry],
        content: &str,
    ) -> Result<TextStream, BackendError> {
        let mut messages: Vec<Value> = history.iter().map(entry_to_json).collect();
        messages.push(json!({ "role": "user", "content": content }));

        let body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });

        let response = self.post(&body).await?;
        tracing::debug!(model = %self.model, "upstream stream opened");
        Ok(decode_stream(response.bytes_stream()))
    }

    async fn complete(
        &self,
        history: &[HistoryEntry],
        instruction: &str,
    ) -> Result<String, BackendError> {
        let mut messages: Vec<Value> = history.iter().map(entry_to_json).collect();
        messages.push(json!({ "role": "user", "content": instruction }));

        let body = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        });

        let data: ApiResponse = self.post(&body).await?.json().await?;
        data.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| BackendError::Decode("no choices in response".into()))
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// ─── API response types ──────────────────────────────────────

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
}

// ─── Stream decoding ─────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum Chunk {
    Text(String),
    Skip,
    Done,
}

fn entry_to_json(entry: &HistoryEntry) -> Value {
    json!({
        "role": entry.author.as_str(),
        "content": entry.content,
    })
}

/// Interpret the `data:` payload of one upstream SSE frame.
fn parse_chunk(data: &str) -> Result<Chunk, BackendError> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(Chunk::Done);
    }
    if data.is_empty() {
        return Ok(Chunk::Skip);
    }

    let value: Value =
        serde_json::from_str(data).map_err(|e| BackendError::Decode(e.to_string()))?;

    if let Some(error) = value.get("error") {
        let message = error["message"]
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| error.to_string());
        return Err(BackendError::Api(message));
    }

    match value["choices"][0]["delta"]["content"].as_str() {
        Some(text) => Ok(Chunk::Text(text.to_string())),
        None => Ok(Chunk::Skip),
    }
}

struct Decoder {
    body: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    sse: SseDecoder,
    pending: VecDeque<Result<String, BackendError>>,
    finished: bool,
}

impl Decoder {
    fn feed(&mut self, bytes: &[u8]) {
        let frames = match self.sse.push(bytes) {
            Ok(frames) => frames,
            Err(e) => {
                self.fail(BackendError::Decode(e.to_string()));
                return;
            }
        };
        for frame in frames {
            match parse_chunk(&frame.data) {
                Ok(Chunk::Text(text)) => self.pending.push_back(Ok(text)),
                Ok(Chunk::Skip) => {}
                Ok(Chunk::Done) => {
                    self.finished = true;
                    return;
                }
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
    }

    fn fail(&mut self, err: BackendError) {
        self.pending.push_back(Err(err));
        self.finished = true;
    }
}

/// Turn an upstream SSE body into text chunks. The body is dropped as soon
/// as `[DONE]` or an error is seen. A body that ends before `[DONE]` yields
/// a final error.
fn decode_stream<S>(body: S) -> TextStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let decoder = Decoder {
        body: body.boxed(),
        sse: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(decoder, |mut decoder| async move {
        loop {
            if let Some(item) = decoder.pending.pop_front() {
                return Some((item, decoder));
            }
            if decoder.finished {
                return None;
            }
            match decoder.body.next().await {
                Some(Ok(bytes)) => decoder.feed(&bytes),
                Some(Err(e)) => decoder.fail(e.into()),
                // `[DONE]` sets `finished`, so reaching the end here means truncation.
                None => decoder.fail(BackendError::Decode(
                    "upstream stream ended without [DONE]".into(),
                )),
            }
        }
    })
    .boxed()
}
