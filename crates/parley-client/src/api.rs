//! Thin HTTP client for the Parley server API.

use std::time::Duration;

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use parley_shared::constants::CORRELATION_HEADER;
use parley_shared::models::ConversationWithMessages;
use parley_shared::protocol::{ApiError, CreatedConversation, SendMessageRequest, TitleResponse};
use parley_shared::types::ConversationId;
use parley_shared::ErrorKind;

use crate::config::ClientConfig;
use crate::error::ClientError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// No overall request timeout is set: streams stay open as long as
    /// events keep arriving.
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("parley-client/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub async fn health(&self) -> Result<serde_json::Value, ClientError> {
        let response = self.request(Method::GET, "/health").send().await?;
        read_json(response).await
    }

    pub async fn create_conversation(&self) -> Result<ConversationId, ClientError> {
        let response = self.request(Method::POST, "/conversations").send().await?;
        let created: CreatedConversation = read_json(response).await?;
        Ok(created.id)
    }

    pub async fn get_conversation(
        &self,
        id: ConversationId,
    ) -> Result<ConversationWithMessages, ClientError> {
        let response = self
            .request(Method::GET, &format!("/conversations/{id}"))
            .send()
            .await?;
        read_json(response).await
    }

    pub async fn generate_title(&self, id: ConversationId) -> Result<String, ClientError> {
        let response = self
            .request(Method::POST, &format!("/conversations/{id}/title"))
            .send()
            .await?;
        let body: TitleResponse = read_json(response).await?;
        Ok(body.title)
    }

    /// Open `POST /chat/stream`. The status is not checked here.
    pub async fn open_stream(
        &self,
        request: &SendMessageRequest,
        correlation_id: Uuid,
    ) -> Result<reqwest::Response, reqwest::Error> {
        self.request(Method::POST, "/chat/stream")
            .header(CORRELATION_HEADER, correlation_id.to_string())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    if !response.status().is_success() {
        let (status, error) = rejection(response).await;
        return Err(ClientError::Rejected { status, error });
    }
    Ok(response.json().await?)
}

/// Decode the `ApiError` body of a non-2xx response. Bodies that are not an
/// `ApiError` (a proxy page, say) are classified by status code.
pub(crate) async fn rejection(response: reqwest::Response) -> (u16, ApiError) {
    let status = response.status();
    let correlation_id = response
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let text = response.text().await.unwrap_or_default();

    let error = serde_json::from_str::<ApiError>(&text).unwrap_or_else(|_| ApiError {
        kind: kind_for_status(status),
        message: if text.trim().is_empty() {
            status.canonical_reason().unwrap_or("request failed").to_string()
        } else {
            text.trim().to_string()
        },
        errors: Vec::new(),
        correlation_id,
    });
    (status.as_u16(), error)
}

fn kind_for_status(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorKind::Validation,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::Unauthorized,
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => ErrorKind::UpstreamFailure,
        _ => ErrorKind::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_for_status() {
        assert_eq!(kind_for_status(StatusCode::UNPROCESSABLE_ENTITY), ErrorKind::Validation);
        assert_eq!(kind_for_status(StatusCode::FORBIDDEN), ErrorKind::Unauthorized);
        assert_eq!(kind_for_status(StatusCode::BAD_GATEWAY), ErrorKind::UpstreamFailure);
        assert_eq!(kind_for_status(StatusCode::SERVICE_UNAVAILABLE), ErrorKind::Internal);
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let config = ClientConfig {
            server_url: "http://localhost:9000/".into(),
            ..ClientConfig::default()
        };
        let api = ApiClient::new(&config).unwrap();
        assert_eq!(api.base_url(), "http://localhost:9000");
    }
}
