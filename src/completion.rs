//! Outbound calls to an OpenAI-compatible chat completion API.

use std::{future::Future, time::Duration};

use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::store::MessageRole;

/// Pollinations' OpenAI-compatible completion endpoint.
pub const DEFAULT_COMPLETIONS_ENDPOINT: &str = "https://api.pollinations.ai/v1/chat/completions";
pub const DEFAULT_MODELS_ENDPOINT: &str = "https://api.pollinations.ai/models";
pub const DEFAULT_MODEL: &str = "openai";
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("invalid upstream endpoint '{endpoint}': {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatTurn {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatTurn>,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub total_tokens: u32,
}

/// Sends prompts upstream on behalf of a user, with that user's key.
pub trait CompletionBackend: Send + Sync + 'static {
    fn complete(
        &self,
        api_key: &str,
        request: &CompletionRequest,
    ) -> impl Future<Output = Result<Completion, CompletionError>> + Send;

    /// Raw model catalogue as returned by the provider.
    fn list_models(
        &self,
        api_key: &str,
    ) -> impl Future<Output = Result<Value, CompletionError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpCompletion {
    client: Client,
    completions: Url,
    models: Url,
}

impl HttpCompletion {
    pub fn new(completions: &str, models: &str) -> Result<Self, CompletionError> {
        Self::with_timeout(completions, models, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        completions: &str,
        models: &str,
        timeout: Duration,
    ) -> Result<Self, CompletionError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            completions: parse_endpoint(completions)?,
            models: parse_endpoint(models)?,
        })
    }
}

impl CompletionBackend for HttpCompletion {
    async fn complete(
        &self,
        api_key: &str,
        request: &CompletionRequest,
    ) -> Result<Completion, CompletionError> {
        let response = self
            .client
            .post(self.completions.clone())
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        parse_completion(&body)
    }

    async fn list_models(&self, api_key: &str) -> Result<Value, CompletionError> {
        let response = self
            .client
            .get(self.models.clone())
            .bearer_auth(api_key)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        serde_json::from_slice(&body).map_err(|err| CompletionError::Malformed(err.to_string()))
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, CompletionError> {
    Url::parse(endpoint).map_err(|source| CompletionError::InvalidEndpoint {
        endpoint: endpoint.to_owned(),
        source,
    })
}

#[derive(Deserialize)]
struct CompletionBody {
    #[serde(default)]
    choices: Vec<ChoiceBody>,
    usage: Option<UsageBody>,
}

#[derive(Deserialize)]
struct ChoiceBody {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct UsageBody {
    total_tokens: Option<u32>,
}

fn parse_completion(body: &[u8]) -> Result<Completion, CompletionError> {
    let parsed: CompletionBody =
        serde_json::from_slice(body).map_err(|err| CompletionError::Malformed(err.to_string()))?;

    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message)
        .and_then(|message| message.content)
        .ok_or_else(|| CompletionError::Malformed("missing choices[0].message.content".into()))?;

    let total_tokens = parsed
        .usage
        .and_then(|usage| usage.total_tokens)
        .unwrap_or(0);

    Ok(Completion {
        content,
        total_tokens,
    })
}

/// Prefer the provider's `error.message`, fall back to a generic text.
fn status_error(status: StatusCode, body: &[u8]) -> CompletionError {
    let message = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("error")
                .and_then(|error| error.get("message").or(Some(error)))
                .and_then(|message| message.as_str().map(str::to_owned))
        })
        .unwrap_or_else(|| "API request failed".to_string());

    CompletionError::Status {
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::{
        Json, Router,
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::{get, post},
    };
    use serde_json::json;

    use super::*;

    async fn completions(headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if auth != "Bearer sk-good" {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": {"message": "Incorrect API key provided"}})),
            );
        }
        let last = body["messages"]
            .as_array()
            .and_then(|m| m.last())
            .and_then(|m| m["content"].as_str())
            .unwrap_or_default()
            .to_string();
        match last.as_str() {
            "empty" => (StatusCode::OK, Json(json!({"choices": []}))),
            _ => (
                StatusCode::OK,
                Json(json!({
                    "choices": [{"message": {"role": "assistant", "content": format!("echo: {last}")}}],
                    "usage": {"total_tokens": 42}
                })),
            ),
        }
    }

    async fn models() -> Json<Value> {
        Json(json!([{"name": "openai"}, {"name": "mistral"}]))
    }

    async fn spawn_upstream() -> SocketAddr {
        let app = Router::new()
            .route("/v1/chat/completions", post(completions))
            .route("/models", get(models))
            .route("/broken", post(|| async { "not json" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn request(content: &str) -> CompletionRequest {
        CompletionRequest {
            model: DEFAULT_MODEL.to_string(),
            messages: vec![ChatTurn {
                role: MessageRole::User,
                content: content.to_string(),
            }],
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    fn backend(addr: SocketAddr, completions_path: &str) -> HttpCompletion {
        HttpCompletion::new(
            &format!("http://{addr}{completions_path}"),
            &format!("http://{addr}/models"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn returns_first_choice_and_token_usage() {
        let addr = spawn_upstream().await;
        let backend = backend(addr, "/v1/chat/completions");
        let completion = backend.complete("sk-good", &request("hello")).await.unwrap();
        assert_eq!(completion.content, "echo: hello");
        assert_eq!(completion.total_tokens, 42);
    }

    #[tokio::test]
    async fn surfaces_provider_error_message() {
        let addr = spawn_upstream().await;
        let backend = backend(addr, "/v1/chat/completions");
        let err = backend.complete("sk-bad", &request("hello")).await.unwrap_err();
        match err {
            CompletionError::Status { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Incorrect API key provided");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_content_is_malformed() {
        let addr = spawn_upstream().await;
        let backend = backend(addr, "/v1/chat/completions");
        let err = backend.complete("sk-good", &request("empty")).await.unwrap_err();
        assert!(matches!(err, CompletionError::Malformed(_)));
    }

    #[tokio::test]
    async fn non_json_body_is_malformed() {
        let addr = spawn_upstream().await;
        let backend = backend(addr, "/broken");
        let err = backend.complete("sk-good", &request("hello")).await.unwrap_err();
        assert!(matches!(err, CompletionError::Malformed(_)));
    }

    #[tokio::test]
    async fn lists_models_with_user_key() {
        let addr = spawn_upstream().await;
        let backend = backend(addr, "/v1/chat/completions");
        let models = backend.list_models("sk-good").await.unwrap();
        assert_eq!(models.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn rejects_invalid_endpoint() {
        let err = HttpCompletion::new("not a url", DEFAULT_MODELS_ENDPOINT).unwrap_err();
        assert!(matches!(err, CompletionError::InvalidEndpoint { .. }));
    }

    #[test]
    fn status_error_falls_back_to_generic_message() {
        let err = status_error(StatusCode::BAD_GATEWAY, b"<html>");
        assert!(matches!(
            err,
            CompletionError::Status { status: 502, ref message } if message == "API request failed"
        ));

        let err = status_error(StatusCode::BAD_REQUEST, br#"{"error":"bad model"}"#);
        assert!(matches!(
            err,
            CompletionError::Status { ref message, .. } if message == "bad model"
        ));
    }
}
