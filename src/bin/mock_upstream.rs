use std::net::SocketAddr;

use axum::{
    Json, Router,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use clap::Parser;
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Parser)]
#[command(about = "OpenAI-compatible mock upstream for local development")]
struct Cli {
    /// Address the mock listens on.
    #[arg(long, env = "MOCK_UPSTREAM_ADDR", default_value = "127.0.0.1:58088")]
    bind: SocketAddr,
}

#[derive(Deserialize)]
struct ChatRequest {
    model: Option<String>,
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
}

fn unauthorized() -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": {"message": "Missing or invalid API key"}})),
    )
}

async fn completions(headers: HeaderMap, Json(request): Json<ChatRequest>) -> impl IntoResponse {
    // Keys starting with "sk-invalid" are rejected like a provider would.
    match bearer(&headers) {
        Some(token) if !token.starts_with("sk-invalid") => {}
        _ => return unauthorized(),
    }

    let last = request
        .messages
        .iter()
        .rev()
        .find(|message| message.role == "user")
        .map(|message| message.content.as_str())
        .unwrap_or_default();
    let prompt_tokens: usize = request
        .messages
        .iter()
        .map(|message| message.content.split_whitespace().count())
        .sum();
    let reply = format!("mock reply to: {last}");
    let completion_tokens = reply.split_whitespace().count();

    tracing::info!(
        model = request.model.as_deref().unwrap_or("unset"),
        turns = request.messages.len(),
        "completion requested"
    );

    (
        StatusCode::OK,
        Json(json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion",
            "model": request.model.unwrap_or_else(|| "mock".to_string()),
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": reply},
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": prompt_tokens,
                "completion_tokens": completion_tokens,
                "total_tokens": prompt_tokens + completion_tokens
            }
        })),
    )
}

async fn models(headers: HeaderMap) -> impl IntoResponse {
    if bearer(&headers).is_none() {
        return unauthorized();
    }
    (
        StatusCode::OK,
        Json(json!([
            {"name": "openai", "description": "Mock OpenAI-compatible model"},
            {"name": "mistral", "description": "Mock Mistral model"}
        ])),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let app = Router::new()
        .route("/v1/chat/completions", post(completions))
        .route("/models", get(models));
    tracing::info!("mock upstream on http://{}", cli.bind);

    axum::serve(tokio::net::TcpListener::bind(cli.bind).await?, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_address_is_parsed_by_clap() {
        let cli = Cli::try_parse_from(["mock_upstream", "--bind", "0.0.0.0:9100"]).unwrap();
        assert_eq!(cli.bind, "0.0.0.0:9100".parse::<SocketAddr>().unwrap());

        assert!(Cli::try_parse_from(["mock_upstream", "--bind", "not-an-addr"]).is_err());
    }
}
