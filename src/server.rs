use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::{FromRequest, Path, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, patch},
};
use byok_relay::{
    ApiKeyStatus, ByokRelay, ChatRecord, CodecError, CompletionBackend, MessageRecord,
    MessageRole, RelayError, UsageReport,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

struct AppState<B> {
    relay: ByokRelay<B>,
    forward_auth: ForwardAuthConfig,
}

/// Identity as asserted by the reverse proxy in front of the relay.
#[derive(Clone, Debug)]
pub struct ForwardAuthConfig {
    user_header: Option<HeaderName>,
    admin_value: Option<String>,
    nickname_header: Option<HeaderName>,
    dev_user: Option<String>,
}

impl ForwardAuthConfig {
    pub fn new(
        user_header: Option<HeaderName>,
        admin_value: Option<String>,
        nickname_header: Option<HeaderName>,
        dev_user: Option<String>,
    ) -> Self {
        Self {
            user_header,
            admin_value,
            nickname_header,
            dev_user,
        }
    }

    pub fn is_dev_mode(&self) -> bool {
        self.dev_user.is_some()
    }

    fn user_value<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        self.user_header
            .as_ref()
            .and_then(|name| headers.get(name))
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    fn nickname_value<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        self.nickname_header
            .as_ref()
            .and_then(|name| headers.get(name))
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// The dev user wins over headers so a local setup needs no proxy, and
    /// is an admin.
    fn identify(&self, headers: &HeaderMap) -> Option<Identity> {
        if let Some(name) = self.dev_user.as_deref() {
            return Some(Identity {
                user_id: name.to_owned(),
                display_name: Some(name.to_owned()),
                is_admin: true,
            });
        }

        let user_id = self.user_value(headers)?;
        let is_admin = self
            .admin_value
            .as_deref()
            .is_some_and(|expected| expected == user_id);
        Some(Identity {
            user_id: user_id.to_owned(),
            display_name: self.nickname_value(headers).map(str::to_owned),
            is_admin,
        })
    }
}

#[derive(Debug)]
struct Identity {
    user_id: String,
    display_name: Option<String>,
    is_admin: bool,
}

async fn authenticate<B: CompletionBackend>(
    state: &AppState<B>,
    headers: &HeaderMap,
) -> Result<Identity, ApiError> {
    let identity = state
        .forward_auth
        .identify(headers)
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "missing user identity"))?;
    state
        .relay
        .touch_user(&identity.user_id, identity.display_name.as_deref())
        .await?;
    Ok(identity)
}

/// JSON error body; internal details stay in the log.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::QuotaExceeded { .. } => {
                ApiError::new(StatusCode::TOO_MANY_REQUESTS, err.to_string())
            }
            RelayError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, err.to_string()),
            RelayError::MissingApiKey | RelayError::InvalidInput(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, err.to_string())
            }
            RelayError::Completion(source) => {
                tracing::warn!(error = %source, "upstream completion failed");
                ApiError::new(StatusCode::BAD_GATEWAY, source.to_string())
            }
            RelayError::Codec(source) => {
                tracing::error!(error = %source, "stored key could not be processed");
                let message = match source {
                    CodecError::Configuration(_) | CodecError::Encryption => {
                        "Failed to save API key"
                    }
                    CodecError::Format | CodecError::Crypto => "Failed to decrypt API key",
                };
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, message)
            }
            RelayError::Database(source) => {
                tracing::error!(error = %source, "database error");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(rejection.status(), rejection.body_text())
    }
}

/// `Json` extractor whose rejections use the JSON error body.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
struct ApiJson<T>(T);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorView {
                error: self.message,
            }),
        )
            .into_response()
    }
}

async fn health_check() -> &'static str {
    "ok"
}

async fn get_version() -> Json<VersionView> {
    let backend = option_env!("APP_EFFECTIVE_VERSION")
        .map(str::to_string)
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
    let backend = if cfg!(debug_assertions) {
        format!("{backend}-dev")
    } else {
        backend
    };
    Json(VersionView { backend })
}

async fn get_profile<B: CompletionBackend>(
    State(state): State<Arc<AppState<B>>>,
    headers: HeaderMap,
) -> Result<Json<ProfileView>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let key = state.relay.api_key_status(&identity.user_id).await?;
    Ok(Json(ProfileView {
        user_id: identity.user_id,
        display_name: identity.display_name,
        is_admin: identity.is_admin,
        has_api_key: key.exists,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveKeyRequest {
    api_key: String,
    provider: Option<String>,
}

async fn save_api_key<B: CompletionBackend>(
    State(state): State<Arc<AppState<B>>>,
    headers: HeaderMap,
    ApiJson(payload): ApiJson<SaveKeyRequest>,
) -> Result<Json<ApiKeyStatus>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let status = state
        .relay
        .save_api_key(
            &identity.user_id,
            &payload.api_key,
            payload.provider.as_deref(),
        )
        .await?;
    Ok(Json(status))
}

async fn delete_own_api_key<B: CompletionBackend>(
    State(state): State<Arc<AppState<B>>>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    state.relay.delete_api_key(&identity.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn admin_delete_api_key<B: CompletionBackend>(
    State(state): State<Arc<AppState<B>>>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    if !identity.is_admin {
        return Err(ApiError::new(StatusCode::FORBIDDEN, "admin access required"));
    }

    state.relay.delete_api_key(&user_id).await?;
    tracing::info!(admin = %identity.user_id, user = %user_id, "api key removed by admin");
    Ok(StatusCode::NO_CONTENT)
}

async fn get_api_key<B: CompletionBackend>(
    State(state): State<Arc<AppState<B>>>,
    headers: HeaderMap,
) -> Result<Json<ApiKeyStatus>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    Ok(Json(state.relay.api_key_status(&identity.user_id).await?))
}

async fn get_usage<B: CompletionBackend>(
    State(state): State<Arc<AppState<B>>>,
    headers: HeaderMap,
) -> Result<Json<UsageView>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let usage = state.relay.usage(&identity.user_id).await?;
    Ok(Json(usage.into()))
}

async fn list_models<B: CompletionBackend>(
    State(state): State<Arc<AppState<B>>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    Ok(Json(state.relay.list_models(&identity.user_id).await?))
}

// ----- chats -----

#[derive(Debug, Default, Deserialize)]
struct CreateChatRequest {
    title: Option<String>,
    description: Option<String>,
}

async fn create_chat<B: CompletionBackend>(
    State(state): State<Arc<AppState<B>>>,
    headers: HeaderMap,
    ApiJson(payload): ApiJson<CreateChatRequest>,
) -> Result<(StatusCode, Json<ChatView>), ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let chat = state
        .relay
        .create_chat(
            &identity.user_id,
            payload.title.as_deref(),
            payload.description.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(chat.into())))
}

async fn list_chats<B: CompletionBackend>(
    State(state): State<Arc<AppState<B>>>,
    headers: HeaderMap,
) -> Result<Json<ChatListView>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let chats: Vec<ChatView> = state
        .relay
        .list_chats(&identity.user_id)
        .await?
        .into_iter()
        .map(ChatView::from)
        .collect();
    Ok(Json(ChatListView {
        count: chats.len(),
        chats,
    }))
}

async fn get_chat<B: CompletionBackend>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ChatThreadView>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let thread = state.relay.chat_thread(&identity.user_id, id).await?;
    Ok(Json(ChatThreadView {
        chat: thread.chat.into(),
        messages: thread.messages.into_iter().map(MessageView::from).collect(),
    }))
}

#[derive(Debug, Deserialize)]
struct RenameChatRequest {
    title: String,
}

async fn rename_chat<B: CompletionBackend>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    ApiJson(payload): ApiJson<RenameChatRequest>,
) -> Result<StatusCode, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    state
        .relay
        .rename_chat(&identity.user_id, id, &payload.title)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_chat<B: CompletionBackend>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    state.relay.delete_chat(&identity.user_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ----- messages -----

async fn list_messages<B: CompletionBackend>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<MessageListView>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let messages: Vec<MessageView> = state
        .relay
        .list_messages(&identity.user_id, id)
        .await?
        .into_iter()
        .map(MessageView::from)
        .collect();
    Ok(Json(MessageListView {
        count: messages.len(),
        messages,
    }))
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    content: String,
    model: Option<String>,
}

async fn send_message<B: CompletionBackend>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    ApiJson(payload): ApiJson<SendMessageRequest>,
) -> Result<Json<ExchangeView>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let exchange = state
        .relay
        .send_message(
            &identity.user_id,
            id,
            &payload.content,
            payload.model.as_deref(),
        )
        .await?;
    Ok(Json(ExchangeView {
        user_message: exchange.user_message.into(),
        assistant_message: exchange.assistant_message.into(),
    }))
}

pub fn router<B: CompletionBackend>(
    relay: ByokRelay<B>,
    forward_auth: ForwardAuthConfig,
) -> Router {
    let state = Arc::new(AppState {
        relay,
        forward_auth,
    });

    Router::new()
        .route("/health", get(health_check))
        .route("/api/version", get(get_version))
        .route("/api/profile", get(get_profile::<B>))
        .route(
            "/api/key",
            get(get_api_key::<B>)
                .put(save_api_key::<B>)
                .delete(delete_own_api_key::<B>),
        )
        .route(
            "/api/admin/users/:user_id/key",
            delete(admin_delete_api_key::<B>),
        )
        .route("/api/usage", get(get_usage::<B>))
        .route("/api/models", get(list_models::<B>))
        .route("/api/chats", get(list_chats::<B>).post(create_chat::<B>))
        .route("/api/chats/:id", get(get_chat::<B>).delete(delete_chat::<B>))
        .route("/api/chats/:id/title", patch(rename_chat::<B>))
        .route(
            "/api/chats/:id/messages",
            get(list_messages::<B>).post(send_message::<B>),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve<B: CompletionBackend>(
    addr: SocketAddr,
    relay: ByokRelay<B>,
    forward_auth: ForwardAuthConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(relay, forward_auth);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    tracing::info!("BYOK relay listening on http://{bound_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

#[derive(Debug, Serialize)]
struct ErrorView {
    error: String,
}

#[derive(Debug, Serialize)]
struct VersionView {
    backend: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProfileView {
    user_id: String,
    display_name: Option<String>,
    is_admin: bool,
    has_api_key: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UsageView {
    daily_used: i64,
    monthly_used: i64,
    total_tokens: i64,
    daily_limit: i64,
    monthly_limit: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatView {
    id: i64,
    title: String,
    description: Option<String>,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, Serialize)]
struct ChatListView {
    chats: Vec<ChatView>,
    count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageView {
    id: i64,
    chat_id: i64,
    role: MessageRole,
    content: String,
    tokens_used: i64,
    created_at: i64,
}

#[derive(Debug, Serialize)]
struct MessageListView {
    messages: Vec<MessageView>,
    count: usize,
}

#[derive(Debug, Serialize)]
struct ChatThreadView {
    chat: ChatView,
    messages: Vec<MessageView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeView {
    user_message: MessageView,
    assistant_message: MessageView,
}

impl From<UsageReport> for UsageView {
    fn from(report: UsageReport) -> Self {
        Self {
            daily_used: report.daily_used,
            monthly_used: report.monthly_used,
            total_tokens: report.total_tokens,
            daily_limit: report.limits.daily,
            monthly_limit: report.limits.monthly,
        }
    }
}

impl From<ChatRecord> for ChatView {
    fn from(chat: ChatRecord) -> Self {
        Self {
            id: chat.id,
            title: chat.title,
            description: chat.description,
            created_at: chat.created_at,
            updated_at: chat.updated_at,
        }
    }
}

impl From<MessageRecord> for MessageView {
    fn from(message: MessageRecord) -> Self {
        Self {
            id: message.id,
            chat_id: message.chat_id,
            role: message.role,
            content: message.content,
            tokens_used: message.tokens_used,
            created_at: message.created_at,
        }
    }
}
