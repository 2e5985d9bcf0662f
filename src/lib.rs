pub mod codec;
pub mod completion;
pub mod ledger;
pub mod store;

use std::{fmt, sync::Arc};

use serde::Serialize;
use thiserror::Error;
use zeroize::Zeroizing;

pub use codec::{CodecError, KeyMaterial, KeySource, PassphraseDerivation, SecretCodec};
pub use completion::{
    ChatTurn, Completion, CompletionBackend, CompletionError, CompletionRequest, HttpCompletion,
};
pub use ledger::{LimitCheck, QuotaWindow, UsageCounters, UsageLedger, UsageLimits};
pub use store::{ChatRecord, KeyStatus, MessageRecord, MessageRole, RelayStore, UserRecord};

/// Tunables of the relay that are not part of the key material.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub limits: UsageLimits,
    pub model: String,
    pub max_tokens: u32,
    /// How many earlier messages of the chat are sent along as context.
    pub history_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            limits: UsageLimits::default(),
            model: completion::DEFAULT_MODEL.to_string(),
            max_tokens: completion::DEFAULT_MAX_TOKENS,
            history_limit: 20,
        }
    }
}

/// Bring-your-own-key relay: stores encrypted user keys and forwards chat
/// messages upstream under per-user quotas.
pub struct ByokRelay<B> {
    store: RelayStore,
    ledger: UsageLedger,
    codec: Arc<SecretCodec>,
    backend: Arc<B>,
    config: Arc<RelayConfig>,
}

impl<B> Clone for ByokRelay<B> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ledger: self.ledger.clone(),
            codec: Arc::clone(&self.codec),
            backend: Arc::clone(&self.backend),
            config: Arc::clone(&self.config),
        }
    }
}

impl<B> fmt::Debug for ByokRelay<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByokRelay")
            .field("store", &self.store)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<B: CompletionBackend> ByokRelay<B> {
    pub async fn open(
        database_path: &str,
        codec: SecretCodec,
        backend: B,
        config: RelayConfig,
    ) -> Result<Self, RelayError> {
        let pool = store::connect(database_path).await?;
        let store = RelayStore::new(pool.clone());
        store.initialize_schema().await?;
        let ledger = UsageLedger::new(pool);
        ledger.initialize_schema().await?;

        Ok(Self {
            store,
            ledger,
            codec: Arc::new(codec),
            backend: Arc::new(backend),
            config: Arc::new(config),
        })
    }

    pub async fn touch_user(
        &self,
        user_id: &str,
        display_name: Option<&str>,
    ) -> Result<UserRecord, RelayError> {
        self.store.touch_user(user_id, display_name).await
    }

    /// Encrypt and store the user's API key, replacing the previous one for
    /// the same provider.
    pub async fn save_api_key(
        &self,
        user_id: &str,
        api_key: &str,
        provider: Option<&str>,
    ) -> Result<ApiKeyStatus, RelayError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(RelayError::InvalidInput("API key cannot be empty".into()));
        }
        let provider = provider
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(store::DEFAULT_PROVIDER);

        let token = self.codec.encrypt(api_key)?;
        let record = self
            .store
            .upsert_api_key(user_id, provider, &token, &key_preview(api_key))
            .await?;
        tracing::info!(user = %user_id, provider = %record.provider, "api key saved");

        Ok(record.into())
    }

    pub async fn api_key_status(&self, user_id: &str) -> Result<ApiKeyStatus, RelayError> {
        let record = self.store.latest_api_key(user_id).await?;
        Ok(record.map(ApiKeyStatus::from).unwrap_or_default())
    }

    /// Remove all stored keys of `user_id`. Used by the owner and by admins.
    pub async fn delete_api_key(&self, user_id: &str) -> Result<(), RelayError> {
        let removed = self.store.delete_api_keys(user_id).await?;
        if removed == 0 {
            return Err(RelayError::NotFound("API key"));
        }
        tracing::info!(user = %user_id, removed, "api key deleted");
        Ok(())
    }

    /// Create a chat. Refused while the user is over quota.
    pub async fn create_chat(
        &self,
        user_id: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<ChatRecord, RelayError> {
        let check = self
            .ledger
            .check_limit(user_id, self.config.limits)
            .await?;
        if let Some(window) = check.exceeded {
            return Err(self.quota_error(window));
        }

        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(store::DEFAULT_CHAT_TITLE);
        let description = description.map(str::trim).filter(|d| !d.is_empty());
        self.store.create_chat(user_id, title, description).await
    }

    pub async fn list_chats(&self, user_id: &str) -> Result<Vec<ChatRecord>, RelayError> {
        self.store.list_chats(user_id).await
    }

    pub async fn chat_thread(&self, user_id: &str, chat_id: i64) -> Result<ChatThread, RelayError> {
        let chat = self.owned_chat(user_id, chat_id).await?;
        let messages = self.store.list_messages(chat_id, user_id).await?;
        Ok(ChatThread { chat, messages })
    }

    pub async fn rename_chat(
        &self,
        user_id: &str,
        chat_id: i64,
        title: &str,
    ) -> Result<(), RelayError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(RelayError::InvalidInput("title cannot be empty".into()));
        }
        if self.store.rename_chat(chat_id, user_id, title).await? {
            Ok(())
        } else {
            Err(RelayError::NotFound("chat"))
        }
    }

    pub async fn delete_chat(&self, user_id: &str, chat_id: i64) -> Result<(), RelayError> {
        if self.store.delete_chat(chat_id, user_id).await? {
            Ok(())
        } else {
            Err(RelayError::NotFound("chat"))
        }
    }

    pub async fn list_messages(
        &self,
        user_id: &str,
        chat_id: i64,
    ) -> Result<Vec<MessageRecord>, RelayError> {
        self.owned_chat(user_id, chat_id).await?;
        self.store.list_messages(chat_id, user_id).await
    }

    /// Send `content` to the upstream model with the user's own key and
    /// store both sides of the exchange. `model` falls back to the configured
    /// default.
    ///
    /// One quota slot is taken atomically before the call. It is given back
    /// only if the upstream call never produced a reply; once the provider
    /// has answered, the slot stays spent even if storing the reply fails.
    pub async fn send_message(
        &self,
        user_id: &str,
        chat_id: i64,
        content: &str,
        model: Option<&str>,
    ) -> Result<Exchange, RelayError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(RelayError::InvalidInput("Message cannot be empty".into()));
        }
        let model = model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.config.model.as_str());

        let chat = self.owned_chat(user_id, chat_id).await?;
        let key = self
            .store
            .latest_api_key(user_id)
            .await?
            .ok_or(RelayError::MissingApiKey)?;

        self.ledger.try_consume(user_id, self.config.limits).await?;

        let (user_message, completion) =
            match self.request_completion(user_id, &chat, &key, content, model).await {
                Ok(reply) => reply,
                Err(err) => {
                    if let Err(refund_err) = self.ledger.refund(user_id).await {
                        tracing::error!(user = %user_id, error = %refund_err, "quota refund failed");
                    }
                    if let RelayError::Completion(CompletionError::Status {
                        status: 401 | 403,
                        ..
                    }) = err
                    {
                        self.mark_key_invalid(user_id, &key).await;
                    }
                    tracing::warn!(user = %user_id, chat = chat.id, error = %err, "message relay failed");
                    return Err(err);
                }
            };

        let assistant_message = self
            .store
            .insert_message(
                chat.id,
                user_id,
                MessageRole::Assistant,
                &completion.content,
                i64::from(completion.total_tokens),
            )
            .await?;

        if let Err(err) = self
            .ledger
            .add_tokens(user_id, completion.total_tokens)
            .await
        {
            tracing::error!(user = %user_id, error = %err, "failed to record token usage");
        }
        if let Err(err) = self.store.touch_api_key(key.id).await {
            tracing::warn!(user = %user_id, error = %err, "failed to update key last use");
        }

        tracing::info!(
            user = %user_id,
            chat = chat.id,
            model = %model,
            tokens = completion.total_tokens,
            "message relayed"
        );

        Ok(Exchange {
            user_message,
            assistant_message,
        })
    }

    /// Everything up to and including the upstream call.
    async fn request_completion(
        &self,
        user_id: &str,
        chat: &ChatRecord,
        key: &store::ApiKeyRecord,
        content: &str,
        model: &str,
    ) -> Result<(MessageRecord, Completion), RelayError> {
        let api_key = Zeroizing::new(self.codec.decrypt(&key.encrypted_key)?);

        let history = self.store.list_messages(chat.id, user_id).await?;
        let skip = history.len().saturating_sub(self.config.history_limit);
        let mut messages: Vec<ChatTurn> = history
            .into_iter()
            .skip(skip)
            .map(|message| ChatTurn {
                role: message.role,
                content: message.content,
            })
            .collect();
        messages.push(ChatTurn {
            role: MessageRole::User,
            content: content.to_owned(),
        });

        let user_message = self
            .store
            .insert_message(chat.id, user_id, MessageRole::User, content, 0)
            .await?;

        let request = CompletionRequest {
            model: model.to_owned(),
            messages,
            max_tokens: self.config.max_tokens,
        };
        let completion = self.backend.complete(api_key.as_str(), &request).await?;

        Ok((user_message, completion))
    }

    async fn mark_key_invalid(&self, user_id: &str, key: &store::ApiKeyRecord) {
        match self.store.set_api_key_status(key.id, KeyStatus::Invalid).await {
            Ok(()) => tracing::warn!(user = %user_id, provider = %key.provider, "api key rejected upstream"),
            Err(err) => tracing::error!(user = %user_id, error = %err, "failed to flag rejected key"),
        }
    }

    pub async fn usage(&self, user_id: &str) -> Result<UsageReport, RelayError> {
        let now = chrono::Utc::now();
        let counters = self.ledger.get_or_create_at(user_id, now).await?;
        Ok(UsageReport {
            daily_used: counters.daily_count_at(now),
            monthly_used: counters.monthly_count_at(now),
            total_tokens: counters.total_tokens,
            limits: self.config.limits,
        })
    }

    /// Model catalogue fetched with the user's own key.
    pub async fn list_models(&self, user_id: &str) -> Result<serde_json::Value, RelayError> {
        let key = self
            .store
            .latest_api_key(user_id)
            .await?
            .ok_or(RelayError::MissingApiKey)?;
        let api_key = Zeroizing::new(self.codec.decrypt(&key.encrypted_key)?);
        Ok(self.backend.list_models(api_key.as_str()).await?)
    }

    async fn owned_chat(&self, user_id: &str, chat_id: i64) -> Result<ChatRecord, RelayError> {
        self.store
            .find_chat(chat_id, user_id)
            .await?
            .ok_or(RelayError::NotFound("chat"))
    }

    fn quota_error(&self, window: QuotaWindow) -> RelayError {
        let limit = match window {
            QuotaWindow::Daily => self.config.limits.daily,
            QuotaWindow::Monthly => self.config.limits.monthly,
        };
        RelayError::QuotaExceeded { window, limit }
    }
}

/// Whether a user has a stored key; never carries the key itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyStatus {
    pub exists: bool,
    pub provider: Option<String>,
    pub key_preview: Option<String>,
    pub status: Option<KeyStatus>,
    pub last_used_at: Option<i64>,
    pub updated_at: Option<i64>,
}

impl From<store::ApiKeyRecord> for ApiKeyStatus {
    fn from(record: store::ApiKeyRecord) -> Self {
        Self {
            exists: true,
            provider: Some(record.provider),
            key_preview: Some(record.key_preview).filter(|p| !p.is_empty()),
            status: Some(record.status),
            last_used_at: record.last_used_at,
            updated_at: Some(record.updated_at),
        }
    }
}

/// Last four characters of the key, or nothing when the key is so short
/// that four characters would give most of it away.
fn key_preview(api_key: &str) -> String {
    let chars: Vec<char> = api_key.chars().collect();
    if chars.len() <= 8 {
        return String::new();
    }
    chars[chars.len() - 4..].iter().collect()
}

#[derive(Debug, Clone)]
pub struct ChatThread {
    pub chat: ChatRecord,
    pub messages: Vec<MessageRecord>,
}

/// Both messages stored by a successful [`ByokRelay::send_message`].
#[derive(Debug, Clone)]
pub struct Exchange {
    pub user_message: MessageRecord,
    pub assistant_message: MessageRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReport {
    pub daily_used: i64,
    pub monthly_used: i64,
    pub total_tokens: i64,
    pub limits: UsageLimits,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("{window} limit of {limit} requests exceeded")]
    QuotaExceeded { window: QuotaWindow, limit: i64 },
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("API key not configured. Please set up your API key first.")]
    MissingApiKey,
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::*;

    pub const TEST_HEX_KEY: &str =
        "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    /// Backend that records the keys and prompts it receives.
    #[derive(Default)]
    pub struct RecordingBackend {
        pub seen_keys: Mutex<Vec<String>>,
        pub seen_requests: Mutex<Vec<CompletionRequest>>,
        /// Upstream status to fail with instead of answering.
        pub fail_with: Option<u16>,
    }

    impl CompletionBackend for RecordingBackend {
        async fn complete(
            &self,
            api_key: &str,
            request: &CompletionRequest,
        ) -> Result<Completion, CompletionError> {
            self.seen_keys.lock().unwrap().push(api_key.to_string());
            self.seen_requests.lock().unwrap().push(request.clone());
            if let Some(status) = self.fail_with {
                return Err(CompletionError::Status {
                    status,
                    message: "upstream exploded".into(),
                });
            }
            let last = request
                .messages
                .last()
                .map(|turn| turn.content.clone())
                .unwrap_or_default();
            Ok(Completion {
                content: format!("You said: {last}"),
                total_tokens: 11,
            })
        }

        async fn list_models(&self, api_key: &str) -> Result<serde_json::Value, CompletionError> {
            self.seen_keys.lock().unwrap().push(api_key.to_string());
            Ok(serde_json::json!(["openai"]))
        }
    }

    pub async fn relay_with(
        backend: RecordingBackend,
        config: RelayConfig,
    ) -> (tempfile::TempDir, ByokRelay<RecordingBackend>) {
        let dir = tempfile::tempdir().unwrap();
        let relay = open_relay(&dir, backend, config).await;
        (dir, relay)
    }

    pub fn database_path(dir: &tempfile::TempDir) -> String {
        dir.path().join("relay.db").to_str().unwrap().to_string()
    }

    pub async fn open_relay<B: CompletionBackend>(
        dir: &tempfile::TempDir,
        backend: B,
        config: RelayConfig,
    ) -> ByokRelay<B> {
        let codec = SecretCodec::from_source(&KeySource::Hex(TEST_HEX_KEY.to_string())).unwrap();
        ByokRelay::open(&database_path(dir), codec, backend, config)
            .await
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn is_token_shape(token: &str) -> bool {
        let Some((iv, data)) = token.split_once(':') else {
            return false;
        };
        let lower_hex = |s: &str| s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'));
        iv.len() == 32 && !data.is_empty() && lower_hex(iv) && lower_hex(data)
    }

    #[tokio::test]
    async fn saved_key_is_decrypted_before_upstream_call() {
        let (_dir, relay) = relay_with(RecordingBackend::default(), RelayConfig::default()).await;

        relay.save_api_key("u1", "sk-test-123", None).await.unwrap();
        let stored = relay.store.latest_api_key("u1").await.unwrap().unwrap();
        assert!(is_token_shape(&stored.encrypted_key));
        assert!(!stored.encrypted_key.contains("sk-test-123"));

        let chat = relay.create_chat("u1", None, None).await.unwrap();
        assert_eq!(chat.title, "New Chat");
        let exchange = relay.send_message("u1", chat.id, "hello", None).await.unwrap();

        assert_eq!(
            relay.backend.seen_keys.lock().unwrap().as_slice(),
            ["sk-test-123".to_string()]
        );
        assert_eq!(exchange.user_message.content, "hello");
        assert_eq!(exchange.assistant_message.content, "You said: hello");
        assert_eq!(exchange.assistant_message.tokens_used, 11);

        let usage = relay.usage("u1").await.unwrap();
        assert_eq!(usage.daily_used, 1);
        assert_eq!(usage.monthly_used, 1);
        assert_eq!(usage.total_tokens, 11);

        let status = relay.api_key_status("u1").await.unwrap();
        assert!(status.exists);
        assert_eq!(status.provider.as_deref(), Some("openai"));
        assert!(status.last_used_at.is_some());
    }

    #[tokio::test]
    async fn history_is_sent_as_context() {
        let config = RelayConfig {
            history_limit: 2,
            ..RelayConfig::default()
        };
        let (_dir, relay) = relay_with(RecordingBackend::default(), config).await;
        relay.save_api_key("u1", "sk-test-123", None).await.unwrap();
        let chat = relay.create_chat("u1", Some("Ctx"), None).await.unwrap();

        relay.send_message("u1", chat.id, "first", None).await.unwrap();
        relay.send_message("u1", chat.id, "second", None).await.unwrap();

        let requests = relay.backend.seen_requests.lock().unwrap();
        let last = requests.last().unwrap();
        let contents: Vec<&str> = last.messages.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, ["first", "You said: first", "second"]);
        assert_eq!(last.messages[1].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn send_without_key_is_rejected_and_not_counted() {
        let (_dir, relay) = relay_with(RecordingBackend::default(), RelayConfig::default()).await;
        let chat = relay.create_chat("u1", None, None).await.unwrap();

        let err = relay.send_message("u1", chat.id, "hello", None).await.unwrap_err();
        assert!(matches!(err, RelayError::MissingApiKey));
        assert_eq!(relay.usage("u1").await.unwrap().daily_used, 0);
    }

    #[tokio::test]
    async fn upstream_failure_refunds_quota() {
        let backend = RecordingBackend {
            fail_with: Some(500),
            ..RecordingBackend::default()
        };
        let (_dir, relay) = relay_with(backend, RelayConfig::default()).await;
        relay.save_api_key("u1", "sk-test-123", None).await.unwrap();
        let chat = relay.create_chat("u1", None, None).await.unwrap();

        let err = relay.send_message("u1", chat.id, "hello", None).await.unwrap_err();
        assert!(matches!(err, RelayError::Completion(_)));

        let usage = relay.usage("u1").await.unwrap();
        assert_eq!(usage.daily_used, 0);
        assert_eq!(usage.total_tokens, 0);
        let thread = relay.chat_thread("u1", chat.id).await.unwrap();
        assert_eq!(thread.messages.len(), 1);
    }

    #[tokio::test]
    async fn quota_blocks_sending_and_chat_creation() {
        let config = RelayConfig {
            limits: UsageLimits {
                daily: 1,
                monthly: 10,
            },
            ..RelayConfig::default()
        };
        let (_dir, relay) = relay_with(RecordingBackend::default(), config).await;
        relay.save_api_key("u1", "sk-test-123", None).await.unwrap();
        let chat = relay.create_chat("u1", None, None).await.unwrap();

        relay.send_message("u1", chat.id, "one", None).await.unwrap();
        let err = relay.send_message("u1", chat.id, "two", None).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::QuotaExceeded {
                window: QuotaWindow::Daily,
                limit: 1
            }
        ));
        assert_eq!(err.to_string(), "Daily limit of 1 requests exceeded");

        let err = relay.create_chat("u1", None, None).await.unwrap_err();
        assert!(matches!(err, RelayError::QuotaExceeded { .. }));
        assert_eq!(relay.backend.seen_keys.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn foreign_chats_are_not_found() {
        let (_dir, relay) = relay_with(RecordingBackend::default(), RelayConfig::default()).await;
        relay.save_api_key("u2", "sk-other", None).await.unwrap();
        let chat = relay.create_chat("u1", None, None).await.unwrap();

        for err in [
            relay.send_message("u2", chat.id, "hi", None).await.unwrap_err(),
            relay.chat_thread("u2", chat.id).await.unwrap_err(),
            relay.rename_chat("u2", chat.id, "mine").await.unwrap_err(),
            relay.delete_chat("u2", chat.id).await.unwrap_err(),
            relay.list_messages("u2", chat.id).await.unwrap_err(),
        ] {
            assert!(matches!(err, RelayError::NotFound("chat")));
        }
    }

    #[tokio::test]
    async fn rejects_blank_input() {
        let (_dir, relay) = relay_with(RecordingBackend::default(), RelayConfig::default()).await;
        let chat = relay.create_chat("u1", None, None).await.unwrap();

        assert!(matches!(
            relay.save_api_key("u1", "   ", None).await,
            Err(RelayError::InvalidInput(_))
        ));
        assert!(matches!(
            relay.send_message("u1", chat.id, "", None).await,
            Err(RelayError::InvalidInput(_))
        ));
        assert!(matches!(
            relay.rename_chat("u1", chat.id, " ").await,
            Err(RelayError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn undecryptable_token_surfaces_codec_error_and_refunds() {
        let (_dir, relay) = relay_with(RecordingBackend::default(), RelayConfig::default()).await;
        relay
            .store
            .upsert_api_key("u1", "openai", "not-a-token", "")
            .await
            .unwrap();
        let chat = relay.create_chat("u1", None, None).await.unwrap();

        let err = relay.send_message("u1", chat.id, "hi", None).await.unwrap_err();
        assert!(matches!(err, RelayError::Codec(CodecError::Format)));
        assert_eq!(relay.usage("u1").await.unwrap().daily_used, 0);
        assert!(relay.backend.seen_keys.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_models_uses_decrypted_key() {
        let (_dir, relay) = relay_with(RecordingBackend::default(), RelayConfig::default()).await;
        assert!(matches!(
            relay.list_models("u1").await,
            Err(RelayError::MissingApiKey)
        ));

        relay.save_api_key("u1", "sk-models", Some("pollinations")).await.unwrap();
        relay.list_models("u1").await.unwrap();
        assert_eq!(
            relay.backend.seen_keys.lock().unwrap().as_slice(),
            ["sk-models".to_string()]
        );
    }

    #[tokio::test]
    async fn requested_model_overrides_default() {
        let (_dir, relay) = relay_with(RecordingBackend::default(), RelayConfig::default()).await;
        relay.save_api_key("u1", "sk-test-123", None).await.unwrap();
        let chat = relay.create_chat("u1", None, None).await.unwrap();

        relay
            .send_message("u1", chat.id, "one", Some("mistral"))
            .await
            .unwrap();
        relay.send_message("u1", chat.id, "two", Some("  ")).await.unwrap();

        let requests = relay.backend.seen_requests.lock().unwrap();
        assert_eq!(requests[0].model, "mistral");
        assert_eq!(requests[1].model, "openai");
    }

    #[tokio::test]
    async fn key_status_carries_preview_not_key() {
        let (_dir, relay) = relay_with(RecordingBackend::default(), RelayConfig::default()).await;

        let status = relay.save_api_key("u1", "sk-test-123", None).await.unwrap();
        assert_eq!(status.key_preview.as_deref(), Some("-123"));
        assert_eq!(status.status, Some(KeyStatus::Active));

        let status = relay.save_api_key("u2", "abcd", None).await.unwrap();
        assert!(status.key_preview.is_none());
        assert!(relay.api_key_status("u3").await.unwrap().status.is_none());
    }

    #[tokio::test]
    async fn rejected_key_is_flagged_until_saved_again() {
        let backend = RecordingBackend {
            fail_with: Some(401),
            ..RecordingBackend::default()
        };
        let (_dir, relay) = relay_with(backend, RelayConfig::default()).await;
        relay.save_api_key("u1", "sk-revoked-key", None).await.unwrap();
        let chat = relay.create_chat("u1", None, None).await.unwrap();

        relay.send_message("u1", chat.id, "hi", None).await.unwrap_err();
        let status = relay.api_key_status("u1").await.unwrap();
        assert_eq!(status.status, Some(KeyStatus::Invalid));

        relay.save_api_key("u1", "sk-fresh-key", None).await.unwrap();
        let status = relay.api_key_status("u1").await.unwrap();
        assert_eq!(status.status, Some(KeyStatus::Active));
    }

    #[tokio::test]
    async fn deleted_key_can_no_longer_be_used() {
        let (_dir, relay) = relay_with(RecordingBackend::default(), RelayConfig::default()).await;
        assert!(matches!(
            relay.delete_api_key("u1").await,
            Err(RelayError::NotFound("API key"))
        ));

        relay.save_api_key("u1", "sk-test-123", None).await.unwrap();
        let chat = relay.create_chat("u1", None, None).await.unwrap();
        relay.delete_api_key("u1").await.unwrap();

        assert!(!relay.api_key_status("u1").await.unwrap().exists);
        assert!(matches!(
            relay.send_message("u1", chat.id, "hi", None).await,
            Err(RelayError::MissingApiKey)
        ));
    }

    /// Answers normally after dropping a table behind the relay's back.
    struct DroppingBackend {
        pool: sqlx::SqlitePool,
        table: &'static str,
    }

    impl CompletionBackend for DroppingBackend {
        async fn complete(
            &self,
            _api_key: &str,
            _request: &CompletionRequest,
        ) -> Result<Completion, CompletionError> {
            let sql = format!("DROP TABLE {}", self.table);
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|err| CompletionError::Malformed(err.to_string()))?;
            Ok(Completion {
                content: "done".to_string(),
                total_tokens: 9,
            })
        }

        async fn list_models(&self, _api_key: &str) -> Result<serde_json::Value, CompletionError> {
            Ok(serde_json::json!([]))
        }
    }

    async fn relay_losing_table(
        table: &'static str,
    ) -> (tempfile::TempDir, ByokRelay<DroppingBackend>) {
        let dir = tempfile::tempdir().unwrap();
        let pool = store::connect(&database_path(&dir)).await.unwrap();
        let backend = DroppingBackend { pool, table };
        let relay = open_relay(&dir, backend, RelayConfig::default()).await;
        (dir, relay)
    }

    #[tokio::test]
    async fn answered_call_keeps_quota_when_bookkeeping_fails() {
        let (_dir, relay) = relay_losing_table("api_keys").await;
        relay.save_api_key("u1", "sk-test-123", None).await.unwrap();
        let chat = relay.create_chat("u1", None, None).await.unwrap();

        let exchange = relay.send_message("u1", chat.id, "hi", None).await.unwrap();
        assert_eq!(exchange.assistant_message.content, "done");

        let usage = relay.usage("u1").await.unwrap();
        assert_eq!(usage.daily_used, 1);
        assert_eq!(usage.monthly_used, 1);
        assert_eq!(usage.total_tokens, 9);
    }

    #[tokio::test]
    async fn answered_call_keeps_quota_when_reply_cannot_be_stored() {
        let (_dir, relay) = relay_losing_table("messages").await;
        relay.save_api_key("u1", "sk-test-123", None).await.unwrap();
        let chat = relay.create_chat("u1", None, None).await.unwrap();

        let err = relay.send_message("u1", chat.id, "hi", None).await.unwrap_err();
        assert!(matches!(err, RelayError::Database(_)));

        let usage = relay.usage("u1").await.unwrap();
        assert_eq!(usage.daily_used, 1);
        assert_eq!(usage.monthly_used, 1);
    }
}
