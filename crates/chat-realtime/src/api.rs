//! Persistence API client.

use std::time::Duration;

use async_trait::async_trait;
use chat_core::{
    ChatError, ChatErrorCategory, ChatMessage, ConversationKey, ConversationSummary, SendRequest,
    UserId, UserProfile, classify_http_status,
};
use chat_platform::BearerToken;
use reqwest::{Client, RequestBuilder, Response, header::RETRY_AFTER};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, warn};
use url::Url;

/// REST operations the runtime needs. Every call carries the bearer token.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_conversations(
        &self,
        bearer: &BearerToken,
        user_id: UserId,
    ) -> Result<Vec<ConversationSummary>, ChatError>;

    async fn fetch_messages(
        &self,
        bearer: &BearerToken,
        conversation: ConversationKey,
    ) -> Result<Vec<ChatMessage>, ChatError>;

    async fn send_message(
        &self,
        bearer: &BearerToken,
        request: &SendRequest,
    ) -> Result<ChatMessage, ChatError>;

    async fn fetch_user_profile(
        &self,
        bearer: &BearerToken,
        user_id: UserId,
    ) -> Result<UserProfile, ChatError>;

    /// Persist that everything `sender_id` sent to `receiver_id` was read.
    async fn mark_read(
        &self,
        bearer: &BearerToken,
        sender_id: UserId,
        receiver_id: UserId,
    ) -> Result<(), ChatError>;

    /// Server-side count of unread messages from `sender_id` to `receiver_id`.
    async fn fetch_unread_count(
        &self,
        bearer: &BearerToken,
        sender_id: UserId,
        receiver_id: UserId,
    ) -> Result<u32, ChatError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadMarkRequest {
    sender_id: UserId,
    receiver_id: UserId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnreadCountResponse {
    unread_count: u32,
}

#[derive(Debug, Clone)]
pub struct HttpChatApi {
    http: Client,
    base: Url,
}

impl HttpChatApi {
    pub fn new(base: Url, request_timeout: Duration) -> Result<Self, ChatError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| {
                ChatError::new(
                    ChatErrorCategory::Config,
                    "http_client_build_error",
                    err.to_string(),
                )
            })?;
        Ok(Self {
            http,
            base: with_trailing_slash(base),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, ChatError> {
        self.base.join(path).map_err(|err| {
            ChatError::new(
                ChatErrorCategory::Config,
                "invalid_api_url",
                format!("cannot build '{path}' from {}: {err}", self.base),
            )
        })
    }

    fn unread_count_url(&self, sender_id: UserId, receiver_id: UserId) -> Result<Url, ChatError> {
        let mut url = self.endpoint("messages/unread-count")?;
        url.query_pairs_mut()
            .append_pair("senderId", &sender_id.to_string())
            .append_pair("receiverId", &receiver_id.to_string());
        Ok(url)
    }

    async fn fetch_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ChatError> {
        let response = request.send().await.map_err(map_reqwest_error)?;
        let response = check_status(response).await?;
        response.json::<T>().await.map_err(|err| {
            ChatError::new(
                ChatErrorCategory::Serialization,
                "response_decode_error",
                err.to_string(),
            )
        })
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_conversations(
        &self,
        bearer: &BearerToken,
        user_id: UserId,
    ) -> Result<Vec<ConversationSummary>, ChatError> {
        let url = self.endpoint(&format!("messages/conversations/{user_id}"))?;
        debug!(%url, "fetching conversations");
        self.fetch_json(self.http.get(url).bearer_auth(bearer.expose()))
            .await
    }

    async fn fetch_messages(
        &self,
        bearer: &BearerToken,
        conversation: ConversationKey,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let url = self.endpoint(&format!("messages/conversation/{conversation}"))?;
        debug!(%url, "fetching conversation history");
        self.fetch_json(self.http.get(url).bearer_auth(bearer.expose()))
            .await
    }

    async fn send_message(
        &self,
        bearer: &BearerToken,
        request: &SendRequest,
    ) -> Result<ChatMessage, ChatError> {
        let url = self.endpoint("messages")?;
        self.fetch_json(
            self.http
                .post(url)
                .bearer_auth(bearer.expose())
                .json(request),
        )
        .await
    }

    async fn fetch_user_profile(
        &self,
        bearer: &BearerToken,
        user_id: UserId,
    ) -> Result<UserProfile, ChatError> {
        let url = self.endpoint(&format!("users/{user_id}"))?;
        self.fetch_json(self.http.get(url).bearer_auth(bearer.expose()))
            .await
    }

    async fn mark_read(
        &self,
        bearer: &BearerToken,
        sender_id: UserId,
        receiver_id: UserId,
    ) -> Result<(), ChatError> {
        let url = self.endpoint("messages/mark-read")?;
        debug!(sender_id, receiver_id, "persisting read state");
        let response = self
            .http
            .post(url)
            .bearer_auth(bearer.expose())
            .json(&ReadMarkRequest {
                sender_id,
                receiver_id,
            })
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_status(response).await.map(|_| ())
    }

    async fn fetch_unread_count(
        &self,
        bearer: &BearerToken,
        sender_id: UserId,
        receiver_id: UserId,
    ) -> Result<u32, ChatError> {
        let url = self.unread_count_url(sender_id, receiver_id)?;
        let body: UnreadCountResponse = self
            .fetch_json(self.http.get(url).bearer_auth(bearer.expose()))
            .await?;
        Ok(body.unread_count)
    }
}

fn with_trailing_slash(mut base: Url) -> Url {
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base
}

async fn check_status(response: Response) -> Result<Response, ChatError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), "persistence api request failed");

    let message = if body.trim().is_empty() {
        format!("request failed with status {status}")
    } else {
        format!("request failed with status {status}: {}", body.trim())
    };
    let error = ChatError::new(
        classify_http_status(status.as_u16()),
        format!("http_{}", status.as_u16()),
        message,
    );
    Err(match retry_after {
        Some(delay) => error.with_retry_after(delay),
        None => error,
    })
}

fn map_reqwest_error(err: reqwest::Error) -> ChatError {
    if err.is_timeout() {
        ChatError::transport("http_timeout", err.to_string())
    } else if err.is_decode() {
        ChatError::new(
            ChatErrorCategory::Serialization,
            "response_decode_error",
            err.to_string(),
        )
    } else if let Some(status) = err.status() {
        ChatError::new(
            classify_http_status(status.as_u16()),
            format!("http_{}", status.as_u16()),
            err.to_string(),
        )
    } else {
        ChatError::transport("http_transport_error", err.to_string())
    }
}
