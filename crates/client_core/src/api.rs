use std::fmt;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use shared::{
    domain::{ConversationId, ConversationSummary},
    error::{ApiError, ErrorCode},
    protocol::{MessagePayload, SendMessageRequest, UploadResponse},
};
use tracing::debug;

use crate::{error::ChatError, message::UploadedMedia};

/// Bearer credential supplied by the auth layer. Opaque to this crate.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait MessageApi: Send + Sync {
    async fn fetch_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationSummary>;
    async fn fetch_messages(&self, conversation_id: &ConversationId)
        -> Result<Vec<MessagePayload>>;
    /// Persists a message and returns the confirmed record.
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        request: &SendMessageRequest,
    ) -> Result<MessagePayload>;
    async fn mark_read(&self, conversation_id: &ConversationId) -> Result<()>;
    async fn upload_image(&self, upload: ImageUpload) -> Result<UploadedMedia>;
}

pub struct HttpMessageApi {
    http: Client,
    base_url: String,
    token: AuthToken,
}

impl HttpMessageApi {
    pub fn new(base_url: impl Into<String>, token: AuthToken) -> Self {
        Self::with_client(Client::new(), base_url, token)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>, token: AuthToken) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            token,
        }
    }

    fn conversation_url(&self, conversation_id: &ConversationId, suffix: &str) -> String {
        format!(
            "{}/conversations/{}{suffix}",
            self.base_url,
            conversation_id.as_str()
        )
    }
}

/// Maps non-success responses to `ChatError::Api`, decoding the backend's
/// error body when it has one.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ApiError>(&body) {
        Ok(error) => (error.code, error.message),
        Err(_) => (
            ErrorCode::Unknown,
            status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string(),
        ),
    };
    Err(ChatError::Api {
        status,
        code,
        message,
    }
    .into())
}

#[async_trait]
impl MessageApi for HttpMessageApi {
    async fn fetch_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationSummary> {
        let response = self
            .http
            .get(self.conversation_url(conversation_id, ""))
            .bearer_auth(self.token.expose())
            .send()
            .await
            .with_context(|| format!("failed to fetch conversation {conversation_id}"))?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessagePayload>> {
        let response = self
            .http
            .get(self.conversation_url(conversation_id, "/messages"))
            .bearer_auth(self.token.expose())
            .send()
            .await
            .with_context(|| format!("failed to fetch messages for {conversation_id}"))?;
        let messages: Vec<MessagePayload> = check_status(response).await?.json().await?;
        debug!(
            conversation_id = %conversation_id,
            count = messages.len(),
            "api: fetched message history"
        );
        Ok(messages)
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        request: &SendMessageRequest,
    ) -> Result<MessagePayload> {
        let response = self
            .http
            .post(self.conversation_url(conversation_id, "/messages"))
            .bearer_auth(self.token.expose())
            .json(request)
            .send()
            .await
            .with_context(|| format!("failed to post message to {conversation_id}"))?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn mark_read(&self, conversation_id: &ConversationId) -> Result<()> {
        let response = self
            .http
            .post(self.conversation_url(conversation_id, "/read"))
            .bearer_auth(self.token.expose())
            .send()
            .await
            .with_context(|| format!("failed to mark {conversation_id} read"))?;
        check_status(response).await?;
        Ok(())
    }

    async fn upload_image(&self, upload: ImageUpload) -> Result<UploadedMedia> {
        let response = self
            .http
            .post(format!("{}/uploads", self.base_url))
            .bearer_auth(self.token.expose())
            .query(&[
                ("filename", upload.filename.clone()),
                (
                    "mime_type",
                    upload
                        .mime_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                ),
            ])
            .body(upload.bytes)
            .send()
            .await
            .with_context(|| format!("failed to upload {}", upload.filename))?;
        let uploaded: UploadResponse = check_status(response).await?.json().await?;
        Ok(UploadedMedia::new(uploaded.url)?)
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
