use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::{
    domain::{ConversationId, LocalId, MessageKind, RecordId, UserId},
    protocol::{CommissionRequestDetails, MessagePayload, SendMessageRequest},
};

use crate::error::ChatError;

/// One entry of a conversation timeline, either confirmed by the backend or
/// still pending locally.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: RecordId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub is_pending: bool,
    pub is_read: bool,
}

impl MessageRecord {
    pub(crate) fn pending(
        local_id: LocalId,
        conversation_id: ConversationId,
        sender_id: UserId,
        outgoing: &OutgoingMessage,
        created_at: DateTime<Utc>,
    ) -> Self {
        let request = outgoing.to_request();
        Self {
            id: RecordId::Local(local_id),
            conversation_id,
            sender_id,
            kind: request.kind,
            content: request.content,
            media_url: request.media_url,
            metadata: request.metadata,
            created_at,
            is_pending: true,
            is_read: false,
        }
    }

    pub fn commission_details(&self) -> Option<CommissionRequestDetails> {
        (self.kind == MessageKind::CommissionRequest)
            .then(|| CommissionRequestDetails::from_metadata(self.metadata.as_ref()))
    }
}

impl From<MessagePayload> for MessageRecord {
    fn from(payload: MessagePayload) -> Self {
        Self {
            id: RecordId::Server(payload.id),
            conversation_id: payload.conversation_id,
            sender_id: payload.sender_id,
            kind: payload.kind,
            content: payload.content,
            media_url: payload.media_url,
            metadata: payload.metadata,
            created_at: payload.created_at,
            is_pending: false,
            is_read: payload.is_read,
        }
    }
}

/// Reference to an image the upload endpoint has already stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedMedia {
    url: String,
}

impl UploadedMedia {
    pub fn new(url: impl Into<String>) -> Result<Self, ChatError> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(ChatError::InvalidMedia);
        }
        Ok(Self { url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingMessage {
    Text {
        content: String,
    },
    Image {
        media: UploadedMedia,
    },
    CommissionRequest {
        content: String,
        details: CommissionRequestDetails,
    },
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Result<Self, ChatError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        Ok(Self::Text { content })
    }

    pub fn image(media: UploadedMedia) -> Self {
        Self::Image { media }
    }

    pub fn commission_request(
        content: impl Into<String>,
        details: CommissionRequestDetails,
    ) -> Result<Self, ChatError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        Ok(Self::CommissionRequest { content, details })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            OutgoingMessage::Text { .. } => MessageKind::Text,
            OutgoingMessage::Image { .. } => MessageKind::Image,
            OutgoingMessage::CommissionRequest { .. } => MessageKind::CommissionRequest,
        }
    }

    /// Text to put back into the composer after a failed send.
    pub fn draft_text(&self) -> Option<&str> {
        match self {
            OutgoingMessage::Text { content }
            | OutgoingMessage::CommissionRequest { content, .. } => Some(content),
            OutgoingMessage::Image { .. } => None,
        }
    }

    pub fn to_request(&self) -> SendMessageRequest {
        match self {
            OutgoingMessage::Text { content } => SendMessageRequest {
                kind: MessageKind::Text,
                content: Some(content.clone()),
                media_url: None,
                metadata: None,
            },
            OutgoingMessage::Image { media } => SendMessageRequest {
                kind: MessageKind::Image,
                content: None,
                media_url: Some(media.url().to_string()),
                metadata: None,
            },
            OutgoingMessage::CommissionRequest { content, details } => SendMessageRequest {
                kind: MessageKind::CommissionRequest,
                content: Some(content.clone()),
                media_url: None,
                metadata: Some(details.to_metadata()),
            },
        }
    }
}

/// Identity used to pair a confirmed record with the pending one it replaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct MatchKey {
    sender_id: UserId,
    kind: MessageKind,
    payload: String,
}

impl MatchKey {
    pub(crate) fn of(record: &MessageRecord) -> Self {
        let payload = match record.kind {
            MessageKind::Image => record.media_url.clone(),
            _ => record.content.clone(),
        };
        Self {
            sender_id: record.sender_id.clone(),
            kind: record.kind,
            payload: payload.unwrap_or_default(),
        }
    }
}
