use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{ConversationId, MessageId, MessageKind, UserId};

/// A confirmed message as the backend serializes it, both in HTTP responses
/// and in `new-message` channel frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(alias = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub url: String,
}

/// Typed view over the free-form metadata of a `commission_request` message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommissionRequestDetails {
    pub title: Option<String>,
    pub budget: Option<f64>,
    pub deadline: Option<String>,
    pub commission_id: Option<String>,
}

impl CommissionRequestDetails {
    /// Lenient: missing or mistyped attributes are left as `None`.
    pub fn from_metadata(metadata: Option<&Value>) -> Self {
        let Some(Value::Object(map)) = metadata else {
            return Self::default();
        };

        let text = |key: &str| match map.get(key) {
            Some(Value::String(value)) if !value.is_empty() => Some(value.clone()),
            Some(Value::Number(value)) => Some(value.to_string()),
            _ => None,
        };
        let budget = match map.get("budget") {
            Some(Value::Number(value)) => value.as_f64(),
            Some(Value::String(value)) => value.trim().parse::<f64>().ok(),
            _ => None,
        };

        Self {
            title: text("title"),
            budget,
            deadline: text("deadline"),
            commission_id: text("commissionId"),
        }
    }

    pub fn to_metadata(&self) -> Value {
        let mut map = Map::new();
        if let Some(title) = &self.title {
            map.insert("title".into(), Value::String(title.clone()));
        }
        if let Some(budget) = self.budget {
            if let Some(number) = serde_json::Number::from_f64(budget) {
                map.insert("budget".into(), Value::Number(number));
            }
        }
        if let Some(deadline) = &self.deadline {
            map.insert("deadline".into(), Value::String(deadline.clone()));
        }
        if let Some(commission_id) = &self.commission_id {
            map.insert("commissionId".into(), Value::String(commission_id.clone()));
        }
        Value::Object(map)
    }
}

/// Frames exchanged over the real-time channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ChannelFrame {
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    NewMessage(MessagePayload),
    MessagesRead {
        conversation_id: ConversationId,
        reader_id: UserId,
    },
}
