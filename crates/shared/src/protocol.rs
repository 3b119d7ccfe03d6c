use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    Attachment, ChannelId, ClientOperationId, LocalMessage, MessageId, MessageStatus,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
    pub client_operation_id: ClientOperationId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMessageRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageQuery {
    pub limit: u32,
}

/// A message as the server reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_operation_id: Option<ClientOperationId>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl RemoteMessage {
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.updated_at.or(self.created_at)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<RemoteMessage>,
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum OutboxEvent {
    #[serde(rename = "message.new")]
    MessageNew {
        channel_id: ChannelId,
        message: LocalMessage,
    },
    #[serde(rename = "message.updated")]
    MessageUpdated {
        channel_id: ChannelId,
        message: LocalMessage,
    },
    #[serde(rename = "message.deleted")]
    MessageDeleted {
        channel_id: ChannelId,
        client_message_id: ClientOperationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
    },
    #[serde(rename = "message.status_changed")]
    MessageStatusChanged {
        channel_id: ChannelId,
        client_message_id: ClientOperationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        status: MessageStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl OutboxEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageNew { .. } => "message.new",
            Self::MessageUpdated { .. } => "message.updated",
            Self::MessageDeleted { .. } => "message.deleted",
            Self::MessageStatusChanged { .. } => "message.status_changed",
        }
    }

    pub fn status_changed(message: &LocalMessage, error: Option<String>) -> Self {
        Self::MessageStatusChanged {
            channel_id: message.channel_id.clone(),
            client_message_id: message.client_message_id.clone(),
            message_id: message.server_message_id.clone(),
            status: message.status,
            error,
        }
    }
}
