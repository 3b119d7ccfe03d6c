use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(ChannelId);
id_newtype!(MessageId);
id_newtype!(FileId);
id_newtype!(ClientOperationId);

impl ClientOperationId {
    /// UUIDv7: unique across clients and ordered by creation time, so it is
    /// safe to hand to the server as an idempotency key.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Send,
    Edit,
    Delete,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Edit => "edit",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Sending,
    Failed,
}

impl OperationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Failed => "failed",
        }
    }

    /// True while the outcome of the last attempt has not been observed.
    pub fn is_unconfirmed(self) -> bool {
        matches!(self, Self::Pending | Self::Sending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Failed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_id: FileId,
    pub filename: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationPayload {
    Send {
        text: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },
    Edit {
        message_id: MessageId,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_version: Option<u64>,
    },
    Delete {
        message_id: MessageId,
    },
}

impl OperationPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Send { .. } => OperationKind::Send,
            Self::Edit { .. } => OperationKind::Edit,
            Self::Delete { .. } => OperationKind::Delete,
        }
    }
}

/// Durable pending-queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingOperation {
    pub client_operation_id: ClientOperationId,
    pub client_message_id: ClientOperationId,
    pub channel_id: ChannelId,
    pub payload: OperationPayload,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl OutgoingOperation {
    /// A new message: the operation id doubles as the message id.
    pub fn new_send(channel_id: ChannelId, text: String, attachments: Vec<Attachment>) -> Self {
        let id = ClientOperationId::generate();
        Self::with_ids(
            id.clone(),
            id,
            channel_id,
            OperationPayload::Send { text, attachments },
        )
    }

    pub fn new(
        client_message_id: ClientOperationId,
        channel_id: ChannelId,
        payload: OperationPayload,
    ) -> Self {
        Self::with_ids(
            ClientOperationId::generate(),
            client_message_id,
            channel_id,
            payload,
        )
    }

    fn with_ids(
        client_operation_id: ClientOperationId,
        client_message_id: ClientOperationId,
        channel_id: ChannelId,
        payload: OperationPayload,
    ) -> Self {
        Self {
            client_operation_id,
            client_message_id,
            channel_id,
            payload,
            status: OperationStatus::Sending,
            retry_count: 0,
            created_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.payload.kind()
    }
}

/// Optimistic projection of a message as the UI shows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMessage {
    pub client_message_id: ClientOperationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_message_id: Option<MessageId>,
    pub channel_id: ChannelId,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

impl LocalMessage {
    pub fn last_mutation_at(&self) -> DateTime<Utc> {
        self.sent_at.unwrap_or(self.created_at)
    }
}

/// Last server state seen for a message; baseline for edit conflicts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerVersion {
    pub message_id: MessageId,
    pub text: String,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}
