use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{ChannelId, ClientOperationId, LocalMessage, MessageId, OutgoingOperation, ServerVersion},
    protocol::{MessagePage, MessageQuery, OutboxEvent, RemoteMessage, SendMessageRequest, UpdateMessageRequest},
};

pub mod backoff;
mod claims;
pub mod conflict;
mod coordinator;
pub mod error;
mod events;
pub mod reconciler;

pub use claims::{InflightClaim, InflightClaims};
pub use conflict::{ConflictStrategy, EditConflict, Resolution};
pub use coordinator::{OutboxConfig, SendCoordinator};
pub use error::OutboxError;
pub use events::BroadcastEventBus;
pub use reconciler::{ReconcileReport, CONNECTION_LOST_REASON};

/// Durable local state: message projections, the pending queue and the last
/// known server version of each message.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn store_local_message(&self, message: &LocalMessage) -> Result<()>;
    async fn update_local_message(&self, message: &LocalMessage) -> Result<()>;
    async fn get_local_message(&self, id: &ClientOperationId) -> Result<Option<LocalMessage>>;
    async fn find_local_message_by_server_id(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<LocalMessage>>;
    async fn remove_local_message(&self, id: &ClientOperationId) -> Result<()>;

    async fn add_pending(&self, operation: &OutgoingOperation) -> Result<()>;
    async fn update_pending(&self, operation: &OutgoingOperation) -> Result<()>;
    async fn remove_pending(&self, id: &ClientOperationId) -> Result<()>;
    async fn get_pending_message(
        &self,
        id: &ClientOperationId,
    ) -> Result<Option<OutgoingOperation>>;
    /// Every queued operation, oldest first.
    async fn get_pending(&self) -> Result<Vec<OutgoingOperation>>;

    async fn store_server_version(&self, version: &ServerVersion) -> Result<()>;
    async fn get_server_version(&self, message_id: &MessageId) -> Result<Option<ServerVersion>>;
}

/// The message backend. Implementations must honor
/// `SendMessageRequest::client_operation_id` as an idempotency key.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn send_message(
        &self,
        channel_id: &ChannelId,
        request: &SendMessageRequest,
    ) -> Result<RemoteMessage>;
    async fn update_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        request: &UpdateMessageRequest,
    ) -> Result<()>;
    async fn delete_message(&self, channel_id: &ChannelId, message_id: &MessageId) -> Result<()>;
    async fn query_messages(&self, channel_id: &ChannelId, query: &MessageQuery)
        -> Result<MessagePage>;
}

pub trait EventBus: Send + Sync {
    fn publish(&self, event: OutboxEvent);
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
