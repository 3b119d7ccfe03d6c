//! In-memory collaborators shared by the coordinator and reconciler tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ChannelId, ClientOperationId, LocalMessage, MessageId, OutgoingOperation, ServerVersion},
    protocol::{
        MessagePage, MessageQuery, OutboxEvent, RemoteMessage, SendMessageRequest,
        UpdateMessageRequest,
    },
};
use tokio::sync::Notify;

use crate::{EventBus, LocalStore, RemoteService};

#[derive(Default)]
pub struct MemoryStore {
    messages: Mutex<HashMap<ClientOperationId, LocalMessage>>,
    pending: Mutex<Vec<OutgoingOperation>>,
    versions: Mutex<HashMap<MessageId, ServerVersion>>,
    /// The next `store_server_version` call fails.
    pub fail_next_version_store: AtomicBool,
}

impl MemoryStore {
    pub fn message(&self, id: &ClientOperationId) -> Option<LocalMessage> {
        self.messages.lock().unwrap().get(id).cloned()
    }

    pub fn queued(&self, id: &ClientOperationId) -> Option<OutgoingOperation> {
        self.pending
            .lock()
            .unwrap()
            .iter()
            .find(|op| &op.client_operation_id == id)
            .cloned()
    }

    pub fn queue_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn version(&self, message_id: &MessageId) -> Option<ServerVersion> {
        self.versions.lock().unwrap().get(message_id).cloned()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn store_local_message(&self, message: &LocalMessage) -> Result<()> {
        self.messages
            .lock()
            .unwrap()
            .insert(message.client_message_id.clone(), message.clone());
        Ok(())
    }

    async fn update_local_message(&self, message: &LocalMessage) -> Result<()> {
        let mut messages = self.messages.lock().unwrap();
        match messages.get_mut(&message.client_message_id) {
            Some(existing) => {
                *existing = message.clone();
                Ok(())
            }
            None => Err(anyhow!("no local message {}", message.client_message_id)),
        }
    }

    async fn get_local_message(&self, id: &ClientOperationId) -> Result<Option<LocalMessage>> {
        Ok(self.message(id))
    }

    async fn find_local_message_by_server_id(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<LocalMessage>> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .values()
            .find(|m| m.server_message_id.as_ref() == Some(message_id))
            .cloned())
    }

    async fn remove_local_message(&self, id: &ClientOperationId) -> Result<()> {
        self.messages.lock().unwrap().remove(id);
        Ok(())
    }

    async fn add_pending(&self, operation: &OutgoingOperation) -> Result<()> {
        self.pending.lock().unwrap().push(operation.clone());
        Ok(())
    }

    async fn update_pending(&self, operation: &OutgoingOperation) -> Result<()> {
        let mut pending = self.pending.lock().unwrap();
        match pending
            .iter_mut()
            .find(|op| op.client_operation_id == operation.client_operation_id)
        {
            Some(existing) => {
                *existing = operation.clone();
                Ok(())
            }
            None => Err(anyhow!("no pending operation {}", operation.client_operation_id)),
        }
    }

    async fn remove_pending(&self, id: &ClientOperationId) -> Result<()> {
        self.pending
            .lock()
            .unwrap()
            .retain(|op| &op.client_operation_id != id);
        Ok(())
    }

    async fn get_pending_message(
        &self,
        id: &ClientOperationId,
    ) -> Result<Option<OutgoingOperation>> {
        Ok(self.queued(id))
    }

    async fn get_pending(&self) -> Result<Vec<OutgoingOperation>> {
        Ok(self.pending.lock().unwrap().clone())
    }

    async fn store_server_version(&self, version: &ServerVersion) -> Result<()> {
        if self.fail_next_version_store.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("disk I/O error"));
        }
        self.versions
            .lock()
            .unwrap()
            .insert(version.message_id.clone(), version.clone());
        Ok(())
    }

    async fn get_server_version(&self, message_id: &MessageId) -> Result<Option<ServerVersion>> {
        Ok(self.version(message_id))
    }
}

/// A server that dedupes sends on `client_operation_id`.
#[derive(Default)]
pub struct MockRemote {
    messages: Mutex<Vec<RemoteMessage>>,
    next_id: AtomicUsize,
    pub send_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    pub fail_send: AtomicBool,
    /// Record the message, then report an error as if the ack was lost.
    pub lose_ack: AtomicBool,
    pub fail_update: AtomicBool,
    pub fail_delete: AtomicBool,
    pub fail_query: AtomicBool,
    gate: Option<Arc<Notify>>,
    delete_gate: Option<Arc<Notify>>,
}

impl MockRemote {
    /// Every send waits for `gate.notify_one()` before answering.
    pub fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let remote = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (remote, gate)
    }

    /// Every delete waits for `gate.notify_one()` before answering.
    pub fn gated_deletes() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let remote = Self {
            delete_gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (remote, gate)
    }

    pub fn set(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::SeqCst);
    }

    pub fn sends(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> Vec<RemoteMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// Simulates another client editing a message.
    pub fn edit_on_server(
        &self,
        message_id: &MessageId,
        text: &str,
        updated_at: DateTime<Utc>,
        version: Option<u64>,
    ) {
        let mut messages = self.messages.lock().unwrap();
        if let Some(message) = messages.iter_mut().find(|m| &m.id == message_id) {
            message.text = text.to_string();
            message.updated_at = Some(updated_at);
            message.version = version;
        }
    }

    pub fn seed(&self, message: RemoteMessage) {
        self.messages.lock().unwrap().push(message);
    }
}

#[async_trait]
impl RemoteService for MockRemote {
    async fn send_message(
        &self,
        _channel_id: &ChannelId,
        request: &SendMessageRequest,
    ) -> Result<RemoteMessage> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(anyhow!("network unreachable"));
        }

        let stored = {
            let mut messages = self.messages.lock().unwrap();
            match messages
                .iter()
                .find(|m| m.client_operation_id.as_ref() == Some(&request.client_operation_id))
            {
                Some(existing) => existing.clone(),
                None => {
                    let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                    let message = RemoteMessage {
                        id: MessageId::new(format!("srv-{n}")),
                        client_operation_id: Some(request.client_operation_id.clone()),
                        text: request.text.clone(),
                        updated_at: None,
                        created_at: Some(Utc::now()),
                        version: Some(0),
                    };
                    messages.push(message.clone());
                    message
                }
            }
        };

        if self.lose_ack.load(Ordering::SeqCst) {
            return Err(anyhow!("connection reset before response"));
        }
        Ok(stored)
    }

    async fn update_message(
        &self,
        _channel_id: &ChannelId,
        message_id: &MessageId,
        request: &UpdateMessageRequest,
    ) -> Result<()> {
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(anyhow!("update rejected"));
        }
        let mut messages = self.messages.lock().unwrap();
        let message = messages
            .iter_mut()
            .find(|m| &m.id == message_id)
            .ok_or_else(|| anyhow!("message {message_id} not found"))?;
        message.text = request.text.clone();
        message.updated_at = Some(Utc::now());
        message.version = Some(message.version.unwrap_or(0) + 1);
        Ok(())
    }

    async fn delete_message(&self, _channel_id: &ChannelId, message_id: &MessageId) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.delete_gate {
            gate.notified().await;
        }
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(anyhow!("delete rejected"));
        }
        self.messages.lock().unwrap().retain(|m| &m.id != message_id);
        Ok(())
    }

    async fn query_messages(
        &self,
        _channel_id: &ChannelId,
        query: &MessageQuery,
    ) -> Result<MessagePage> {
        if self.fail_query.load(Ordering::SeqCst) {
            return Err(anyhow!("query timed out"));
        }
        let messages = self.messages.lock().unwrap();
        let skip = messages.len().saturating_sub(query.limit as usize);
        Ok(MessagePage {
            messages: messages[skip..].to_vec(),
        })
    }
}

#[derive(Default)]
pub struct RecordingBus {
    events: Mutex<Vec<OutboxEvent>>,
}

impl RecordingBus {
    pub fn take(&self) -> Vec<OutboxEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.take().iter().map(OutboxEvent::name).collect()
    }
}

impl EventBus for RecordingBus {
    fn publish(&self, event: OutboxEvent) {
        self.events.lock().unwrap().push(event);
    }
}
