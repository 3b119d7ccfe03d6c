use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use shared::{
    domain::{
        Attachment, ChannelId, ClientOperationId, LocalMessage, MessageId, MessageStatus,
        OperationKind, OperationPayload, OperationStatus, OutgoingOperation, ServerVersion,
    },
    protocol::{MessageQuery, OutboxEvent, RemoteMessage, SendMessageRequest, UpdateMessageRequest},
};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    conflict::{self, ConflictStrategy, EditConflict, Resolution},
    reconciler::{self, ReconcileReport},
    EventBus, InflightClaim, InflightClaims, LocalStore, OutboxError, RemoteService,
};

type OutboxResult<T> = std::result::Result<T, OutboxError>;

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub max_retries: u32,
    /// How many recent channel messages to scan when checking whether a
    /// failed send landed, or whether an edit conflicts.
    pub reconcile_window: u32,
    pub conflict_strategy: ConflictStrategy,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            reconcile_window: 50,
            conflict_strategy: ConflictStrategy::LastWriteWins,
        }
    }
}

/// Drives optimistic send/edit/delete, explicit retry and cancel.
///
/// Public operations apply their local effects and return; network work runs
/// in tracked background tasks whose outcome is reported through the
/// [`EventBus`]. Failed deliveries are never resubmitted automatically.
pub struct SendCoordinator {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteService>,
    events: Arc<dyn EventBus>,
    config: RwLock<OutboxConfig>,
    claims: InflightClaims,
    // Serializes queue/message mutations. Never held across a network call.
    state: Mutex<()>,
    tasks: Mutex<HashMap<ClientOperationId, JoinHandle<()>>>,
}

impl SendCoordinator {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteService>,
        events: Arc<dyn EventBus>,
        config: OutboxConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            remote,
            events,
            config: RwLock::new(config),
            claims: InflightClaims::new(),
            state: Mutex::new(()),
            tasks: Mutex::new(HashMap::new()),
        })
    }

    pub async fn config(&self) -> OutboxConfig {
        self.config.read().await.clone()
    }

    /// Applies to every resolution from now on.
    pub async fn set_conflict_strategy(&self, strategy: ConflictStrategy) {
        self.config.write().await.conflict_strategy = strategy;
        info!(%strategy, "conflict strategy changed");
    }

    pub fn claims(&self) -> &InflightClaims {
        &self.claims
    }

    pub async fn local_message(&self, id: &ClientOperationId) -> OutboxResult<Option<LocalMessage>> {
        self.store
            .get_local_message(id)
            .await
            .map_err(OutboxError::store)
    }

    pub async fn pending(&self) -> OutboxResult<Vec<OutgoingOperation>> {
        self.store.get_pending().await.map_err(OutboxError::store)
    }

    pub async fn send(
        self: &Arc<Self>,
        channel_id: ChannelId,
        text: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> OutboxResult<LocalMessage> {
        let text = text.into();
        let operation = OutgoingOperation::new_send(channel_id.clone(), text.clone(), attachments.clone());
        let message = LocalMessage {
            client_message_id: operation.client_message_id.clone(),
            server_message_id: None,
            channel_id: channel_id.clone(),
            text,
            attachments,
            status: MessageStatus::Sending,
            created_at: operation.created_at,
            sent_at: None,
        };
        let claim = self.claims.try_claim(&operation.client_operation_id);

        {
            let _state = self.state.lock().await;
            self.store
                .store_local_message(&message)
                .await
                .map_err(OutboxError::store)?;
            self.store
                .add_pending(&operation)
                .await
                .map_err(OutboxError::store)?;
        }

        self.events.publish(OutboxEvent::MessageNew {
            channel_id: channel_id.clone(),
            message: message.clone(),
        });
        info!(
            client_operation_id = %operation.client_operation_id,
            %channel_id,
            "message queued"
        );

        if let Some(claim) = claim {
            self.spawn_attempt(operation, claim).await;
        }
        Ok(message)
    }

    pub async fn edit_message(
        self: &Arc<Self>,
        channel_id: ChannelId,
        message_id: MessageId,
        new_text: impl Into<String>,
    ) -> OutboxResult<LocalMessage> {
        let new_text = new_text.into();
        let state = self.state.lock().await;

        let mut message = self
            .store
            .find_local_message_by_server_id(&message_id)
            .await
            .map_err(OutboxError::store)?
            .ok_or_else(|| OutboxError::UnknownMessage(message_id.clone()))?;
        let baseline = self
            .store
            .get_server_version(&message_id)
            .await
            .map_err(OutboxError::store)?;

        let operation = OutgoingOperation::new(
            message.client_message_id.clone(),
            channel_id.clone(),
            OperationPayload::Edit {
                message_id: message_id.clone(),
                text: new_text.clone(),
                base_version: baseline.as_ref().map(|b| b.version),
            },
        );
        let claim = self.claims.try_claim(&operation.client_operation_id);

        message.text = new_text;
        message.status = MessageStatus::Sending;
        self.store
            .update_local_message(&message)
            .await
            .map_err(OutboxError::store)?;
        self.store
            .add_pending(&operation)
            .await
            .map_err(OutboxError::store)?;
        drop(state);

        self.events.publish(OutboxEvent::MessageUpdated {
            channel_id,
            message: message.clone(),
        });
        info!(
            client_operation_id = %operation.client_operation_id,
            %message_id,
            "edit queued"
        );

        if let Some(claim) = claim {
            self.spawn_attempt(operation, claim).await;
        }
        Ok(message)
    }

    /// Removes the message from the UI immediately and waits for the server.
    ///
    /// On failure the message is restored with `message.new` and the remote
    /// error is returned so the caller can react.
    pub async fn delete_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> OutboxResult<()> {
        let original = self
            .store
            .find_local_message_by_server_id(&message_id)
            .await
            .map_err(OutboxError::store)?
            .ok_or_else(|| OutboxError::UnknownMessage(message_id.clone()))?;
        let operation = OutgoingOperation::new(
            original.client_message_id.clone(),
            channel_id.clone(),
            OperationPayload::Delete {
                message_id: message_id.clone(),
            },
        );
        let _claim = self.claims.try_claim(&operation.client_operation_id);

        {
            let _state = self.state.lock().await;
            self.store
                .add_pending(&operation)
                .await
                .map_err(OutboxError::store)?;
        }
        self.events.publish(OutboxEvent::MessageDeleted {
            channel_id: channel_id.clone(),
            client_message_id: original.client_message_id.clone(),
            message_id: Some(message_id.clone()),
        });

        match self.remote.delete_message(&channel_id, &message_id).await {
            Ok(()) => {
                let still_queued = {
                    let _state = self.state.lock().await;
                    let still_queued = self
                        .store
                        .get_pending_message(&operation.client_operation_id)
                        .await
                        .map_err(OutboxError::store)?
                        .is_some();
                    self.purge_message(&original.client_message_id).await?;
                    still_queued
                };
                info!(%message_id, still_queued, "message deleted");
                if !still_queued {
                    // A cancel restored the message in the meantime.
                    self.events.publish(OutboxEvent::MessageDeleted {
                        channel_id,
                        client_message_id: original.client_message_id,
                        message_id: Some(message_id),
                    });
                }
                Ok(())
            }
            Err(err) => {
                warn!(%message_id, error = %format!("{err:#}"), "delete failed; restoring message");
                let still_queued = {
                    let _state = self.state.lock().await;
                    let still_queued = self
                        .store
                        .get_pending_message(&operation.client_operation_id)
                        .await
                        .map_err(OutboxError::store)?
                        .is_some();
                    if still_queued {
                        self.store
                            .remove_pending(&operation.client_operation_id)
                            .await
                            .map_err(OutboxError::store)?;
                    }
                    still_queued
                };
                if still_queued {
                    self.events.publish(OutboxEvent::MessageNew {
                        channel_id,
                        message: original,
                    });
                }
                Err(OutboxError::remote(err))
            }
        }
    }

    /// Re-attempts a failed operation with the same `client_operation_id`.
    ///
    /// A retry while an attempt for the id is still running is a no-op, as is
    /// a retry for an id with nothing queued (unless the message is already
    /// sent, which is rejected).
    pub async fn retry(self: &Arc<Self>, id: &ClientOperationId) -> OutboxResult<()> {
        let Some(claim) = self.claims.try_claim(id) else {
            debug!(client_operation_id = %id, "attempt already in flight; ignoring retry");
            return Ok(());
        };
        let max_retries = self.config.read().await.max_retries;
        let state = self.state.lock().await;

        let Some(mut operation) = self
            .store
            .get_pending_message(id)
            .await
            .map_err(OutboxError::store)?
        else {
            let local = self
                .store
                .get_local_message(id)
                .await
                .map_err(OutboxError::store)?;
            if local.is_some_and(|message| message.status == MessageStatus::Sent) {
                return Err(OutboxError::invalid_state(id, MessageStatus::Sent.as_str()));
            }
            debug!(client_operation_id = %id, "nothing queued; retry is a no-op");
            return Ok(());
        };

        if operation.status != OperationStatus::Failed {
            return Err(OutboxError::invalid_state(id, operation.status.as_str()));
        }
        if operation.retry_count + 1 > max_retries {
            return Err(OutboxError::RetriesExhausted {
                id: id.clone(),
                max_retries,
            });
        }

        operation.retry_count += 1;
        operation.status = OperationStatus::Sending;
        operation.last_error = None;
        self.store
            .update_pending(&operation)
            .await
            .map_err(OutboxError::store)?;

        let mut events = Vec::new();
        if let Some(mut message) = self
            .store
            .get_local_message(&operation.client_message_id)
            .await
            .map_err(OutboxError::store)?
        {
            message.status = MessageStatus::Sending;
            self.store
                .update_local_message(&message)
                .await
                .map_err(OutboxError::store)?;
            events.push(OutboxEvent::status_changed(&message, None));
            if let OperationPayload::Delete { message_id } = &operation.payload {
                events.push(OutboxEvent::MessageDeleted {
                    channel_id: operation.channel_id.clone(),
                    client_message_id: message.client_message_id.clone(),
                    message_id: Some(message_id.clone()),
                });
            }
        }
        drop(state);

        info!(
            client_operation_id = %id,
            retry_count = operation.retry_count,
            max_retries,
            "retrying operation"
        );
        for event in events {
            self.events.publish(event);
        }
        self.spawn_attempt(operation, claim).await;
        Ok(())
    }

    /// Drops a queued operation and undoes its optimistic effect.
    ///
    /// A request that was already dispatched is not aborted. If it later
    /// succeeds, the server's outcome is applied and re-surfaced.
    pub async fn cancel(&self, id: &ClientOperationId) -> OutboxResult<()> {
        let state = self.state.lock().await;
        let Some(operation) = self
            .store
            .get_pending_message(id)
            .await
            .map_err(OutboxError::store)?
        else {
            debug!(client_operation_id = %id, "nothing queued; cancel is a no-op");
            return Ok(());
        };
        self.store
            .remove_pending(id)
            .await
            .map_err(OutboxError::store)?;

        let local = self
            .store
            .get_local_message(&operation.client_message_id)
            .await
            .map_err(OutboxError::store)?;
        let event = match (&operation.payload, local) {
            (OperationPayload::Send { .. }, _) => {
                self.store
                    .remove_local_message(&operation.client_message_id)
                    .await
                    .map_err(OutboxError::store)?;
                Some(OutboxEvent::MessageDeleted {
                    channel_id: operation.channel_id.clone(),
                    client_message_id: operation.client_message_id.clone(),
                    message_id: None,
                })
            }
            (OperationPayload::Edit { message_id, .. }, Some(mut message)) => {
                if let Some(baseline) = self
                    .store
                    .get_server_version(message_id)
                    .await
                    .map_err(OutboxError::store)?
                {
                    message.text = baseline.text;
                }
                message.status = MessageStatus::Sent;
                self.store
                    .update_local_message(&message)
                    .await
                    .map_err(OutboxError::store)?;
                Some(OutboxEvent::MessageUpdated {
                    channel_id: operation.channel_id.clone(),
                    message,
                })
            }
            (OperationPayload::Delete { .. }, Some(mut message)) => {
                message.status = MessageStatus::Sent;
                self.store
                    .update_local_message(&message)
                    .await
                    .map_err(OutboxError::store)?;
                Some(OutboxEvent::MessageNew {
                    channel_id: operation.channel_id.clone(),
                    message,
                })
            }
            (_, None) => None,
        };
        drop(state);

        info!(
            client_operation_id = %id,
            kind = operation.kind().as_str(),
            in_flight = self.claims.is_claimed(id),
            "operation cancelled"
        );
        if let Some(event) = event {
            self.events.publish(event);
        }
        Ok(())
    }

    /// Marks every unconfirmed queue entry left by a previous process as
    /// failed. Run at startup and after reconnecting.
    pub async fn process_pending(&self) -> OutboxResult<ReconcileReport> {
        let _state = self.state.lock().await;
        let report =
            reconciler::reconcile_pending(self.store.as_ref(), self.events.as_ref(), &self.claims)
                .await
                .map_err(OutboxError::store)?;
        info!(
            scanned = report.scanned,
            marked_failed = report.marked_failed.len(),
            skipped_in_flight = report.skipped_in_flight.len(),
            "pending queue reconciled"
        );
        Ok(report)
    }

    /// Looks the message up in the channel's recent window. A failing query
    /// is treated as "no conflict".
    pub async fn detect_conflict(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        local_text: &str,
    ) -> Option<EditConflict> {
        let limit = self.config.read().await.reconcile_window;
        match self
            .remote
            .query_messages(channel_id, &MessageQuery { limit })
            .await
        {
            Ok(page) => conflict::find_conflict(&page.messages, message_id, local_text),
            Err(err) => {
                warn!(%message_id, error = %format!("{err:#}"), "conflict check failed; assuming no conflict");
                None
            }
        }
    }

    /// Applies the configured strategy to a detected conflict.
    pub async fn resolve_conflict(
        &self,
        message_id: &MessageId,
        conflict: &EditConflict,
    ) -> OutboxResult<Resolution> {
        let (resolution, events) = {
            let _state = self.state.lock().await;
            self.resolve_locked(message_id, conflict).await?
        };
        for event in events {
            self.events.publish(event);
        }
        Ok(resolution)
    }

    /// Waits for every background delivery task started so far.
    pub async fn wait_idle(&self) {
        loop {
            let handles: Vec<_> = {
                let mut tasks = self.tasks.lock().await;
                tasks.drain().map(|(_, handle)| handle).collect()
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(err) = handle.await {
                    error!(error = %err, "delivery task panicked");
                }
            }
        }
    }

    async fn spawn_attempt(self: &Arc<Self>, operation: OutgoingOperation, claim: InflightClaim) {
        let id = operation.client_operation_id.clone();
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            coordinator.attempt(operation, claim).await;
        });
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(id, handle);
    }

    async fn attempt(&self, operation: OutgoingOperation, claim: InflightClaim) {
        let events = match self.deliver(&operation).await {
            Ok(events) => events,
            Err(err) => {
                error!(
                    client_operation_id = %operation.client_operation_id,
                    error = %err,
                    "failed to record delivery outcome"
                );
                // Leave the entry retryable rather than stuck in `sending`.
                match self.fail_operation(&operation, err.to_string()).await {
                    Ok(events) => events,
                    Err(err) => {
                        error!(
                            client_operation_id = %operation.client_operation_id,
                            error = %err,
                            "failed to mark operation failed"
                        );
                        Vec::new()
                    }
                }
            }
        };
        // Release before announcing the outcome so a retry triggered by the
        // event is not mistaken for a concurrent attempt.
        drop(claim);
        for event in events {
            self.events.publish(event);
        }
    }

    async fn deliver(&self, operation: &OutgoingOperation) -> OutboxResult<Vec<OutboxEvent>> {
        debug!(
            client_operation_id = %operation.client_operation_id,
            kind = operation.kind().as_str(),
            retry_count = operation.retry_count,
            "delivering"
        );
        match &operation.payload {
            OperationPayload::Send { text, attachments } => {
                self.deliver_send(operation, text, attachments).await
            }
            OperationPayload::Edit {
                message_id,
                text,
                base_version,
            } => {
                self.deliver_edit(operation, message_id, text, *base_version)
                    .await
            }
            OperationPayload::Delete { message_id } => {
                self.deliver_delete(operation, message_id).await
            }
        }
    }

    async fn deliver_send(
        &self,
        operation: &OutgoingOperation,
        text: &str,
        attachments: &[Attachment],
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let id = &operation.client_operation_id;
        let request = SendMessageRequest {
            text: text.to_string(),
            client_operation_id: id.clone(),
            attachments: attachments.to_vec(),
        };

        let outcome = match self.remote.send_message(&operation.channel_id, &request).await {
            Ok(remote) => Ok(remote),
            Err(err) => {
                warn!(
                    client_operation_id = %id,
                    error = %format!("{err:#}"),
                    "send failed; checking whether the server recorded it"
                );
                match self.find_delivered(&operation.channel_id, id).await {
                    Some(remote) => {
                        info!(client_operation_id = %id, message_id = %remote.id, "send landed despite the error");
                        Ok(remote)
                    }
                    None => Err(err),
                }
            }
        };

        match outcome {
            Ok(remote) => self.finish_send(operation, text, attachments, remote).await,
            Err(err) => self.fail_operation(operation, format!("{err:#}")).await,
        }
    }

    async fn find_delivered(
        &self,
        channel_id: &ChannelId,
        id: &ClientOperationId,
    ) -> Option<RemoteMessage> {
        let limit = self.config.read().await.reconcile_window;
        match self
            .remote
            .query_messages(channel_id, &MessageQuery { limit })
            .await
        {
            Ok(page) => page
                .messages
                .into_iter()
                .find(|message| message.client_operation_id.as_ref() == Some(id)),
            Err(err) => {
                warn!(client_operation_id = %id, error = %format!("{err:#}"), "reconciliation query failed");
                None
            }
        }
    }

    async fn finish_send(
        &self,
        operation: &OutgoingOperation,
        text: &str,
        attachments: &[Attachment],
        remote: RemoteMessage,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let _state = self.state.lock().await;
        let now = Utc::now();
        let still_queued = self
            .store
            .get_pending_message(&operation.client_operation_id)
            .await
            .map_err(OutboxError::store)?
            .is_some();

        let existing = self
            .store
            .get_local_message(&operation.client_message_id)
            .await
            .map_err(OutboxError::store)?;
        let existed = existing.is_some();
        let mut message = existing.unwrap_or_else(|| LocalMessage {
            client_message_id: operation.client_message_id.clone(),
            server_message_id: None,
            channel_id: operation.channel_id.clone(),
            text: text.to_string(),
            attachments: attachments.to_vec(),
            status: MessageStatus::Sending,
            created_at: operation.created_at,
            sent_at: None,
        });
        message.server_message_id = Some(remote.id.clone());
        message.status = MessageStatus::Sent;
        message.sent_at = Some(now);

        self.store
            .store_server_version(&ServerVersion {
                message_id: remote.id.clone(),
                text: remote.text.clone(),
                updated_at: remote.last_modified().unwrap_or(now),
                version: remote.version.unwrap_or(0),
            })
            .await
            .map_err(OutboxError::store)?;
        let saved = if existed {
            self.store.update_local_message(&message).await
        } else {
            self.store.store_local_message(&message).await
        };
        saved.map_err(OutboxError::store)?;

        if still_queued {
            self.store
                .remove_pending(&operation.client_operation_id)
                .await
                .map_err(OutboxError::store)?;
            info!(
                client_operation_id = %operation.client_operation_id,
                message_id = %remote.id,
                "message sent"
            );
            return Ok(vec![OutboxEvent::status_changed(&message, None)]);
        }

        info!(
            client_operation_id = %operation.client_operation_id,
            message_id = %remote.id,
            "send completed after cancel; re-surfacing message"
        );
        Ok(vec![OutboxEvent::MessageNew {
            channel_id: message.channel_id.clone(),
            message,
        }])
    }

    async fn deliver_edit(
        &self,
        operation: &OutgoingOperation,
        message_id: &MessageId,
        text: &str,
        base_version: Option<u64>,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let request = UpdateMessageRequest {
            text: text.to_string(),
        };
        let err = match self
            .remote
            .update_message(&operation.channel_id, message_id, &request)
            .await
        {
            Ok(()) => return self.finish_edit(operation, message_id, text, base_version).await,
            Err(err) => err,
        };
        warn!(
            client_operation_id = %operation.client_operation_id,
            %message_id,
            error = %format!("{err:#}"),
            "edit failed; checking for a conflicting server edit"
        );

        let Some(conflict) = self
            .detect_conflict(&operation.channel_id, message_id, text)
            .await
        else {
            return self.fail_operation(operation, format!("{err:#}")).await;
        };

        let state = self.state.lock().await;
        let (resolution, events) = self.resolve_locked(message_id, &conflict).await?;
        if resolution == Resolution::AcceptServer {
            self.store
                .remove_pending(&operation.client_operation_id)
                .await
                .map_err(OutboxError::store)?;
            return Ok(events);
        }
        drop(state);

        self.fail_operation(
            operation,
            format!("edit conflicts with server text; local text kept: {err:#}"),
        )
        .await
    }

    async fn finish_edit(
        &self,
        operation: &OutgoingOperation,
        message_id: &MessageId,
        text: &str,
        base_version: Option<u64>,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let _state = self.state.lock().await;
        let still_queued = self
            .store
            .get_pending_message(&operation.client_operation_id)
            .await
            .map_err(OutboxError::store)?
            .is_some();

        self.store
            .store_server_version(&ServerVersion {
                message_id: message_id.clone(),
                text: text.to_string(),
                updated_at: Utc::now(),
                version: base_version.map_or(1, |version| version + 1),
            })
            .await
            .map_err(OutboxError::store)?;
        if still_queued {
            self.store
                .remove_pending(&operation.client_operation_id)
                .await
                .map_err(OutboxError::store)?;
        }

        let Some(mut message) = self
            .store
            .get_local_message(&operation.client_message_id)
            .await
            .map_err(OutboxError::store)?
        else {
            return Ok(Vec::new());
        };
        message.text = text.to_string();
        message.status = MessageStatus::Sent;
        self.store
            .update_local_message(&message)
            .await
            .map_err(OutboxError::store)?;

        info!(
            client_operation_id = %operation.client_operation_id,
            %message_id,
            still_queued,
            "edit confirmed"
        );
        if still_queued {
            Ok(vec![OutboxEvent::status_changed(&message, None)])
        } else {
            Ok(vec![OutboxEvent::MessageUpdated {
                channel_id: message.channel_id.clone(),
                message,
            }])
        }
    }

    async fn deliver_delete(
        &self,
        operation: &OutgoingOperation,
        message_id: &MessageId,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        match self
            .remote
            .delete_message(&operation.channel_id, message_id)
            .await
        {
            Ok(()) => {
                let _state = self.state.lock().await;
                let still_queued = self
                    .store
                    .get_pending_message(&operation.client_operation_id)
                    .await
                    .map_err(OutboxError::store)?
                    .is_some();
                self.purge_message(&operation.client_message_id).await?;
                info!(%message_id, "message deleted");
                if still_queued {
                    Ok(Vec::new())
                } else {
                    Ok(vec![OutboxEvent::MessageDeleted {
                        channel_id: operation.channel_id.clone(),
                        client_message_id: operation.client_message_id.clone(),
                        message_id: Some(message_id.clone()),
                    }])
                }
            }
            Err(err) => self.fail_operation(operation, format!("{err:#}")).await,
        }
    }

    /// Records a failed attempt. A failure for an operation that was
    /// cancelled meanwhile is dropped.
    async fn fail_operation(
        &self,
        operation: &OutgoingOperation,
        reason: String,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let _state = self.state.lock().await;
        let id = &operation.client_operation_id;
        let Some(mut queued) = self
            .store
            .get_pending_message(id)
            .await
            .map_err(OutboxError::store)?
        else {
            debug!(client_operation_id = %id, "operation was cancelled; dropping failure");
            return Ok(Vec::new());
        };
        queued.status = OperationStatus::Failed;
        queued.last_error = Some(reason.clone());
        self.store
            .update_pending(&queued)
            .await
            .map_err(OutboxError::store)?;
        warn!(
            client_operation_id = %id,
            kind = operation.kind().as_str(),
            retry_count = queued.retry_count,
            error = %reason,
            "operation failed; waiting for an explicit retry"
        );

        let mut events = Vec::new();
        match self
            .store
            .get_local_message(&operation.client_message_id)
            .await
            .map_err(OutboxError::store)?
        {
            Some(mut message) => {
                message.status = MessageStatus::Failed;
                self.store
                    .update_local_message(&message)
                    .await
                    .map_err(OutboxError::store)?;
                if operation.kind() == OperationKind::Delete {
                    events.push(OutboxEvent::MessageNew {
                        channel_id: message.channel_id.clone(),
                        message: message.clone(),
                    });
                }
                events.push(OutboxEvent::status_changed(&message, Some(reason)));
            }
            None => events.push(OutboxEvent::MessageStatusChanged {
                channel_id: operation.channel_id.clone(),
                client_message_id: operation.client_message_id.clone(),
                message_id: None,
                status: MessageStatus::Failed,
                error: Some(reason),
            }),
        }
        Ok(events)
    }

    /// Caller holds the state lock.
    async fn resolve_locked(
        &self,
        message_id: &MessageId,
        conflict: &EditConflict,
    ) -> OutboxResult<(Resolution, Vec<OutboxEvent>)> {
        let strategy = self.config.read().await.conflict_strategy;
        let baseline = self
            .store
            .get_server_version(message_id)
            .await
            .map_err(OutboxError::store)?;
        let server_version = ServerVersion {
            message_id: message_id.clone(),
            text: conflict.server_text.clone(),
            updated_at: conflict.server_updated_at,
            version: conflict
                .server_version
                .unwrap_or_else(|| baseline.as_ref().map_or(0, |b| b.version + 1)),
        };

        let Some(mut local) = self
            .store
            .find_local_message_by_server_id(message_id)
            .await
            .map_err(OutboxError::store)?
        else {
            debug!(%message_id, "no local copy; recording server state");
            self.store
                .store_server_version(&server_version)
                .await
                .map_err(OutboxError::store)?;
            return Ok((Resolution::AcceptServer, Vec::new()));
        };

        let resolution = conflict::decide(strategy, &local, baseline.as_ref(), conflict);
        info!(%message_id, %strategy, ?resolution, "edit conflict resolved");
        if resolution == Resolution::KeepLocal {
            return Ok((resolution, Vec::new()));
        }

        local.text = conflict.server_text.clone();
        local.status = MessageStatus::Sent;
        self.store
            .update_local_message(&local)
            .await
            .map_err(OutboxError::store)?;
        self.store
            .store_server_version(&server_version)
            .await
            .map_err(OutboxError::store)?;
        Ok((
            resolution,
            vec![OutboxEvent::MessageUpdated {
                channel_id: local.channel_id.clone(),
                message: local,
            }],
        ))
    }

    /// Caller holds the state lock.
    async fn purge_message(&self, client_message_id: &ClientOperationId) -> OutboxResult<()> {
        let queue = self.store.get_pending().await.map_err(OutboxError::store)?;
        for operation in queue
            .iter()
            .filter(|operation| &operation.client_message_id == client_message_id)
        {
            self.store
                .remove_pending(&operation.client_operation_id)
                .await
                .map_err(OutboxError::store)?;
        }
        self.store
            .remove_local_message(client_message_id)
            .await
            .map_err(OutboxError::store)
    }
}

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod tests;
