//! Startup / reconnect reconciliation of the durable queue.
//!
//! An entry still `pending` or `sending` when the process starts had its
//! outcome lost with the previous process. Resubmitting it blindly could
//! duplicate the message, so it is surfaced as failed for an explicit retry.

use anyhow::Result;
use shared::{
    domain::{ClientOperationId, MessageStatus, OperationStatus},
    protocol::OutboxEvent,
};
use tracing::{debug, info};

use crate::{EventBus, InflightClaims, LocalStore};

pub const CONNECTION_LOST_REASON: &str = "connection lost during send";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub marked_failed: Vec<ClientOperationId>,
    pub skipped_in_flight: Vec<ClientOperationId>,
}

/// Entries claimed by a running attempt in this process (the reconnect case)
/// are left alone.
pub async fn reconcile_pending(
    store: &dyn LocalStore,
    events: &dyn EventBus,
    claims: &InflightClaims,
) -> Result<ReconcileReport> {
    let queue = store.get_pending().await?;
    let mut report = ReconcileReport {
        scanned: queue.len(),
        ..ReconcileReport::default()
    };

    for mut operation in queue {
        if !operation.status.is_unconfirmed() {
            continue;
        }
        let id = operation.client_operation_id.clone();
        if claims.is_claimed(&id) {
            debug!(client_operation_id = %id, "attempt still running; not reconciling");
            report.skipped_in_flight.push(id);
            continue;
        }

        operation.status = OperationStatus::Failed;
        operation.last_error = Some(CONNECTION_LOST_REASON.to_string());
        store.update_pending(&operation).await?;

        let event = match store.get_local_message(&operation.client_message_id).await? {
            Some(mut message) => {
                message.status = MessageStatus::Failed;
                store.update_local_message(&message).await?;
                OutboxEvent::status_changed(&message, Some(CONNECTION_LOST_REASON.to_string()))
            }
            None => OutboxEvent::MessageStatusChanged {
                channel_id: operation.channel_id.clone(),
                client_message_id: operation.client_message_id.clone(),
                message_id: None,
                status: MessageStatus::Failed,
                error: Some(CONNECTION_LOST_REASON.to_string()),
            },
        };
        events.publish(event);

        info!(
            client_operation_id = %id,
            kind = operation.kind().as_str(),
            "unconfirmed operation marked failed"
        );
        report.marked_failed.push(id);
    }

    Ok(report)
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
