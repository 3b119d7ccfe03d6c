use shared::domain::{ClientOperationId, MessageId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("operation {id} is {status}; only failed operations can be retried")]
    InvalidState {
        id: ClientOperationId,
        status: &'static str,
    },
    #[error("operation {id} has used all {max_retries} retries")]
    RetriesExhausted {
        id: ClientOperationId,
        max_retries: u32,
    },
    #[error("message {0} is not known locally")]
    UnknownMessage(MessageId),
    #[error("local store failure: {source}")]
    Store { source: anyhow::Error },
    #[error("remote service failure: {source}")]
    Remote { source: anyhow::Error },
}

impl OutboxError {
    pub(crate) fn store(source: anyhow::Error) -> Self {
        Self::Store { source }
    }

    pub(crate) fn remote(source: anyhow::Error) -> Self {
        Self::Remote { source }
    }

    pub(crate) fn invalid_state(id: &ClientOperationId, status: &'static str) -> Self {
        Self::InvalidState {
            id: id.clone(),
            status,
        }
    }
}
