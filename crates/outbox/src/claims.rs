use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use shared::domain::ClientOperationId;

/// Tracks which operations have a delivery attempt running in this process.
#[derive(Debug, Clone, Default)]
pub struct InflightClaims {
    inner: Arc<ClaimsInner>,
}

#[derive(Debug, Default)]
struct ClaimsInner {
    next_token: AtomicU64,
    held: Mutex<HashMap<ClientOperationId, u64>>,
}

impl ClaimsInner {
    fn held(&self) -> MutexGuard<'_, HashMap<ClientOperationId, u64>> {
        // A panic while holding this lock cannot leave the map half-updated.
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl InflightClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` when another attempt already holds the id.
    pub fn try_claim(&self, id: &ClientOperationId) -> Option<InflightClaim> {
        let mut held = self.inner.held();
        if held.contains_key(id) {
            return None;
        }
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        held.insert(id.clone(), token);
        Some(InflightClaim {
            claims: Arc::clone(&self.inner),
            id: id.clone(),
            token,
        })
    }

    pub fn is_claimed(&self, id: &ClientOperationId) -> bool {
        self.inner.held().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.held().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Released on drop, including when the owning task errors or panics.
#[derive(Debug)]
pub struct InflightClaim {
    claims: Arc<ClaimsInner>,
    id: ClientOperationId,
    token: u64,
}

impl Drop for InflightClaim {
    fn drop(&mut self) {
        let mut held = self.claims.held();
        if held.get(&self.id) == Some(&self.token) {
            held.remove(&self.id);
        }
    }
}
