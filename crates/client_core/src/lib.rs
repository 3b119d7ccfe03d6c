use std::sync::Arc;

use anyhow::{Context, Result};
use outbox::{BroadcastEventBus, ReconcileReport, RemoteService, SendCoordinator};
use shared::protocol::OutboxEvent;
use storage::Storage;
use tokio::sync::broadcast;
use tracing::info;

pub mod config;
mod http_remote;

pub use config::{load_settings, load_settings_from, Settings};
pub use http_remote::HttpRemoteService;

/// The outbox wired to SQLite storage, a remote backend and a broadcast
/// event bus.
pub struct OfflineClient {
    storage: Storage,
    events: Arc<BroadcastEventBus>,
    coordinator: Arc<SendCoordinator>,
    startup_report: ReconcileReport,
}

impl OfflineClient {
    /// Opens the database, connects the HTTP backend and reconciles whatever
    /// a previous run left unconfirmed.
    pub async fn initialize(settings: &Settings) -> Result<Self> {
        let remote = Arc::new(HttpRemoteService::new(settings.server_url.clone()));
        Self::initialize_with_remote(settings, remote).await
    }

    pub async fn initialize_with_remote(
        settings: &Settings,
        remote: Arc<dyn RemoteService>,
    ) -> Result<Self> {
        let database_url = config::normalize_database_url(&settings.database_url);
        let storage = Storage::new(&database_url)
            .await
            .with_context(|| format!("failed to open outbox database '{database_url}'"))?;
        let events = Arc::new(BroadcastEventBus::default());
        let coordinator = SendCoordinator::new(
            Arc::new(storage.clone()),
            remote,
            events.clone(),
            settings.outbox_config(),
        );

        let startup_report = coordinator
            .process_pending()
            .await
            .context("startup reconciliation failed")?;
        info!(
            %database_url,
            server_url = %settings.server_url,
            marked_failed = startup_report.marked_failed.len(),
            "offline client ready"
        );

        Ok(Self {
            storage,
            events,
            coordinator,
            startup_report,
        })
    }

    pub fn coordinator(&self) -> &Arc<SendCoordinator> {
        &self.coordinator
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn startup_report(&self) -> &ReconcileReport {
        &self.startup_report
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<OutboxEvent> {
        self.events.subscribe()
    }

    /// Call when connectivity returns. Entries still owned by a running
    /// attempt are left alone.
    pub async fn on_reconnect(&self) -> Result<ReconcileReport> {
        Ok(self.coordinator.process_pending().await?)
    }

    /// Waits for in-flight deliveries so their outcomes are persisted.
    pub async fn shutdown(&self) {
        self.coordinator.wait_idle().await;
        info!("offline client stopped");
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
