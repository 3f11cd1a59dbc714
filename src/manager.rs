// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Facade wiring the registry manager, download engine, and their
//! collaborators together.
//!
//! # Usage
//!
//! ```rust,no_run
//! use offline_data_manager::{FileRegistration, OfflineDataManager};
//!
//! # async fn example() -> Result<(), offline_data_manager::ManagerError> {
//! let manager = OfflineDataManager::builder().build()?;
//! manager.start().await;
//!
//! manager
//!     .register_file(FileRegistration::new("atlas", "https://cdn.example.com/atlas.bin", 1))
//!     .await?;
//!
//! // ... once the `complete` event fires:
//! let file = manager.retrieve("atlas").await?;
//! println!("{} bytes of {}", file.data.len(), file.mime_type);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::config::ManagerConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::download::{DownloadEngine, Wake};
use crate::error::ManagerError;
use crate::events::{Event, EventBus, SubscriptionId, Topic};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::probe::{StorageProbe, UnboundedProbe};
use crate::registry::{CatalogStatus, RegisterBatchResult, RegistryManager};
use crate::store::{FileStore, Store};
use crate::types::{FileRegistration, RetrievedFile, StatusView};

/// Top-level handle over the whole manager. Cheap to clone.
#[derive(Clone)]
pub struct OfflineDataManager {
    registry: Arc<RegistryManager>,
    engine: Arc<DownloadEngine>,
    events: Arc<EventBus>,
    connectivity: ConnectivityMonitor,
}

impl OfflineDataManager {
    /// Start building a manager with custom wiring.
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::default()
    }

    /// A manager with default wiring: file-backed store under the platform
    /// data directory, reqwest fetcher, unbounded storage probe.
    pub fn new() -> Result<Self, ManagerError> {
        Self::builder().build()
    }

    // ---- registry operations ------------------------------------------

    /// See [`RegistryManager::register_file`].
    pub async fn register_file(&self, registration: FileRegistration) -> Result<(), ManagerError> {
        self.registry.register_file(registration).await
    }

    /// See [`RegistryManager::register_files`].
    pub async fn register_files(
        &self,
        registrations: Vec<FileRegistration>,
    ) -> Result<RegisterBatchResult, ManagerError> {
        self.registry.register_files(registrations).await
    }

    /// See [`RegistryManager::evaluate_expiry`].
    pub async fn evaluate_expiry(&self) -> Result<Vec<String>, ManagerError> {
        self.registry.evaluate_expiry().await
    }

    /// See [`RegistryManager::get_status`].
    pub async fn get_status(&self, id: &str) -> Result<Option<StatusView>, ManagerError> {
        self.registry.get_status(id).await
    }

    /// See [`RegistryManager::get_all_status`].
    pub async fn get_all_status(&self) -> Result<CatalogStatus, ManagerError> {
        self.registry.get_all_status().await
    }

    /// See [`RegistryManager::is_ready`].
    pub async fn is_ready(&self, id: &str) -> Result<bool, ManagerError> {
        self.registry.is_ready(id).await
    }

    /// See [`RegistryManager::retrieve`].
    pub async fn retrieve(&self, id: &str) -> Result<RetrievedFile, ManagerError> {
        self.registry.retrieve(id).await
    }

    /// See [`RegistryManager::update_metadata`].
    pub async fn update_metadata(
        &self,
        id: &str,
        patch: serde_json::Value,
    ) -> Result<(), ManagerError> {
        self.registry.update_metadata(id, patch).await
    }

    // ---- engine operations --------------------------------------------

    /// Start the download loop. Idempotent.
    pub async fn start(&self) {
        self.engine.start().await;
    }

    /// Stop the download loop, pausing in-flight transfers.
    pub async fn stop(&self) {
        self.engine.stop().await;
    }

    /// Whether the download loop is running.
    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    /// Requeue failed rows and wake the loop.
    pub async fn retry_failed(&self) -> Result<Vec<String>, ManagerError> {
        self.engine.retry_failed().await
    }

    /// Cancel the in-flight transfer for one id.
    pub fn abort_download(&self, id: &str) {
        self.engine.abort_download(id);
    }

    /// Cancel every in-flight transfer.
    pub fn abort_all_downloads(&self) {
        self.engine.abort_all_downloads();
    }

    /// Install the connectivity watcher. Idempotent.
    pub fn start_monitoring(&self) {
        self.engine.start_monitoring();
    }

    /// Delete one file; protected rows are reset instead of removed unless
    /// `remove_protected` is set.
    pub async fn delete_file(&self, id: &str, remove_protected: bool) -> Result<(), ManagerError> {
        self.engine.delete_file(id, remove_protected).await
    }

    /// Delete every registered file.
    pub async fn delete_all_files(
        &self,
        remove_protected: bool,
    ) -> Result<Vec<String>, ManagerError> {
        self.engine.delete_all_files(remove_protected).await
    }

    // ---- events & connectivity ----------------------------------------

    /// Subscribe to an event topic.
    pub fn on<F>(&self, topic: Topic, listener: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.on(topic, listener)
    }

    /// Subscribe for a single delivery.
    pub fn once<F>(&self, topic: Topic, listener: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.once(topic, listener)
    }

    /// Remove a subscription.
    pub fn off(&self, subscription: SubscriptionId) -> bool {
        self.events.off(subscription)
    }

    /// Report a connectivity change (host glue or manual override).
    ///
    /// Works with or without [`Self::start_monitoring`]: an offline report
    /// aborts in-flight transfers right away and an online report wakes the
    /// drain loop, which announces the transition itself.
    pub fn update_connectivity_status(&self, online: bool) {
        self.connectivity.set_online(online);
        if !online {
            self.engine.handle_offline();
        }
        self.engine.notify();
    }

    /// Current connectivity state.
    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }
}

/// Builder for [`OfflineDataManager`], allowing each collaborator to be
/// replaced.
#[derive(Default)]
pub struct ManagerBuilder {
    config: ManagerConfig,
    store: Option<Arc<dyn Store>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    probe: Option<Arc<dyn StorageProbe>>,
    connectivity: Option<ConnectivityMonitor>,
}

impl ManagerBuilder {
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn StorageProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn connectivity(mut self, connectivity: ConnectivityMonitor) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Wire everything together. Defaults: [`FileStore`] named from the
    /// config, [`HttpFetcher`], [`UnboundedProbe`], online connectivity.
    pub fn build(self) -> Result<OfflineDataManager, ManagerError> {
        let config = Arc::new(self.config);

        let store: Arc<dyn Store> = match self.store {
            Some(store) => store,
            None => Arc::new(FileStore::open(&config.database_name, config.schema_version)?),
        };
        let fetcher: Arc<dyn Fetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new().map_err(|e| ManagerError::Init(e.to_string()))?),
        };
        let probe: Arc<dyn StorageProbe> = self
            .probe
            .unwrap_or_else(|| Arc::new(UnboundedProbe));
        let connectivity = self.connectivity.unwrap_or_default();

        let events = Arc::new(EventBus::new());
        let wake = Wake::new();

        let registry = Arc::new(RegistryManager::new(
            Arc::clone(&store),
            Arc::clone(&events),
            Arc::clone(&probe),
            wake.clone(),
        ));
        let engine = Arc::new(DownloadEngine::new(
            store,
            fetcher,
            probe,
            Arc::clone(&events),
            Arc::clone(&registry),
            connectivity.clone(),
            config,
            wake,
        ));

        Ok(OfflineDataManager {
            registry,
            engine,
            events,
            connectivity,
        })
    }
}
