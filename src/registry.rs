// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Registry manager.
//!
//! Owns validation, version comparison, metadata merge, expiry evaluation,
//! payload retrieval, and the status projection. Every queue write made on
//! its behalf (or by the download engine) goes through
//! [`RegistryManager::write_queue_mirrored`] so the registry row always
//! carries the queue row's status fields and status reads touch one table.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::download::Wake;
use crate::error::{ManagerError, StoreError};
use crate::events::{Event, EventBus, RegistrationReason};
use crate::probe::{StorageEstimate, StorageProbe};
use crate::store::Store;
use crate::types::{
    FileRegistration, ItemStatus, QueueEntry, RegistryEntry, RetrievedFile, StatusView,
    FALLBACK_MIME_TYPE,
};

/// Result of a batch registration: which ids were fed through registration
/// and which stale rows were reconciled away.
#[derive(Debug, Clone, Default)]
pub struct RegisterBatchResult {
    pub registered: Vec<String>,
    pub removed: Vec<String>,
}

/// Full catalog status: per-item projections plus a storage summary.
#[derive(Debug, Clone)]
pub struct CatalogStatus {
    pub items: Vec<StatusView>,
    pub storage: StorageEstimate,
}

/// Catalog-side component; see the module docs.
pub struct RegistryManager {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    probe: Arc<dyn StorageProbe>,
    wake: Wake,
}

impl RegistryManager {
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<EventBus>,
        probe: Arc<dyn StorageProbe>,
        wake: Wake,
    ) -> Self {
        Self {
            store,
            events,
            probe,
            wake,
        }
    }

    /// Register a single file.
    ///
    /// - Unknown id: inserts a registry row and a fresh pending queue row,
    ///   emits `registered{new}`, and wakes the download loop.
    /// - Known id with a strictly greater version: updates the registry row
    ///   (preserving `registered_at`), resets the queue row's attempt state
    ///   while keeping the current payload retrievable, emits
    ///   `registered{version-updated}`, and wakes the loop.
    /// - Known id with an equal or lower version: no-op.
    ///
    /// A quota failure while writing the metadata rows is reported on the
    /// `error` topic and the call returns `Ok`; the host is out of space,
    /// not misused.
    pub async fn register_file(&self, registration: FileRegistration) -> Result<(), ManagerError> {
        registration.validate()?;
        let now = Utc::now();

        match self.store.registry_get(&registration.id).await? {
            None => {
                let queue = QueueEntry::pending(&registration.id);
                let mut entry = RegistryEntry::from_registration(registration, now);
                if !self.put_pair(&queue, &mut entry).await? {
                    return Ok(());
                }
                debug!(target: "registry", id = %entry.id, version = entry.version, "registered new file");
                self.events.emit(&Event::Registered {
                    id: entry.id.clone(),
                    reason: RegistrationReason::New,
                });
                self.wake.notify();
            }
            Some(mut entry) if registration.version > entry.version => {
                let mut queue = self
                    .store
                    .queue_get(&registration.id)
                    .await?
                    .unwrap_or_else(|| QueueEntry::pending(&registration.id));
                queue.reset_for_refresh();
                entry.apply_registration(registration, now);
                if !self.put_pair(&queue, &mut entry).await? {
                    return Ok(());
                }
                debug!(target: "registry", id = %entry.id, version = entry.version, "queued version refresh");
                self.events.emit(&Event::Registered {
                    id: entry.id.clone(),
                    reason: RegistrationReason::VersionUpdated,
                });
                self.wake.notify();
            }
            Some(_) => {
                // Equal or lower version: idempotent no-op.
            }
        }
        Ok(())
    }

    /// Register a batch and reconcile the catalog against it.
    ///
    /// Unprotected rows whose id is absent from the batch are fully removed
    /// from both tables before the batch is applied.
    pub async fn register_files(
        &self,
        registrations: Vec<FileRegistration>,
    ) -> Result<RegisterBatchResult, ManagerError> {
        for registration in &registrations {
            registration.validate()?;
        }

        let incoming: HashSet<&str> = registrations.iter().map(|r| r.id.as_str()).collect();
        let mut result = RegisterBatchResult::default();

        for entry in self.store.registry_all().await? {
            if incoming.contains(entry.id.as_str()) || entry.protected {
                continue;
            }
            self.store.queue_delete(&entry.id).await?;
            self.store.registry_delete(&entry.id).await?;
            info!(target: "registry", id = %entry.id, "removed file absent from batch registration");
            self.events.emit(&Event::Deleted {
                id: entry.id.clone(),
                registry_removed: true,
            });
            result.removed.push(entry.id);
        }
        if !result.removed.is_empty() {
            // Freed space may unblock deferred rows even when every incoming
            // registration turns out to be a no-op.
            self.wake.notify();
        }

        for registration in registrations {
            let id = registration.id.clone();
            self.register_file(registration).await?;
            result.registered.push(id);
        }

        Ok(result)
    }

    /// Transition every complete row whose TTL has elapsed to expired.
    /// Returns the transitioned ids. Idempotent.
    pub async fn evaluate_expiry(&self) -> Result<Vec<String>, ManagerError> {
        let now = Utc::now();
        let mut expired = Vec::new();

        for mut queue in self.store.queue_all().await? {
            let due = queue.status == ItemStatus::Complete
                && queue.expires_at.is_some_and(|at| now >= at);
            if !due {
                continue;
            }
            queue.status = ItemStatus::Expired;
            self.write_queue_mirrored(&queue).await?;
            debug!(target: "registry", id = %queue.id, "payload expired; refresh queued");
            self.events.emit(&Event::Expired {
                id: queue.id.clone(),
            });
            expired.push(queue.id);
        }

        Ok(expired)
    }

    /// Status projection for one id, or `None` when unknown.
    pub async fn get_status(&self, id: &str) -> Result<Option<StatusView>, ManagerError> {
        Ok(self
            .store
            .registry_get(id)
            .await?
            .as_ref()
            .map(StatusView::project))
    }

    /// Status projections for the whole catalog, sorted by priority
    /// ascending, plus a storage summary.
    pub async fn get_all_status(&self) -> Result<CatalogStatus, ManagerError> {
        let mut entries = self.store.registry_all().await?;
        entries.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.registered_at.cmp(&b.registered_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        let items = entries.iter().map(StatusView::project).collect();
        let storage = self.probe.estimate().await;
        Ok(CatalogStatus { items, storage })
    }

    /// Whether the payload for `id` is currently retrievable.
    pub async fn is_ready(&self, id: &str) -> Result<bool, ManagerError> {
        Ok(self
            .store
            .queue_get(id)
            .await?
            .map(|q| q.status.is_ready() && q.data.is_some())
            .unwrap_or(false))
    }

    /// Retrieve the payload and resolved MIME type for `id`.
    ///
    /// Keyed off payload presence rather than status alone: a version
    /// refresh resets the row to pending while retaining the previous
    /// payload, and retrieval must not gap until the new download
    /// atomically replaces it.
    pub async fn retrieve(&self, id: &str) -> Result<RetrievedFile, ManagerError> {
        let queue = self
            .store
            .queue_get(id)
            .await?
            .ok_or_else(|| ManagerError::NotRegistered(id.to_string()))?;

        let Some(data) = queue.data else {
            return Err(ManagerError::NotReady {
                id: id.to_string(),
                status: queue.status,
            });
        };

        Ok(RetrievedFile {
            data,
            mime_type: queue
                .mime_type
                .unwrap_or_else(|| FALLBACK_MIME_TYPE.to_string()),
        })
    }

    /// Shallow-merge a JSON object into the entry's metadata.
    ///
    /// Non-object patches (including null) are ignored. Queue state is
    /// untouched.
    pub async fn update_metadata(
        &self,
        id: &str,
        patch: serde_json::Value,
    ) -> Result<(), ManagerError> {
        let mut entry = self
            .store
            .registry_get(id)
            .await?
            .ok_or_else(|| ManagerError::NotRegistered(id.to_string()))?;

        let serde_json::Value::Object(patch) = patch else {
            return Ok(());
        };

        for (key, value) in patch {
            entry.metadata.insert(key, value);
        }
        entry.updated_at = Utc::now();
        self.store.registry_put(entry).await?;
        Ok(())
    }

    /// Write a queue row and mirror its status fields onto the registry
    /// row, queue first. Skips both writes when the registry row is gone
    /// (the file was deleted out from under an in-flight transfer).
    ///
    /// Returns whether the write happened.
    pub(crate) async fn write_queue_mirrored(
        &self,
        queue: &QueueEntry,
    ) -> Result<bool, StoreError> {
        let Some(mut entry) = self.store.registry_get(&queue.id).await? else {
            debug!(target: "registry", id = %queue.id, "dropping queue write for unregistered id");
            return Ok(false);
        };
        self.store.queue_put(queue.clone()).await?;
        entry.apply_mirror(queue);
        self.store.registry_put(entry).await?;
        Ok(true)
    }

    /// Write both rows of a registration, reporting quota exhaustion on the
    /// `error` topic instead of failing the call.
    async fn put_pair(
        &self,
        queue: &QueueEntry,
        entry: &mut RegistryEntry,
    ) -> Result<bool, ManagerError> {
        entry.apply_mirror(queue);

        if !self.check_quota(self.store.queue_put(queue.clone()).await, &entry.id)? {
            return Ok(false);
        }
        if !self.check_quota(self.store.registry_put(entry.clone()).await, &entry.id)? {
            return Ok(false);
        }
        Ok(true)
    }

    fn check_quota(&self, write: Result<(), StoreError>, id: &str) -> Result<bool, ManagerError> {
        match write {
            Ok(()) => Ok(true),
            Err(StoreError::QuotaExceeded) => {
                warn!(target: "registry", id = %id, "quota exhausted while writing registration metadata");
                self.events.emit(&Event::Error {
                    id: id.to_string(),
                    error: StoreError::QuotaExceeded.to_string(),
                    retry_count: 0,
                    will_retry: None,
                });
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
