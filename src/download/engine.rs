// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download engine: the drain loop and its surrounding state machine.
//!
//! One driver task per engine alternates between draining eligible rows
//! and blocking on the wake handle. Registration, retry, deletion, and
//! connectivity restoration all resolve the same wake, so the loop never
//! polls. Up to `concurrency` transfer pipelines run at once; a slot frees
//! when its item completes, fails, pauses, or defers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::ManagerError;
use crate::events::{Event, EventBus};
use crate::fetch::Fetcher;
use crate::locks::resilient_lock;
use crate::probe::StorageProbe;
use crate::registry::RegistryManager;
use crate::store::Store;
use crate::types::{ItemStatus, QueueEntry, RegistryEntry, REASON_INSUFFICIENT_STORAGE};

use super::transfer::{run_transfer, TransferContext};
use super::types::{PartialTransfer, TransferOutcome, Wake};

/// Decision taken for one selected row before it occupies a slot.
enum Predispatch {
    /// Spawn the transfer pipeline.
    Dispatch,
    /// Deferred for storage headroom; slot stays free.
    Deferred,
    /// Transient bookkeeping problem; skip until the next cycle.
    Skip,
}

/// Event-driven download engine. See the module docs.
pub struct DownloadEngine {
    store: Arc<dyn Store>,
    fetcher: Arc<dyn Fetcher>,
    probe: Arc<dyn StorageProbe>,
    events: Arc<EventBus>,
    registry: Arc<RegistryManager>,
    connectivity: ConnectivityMonitor,
    config: Arc<ManagerConfig>,
    wake: Wake,
    running: AtomicBool,
    monitor_started: AtomicBool,
    // Set once the offline transition has been announced; cleared (and the
    // restoration announced) on the way back online. Keeps the drain loop,
    // the watcher task, and the manual override from double-emitting.
    offline_announced: AtomicBool,
    root_cancel: Mutex<CancellationToken>,
    inflight: Mutex<HashMap<String, CancellationToken>>,
    partials: Mutex<HashMap<String, PartialTransfer>>,
    driver: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DownloadEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<dyn Store>,
        fetcher: Arc<dyn Fetcher>,
        probe: Arc<dyn StorageProbe>,
        events: Arc<EventBus>,
        registry: Arc<RegistryManager>,
        connectivity: ConnectivityMonitor,
        config: Arc<ManagerConfig>,
        wake: Wake,
    ) -> Self {
        Self {
            store,
            fetcher,
            probe,
            events,
            registry,
            connectivity,
            config,
            wake,
            running: AtomicBool::new(false),
            monitor_started: AtomicBool::new(false),
            offline_announced: AtomicBool::new(false),
            root_cancel: Mutex::new(CancellationToken::new()),
            inflight: Mutex::new(HashMap::new()),
            partials: Mutex::new(HashMap::new()),
            driver: tokio::sync::Mutex::new(None),
        }
    }

    /// Wake the drain loop. Exposed so collaborators (and embedders with
    /// out-of-band state changes) can nudge the engine without polling.
    pub fn notify(&self) {
        self.wake.notify();
    }

    /// Whether the drain loop is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the drain loop. Idempotent: a second call while running is a
    /// no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut root = resilient_lock(&self.root_cancel);
            *root = CancellationToken::new();
        }

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move { engine.drive().await });
        *self.driver.lock().await = Some(handle);
        info!(target: "download", concurrency = self.config.concurrency, "download loop started");
    }

    /// Stop the drain loop: cancel every in-flight transfer (parking the
    /// rows as `paused`), wait for the driver to settle, emit `stopped`.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify();
        resilient_lock(&self.root_cancel).cancel();

        if let Some(handle) = self.driver.lock().await.take() {
            if let Err(e) = handle.await {
                error!(target: "download", error = %e, "driver task ended abnormally");
            }
        }

        self.events.emit(&Event::Stopped);
        info!(target: "download", "download loop stopped");
    }

    /// Requeue every failed row with a cleared retry budget, then wake.
    pub async fn retry_failed(&self) -> Result<Vec<String>, ManagerError> {
        let mut retried = Vec::new();
        for mut queue in self.store.queue_all().await? {
            if queue.status != ItemStatus::Failed {
                continue;
            }
            queue.status = ItemStatus::Pending;
            queue.retry_count = 0;
            queue.error_message = None;
            self.registry.write_queue_mirrored(&queue).await?;
            retried.push(queue.id);
        }
        if !retried.is_empty() {
            debug!(target: "download", count = retried.len(), "failed rows requeued");
        }
        self.wake.notify();
        Ok(retried)
    }

    /// Cancel the in-flight transfer for one id, if any. The pipeline
    /// parks the row as `paused`.
    pub fn abort_download(&self, id: &str) {
        if let Some(token) = resilient_lock(&self.inflight).get(id) {
            token.cancel();
        }
    }

    /// Cancel every in-flight transfer.
    pub fn abort_all_downloads(&self) {
        for token in resilient_lock(&self.inflight).values() {
            token.cancel();
        }
    }

    /// React to an offline state: abort in-flight transfers (the pipelines
    /// park their rows as `paused`) and emit `connectivity{online:false}`
    /// once per offline episode.
    pub(crate) fn handle_offline(&self) {
        self.abort_all_downloads();
        if !self.offline_announced.swap(true, Ordering::SeqCst) {
            info!(target: "download", "connectivity lost; pausing in-flight transfers");
            self.events.emit(&Event::Connectivity { online: false });
        }
    }

    /// Emit `connectivity{online:true}` once per restoration.
    pub(crate) fn announce_online(&self) {
        if self.offline_announced.swap(false, Ordering::SeqCst) {
            info!(target: "download", "connectivity restored");
            self.events.emit(&Event::Connectivity { online: true });
        }
    }

    /// Install the connectivity watcher: an offline edge aborts in-flight
    /// transfers, an online edge wakes the loop. Idempotent; a no-op on
    /// hosts that never drive the monitor.
    pub fn start_monitoring(self: &Arc<Self>) {
        if self.monitor_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        let mut rx = self.connectivity.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let Some(engine) = weak.upgrade() else { break };
                let online = *rx.borrow();
                if online {
                    engine.announce_online();
                    engine.wake.notify();
                } else {
                    engine.handle_offline();
                }
            }
        });
    }

    /// Delete one file. Protected rows survive with a reset queue row
    /// unless `remove_protected` is set.
    pub async fn delete_file(&self, id: &str, remove_protected: bool) -> Result<(), ManagerError> {
        let entry = self
            .store
            .registry_get(id)
            .await?
            .ok_or_else(|| ManagerError::NotRegistered(id.to_string()))?;

        self.abort_download(id);
        resilient_lock(&self.partials).remove(id);

        if remove_protected || !entry.protected {
            self.store.queue_delete(id).await?;
            self.store.registry_delete(id).await?;
            info!(target: "download", id = %id, "file deleted");
            self.events.emit(&Event::Deleted {
                id: id.to_string(),
                registry_removed: true,
            });
        } else {
            // Protected: drop the payload, keep the registration, requeue.
            let queue = QueueEntry::pending(id);
            self.registry.write_queue_mirrored(&queue).await?;
            info!(target: "download", id = %id, "protected file reset; refresh queued");
            self.events.emit(&Event::Deleted {
                id: id.to_string(),
                registry_removed: false,
            });
        }

        // Freed space may unblock deferred rows.
        self.wake.notify();
        Ok(())
    }

    /// Delete every registered file.
    pub async fn delete_all_files(&self, remove_protected: bool) -> Result<Vec<String>, ManagerError> {
        self.abort_all_downloads();
        let mut deleted = Vec::new();
        for entry in self.store.registry_all().await? {
            self.delete_file(&entry.id, remove_protected).await?;
            deleted.push(entry.id);
        }
        Ok(deleted)
    }

    /// Driver task: drain, then block on the wake handle.
    async fn drive(self: Arc<Self>) {
        debug!(target: "download", "driver started");
        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            // Install the waiter before checking for work so a wake landing
            // mid-cycle is never lost.
            let wake = self.wake.notified();

            if !self.connectivity.is_online() {
                debug!(target: "download", "offline; waiting for connectivity");
                self.handle_offline();
                wake.await;
                continue;
            }
            self.announce_online();

            if let Err(e) = self.registry.evaluate_expiry().await {
                warn!(target: "download", error = %e, "expiry evaluation failed");
            }

            let batch = match self.select_eligible().await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(target: "download", error = %e, "could not read work queue");
                    Vec::new()
                }
            };

            if batch.is_empty() {
                wake.await;
                continue;
            }

            let dispatched = self.run_batch(batch).await;
            if !dispatched && self.running.load(Ordering::SeqCst) {
                // Everything in the selection deferred or was skipped;
                // nothing will change until somebody wakes us.
                wake.await;
            }
        }
        debug!(target: "download", "driver stopped");
    }

    /// Rows the loop should work on, priority ascending with a stable
    /// insertion-order tie-break, excluding ids already in flight.
    async fn select_eligible(&self) -> Result<Vec<RegistryEntry>, ManagerError> {
        let inflight: Vec<String> = resilient_lock(&self.inflight).keys().cloned().collect();
        let mut rows = self.store.registry_all().await?;
        rows.retain(|entry| entry.status.is_eligible() && !inflight.contains(&entry.id));
        rows.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.registered_at.cmp(&b.registered_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(rows)
    }

    /// Run one selection to completion, keeping up to `concurrency`
    /// pipelines in flight. Returns whether any pipeline was dispatched.
    async fn run_batch(self: &Arc<Self>, batch: Vec<RegistryEntry>) -> bool {
        let mut pending = batch.into_iter();
        let mut slots: JoinSet<(String, TransferOutcome, Option<PartialTransfer>)> = JoinSet::new();
        let mut dispatched = false;

        loop {
            while slots.len() < self.config.concurrency
                && self.running.load(Ordering::SeqCst)
                && self.connectivity.is_online()
            {
                let Some(entry) = pending.next() else { break };
                match self.predispatch(&entry).await {
                    Predispatch::Dispatch => {
                        dispatched = true;
                        let token = resilient_lock(&self.root_cancel).child_token();
                        resilient_lock(&self.inflight).insert(entry.id.clone(), token.clone());
                        let partial = resilient_lock(&self.partials)
                            .remove(&entry.id)
                            .unwrap_or_default();

                        let ctx = self.transfer_context();
                        let id = entry.id.clone();
                        slots.spawn(async move {
                            let (outcome, partial) = run_transfer(ctx, entry, partial, token).await;
                            (id, outcome, partial)
                        });
                    }
                    Predispatch::Deferred | Predispatch::Skip => {}
                }
            }

            match slots.join_next().await {
                Some(Ok((id, outcome, partial))) => {
                    resilient_lock(&self.inflight).remove(&id);
                    if let Some(partial) = partial {
                        if !partial.is_empty() {
                            resilient_lock(&self.partials).insert(id.clone(), partial);
                        }
                    }
                    debug!(target: "download", id = %id, outcome = ?outcome, "transfer slot freed");
                }
                Some(Err(e)) => {
                    error!(target: "download", error = %e, "transfer task panicked");
                }
                None => break,
            }
        }

        dispatched
    }

    /// Storage pre-check for one selected row. Items with an unknown size
    /// skip the check; the store reports quota pressure during the
    /// transfer instead.
    async fn predispatch(&self, entry: &RegistryEntry) -> Predispatch {
        let queue = match self.store.queue_get(&entry.id).await {
            Ok(queue) => queue,
            Err(e) => {
                warn!(target: "download", id = %entry.id, error = %e, "could not read queue row; skipping");
                return Predispatch::Skip;
            }
        };

        let needed = entry
            .total_bytes
            .or(queue.as_ref().and_then(|q| q.total_bytes))
            .unwrap_or(0);
        if needed == 0 || self.probe.has_enough_space(needed).await {
            return Predispatch::Dispatch;
        }

        let mut row = queue.unwrap_or_else(|| QueueEntry::pending(&entry.id));
        row.status = ItemStatus::Deferred;
        row.deferred_reason = Some(REASON_INSUFFICIENT_STORAGE.to_string());
        if let Err(e) = self.registry.write_queue_mirrored(&row).await {
            warn!(target: "download", id = %entry.id, error = %e, "failed to persist deferred row");
        }
        self.events.emit(&Event::Deferred {
            id: entry.id.clone(),
            reason: REASON_INSUFFICIENT_STORAGE.to_string(),
        });
        debug!(target: "download", id = %entry.id, needed, "dispatch deferred: insufficient storage");
        Predispatch::Deferred
    }

    fn transfer_context(&self) -> TransferContext {
        TransferContext {
            store: Arc::clone(&self.store),
            fetcher: Arc::clone(&self.fetcher),
            registry: Arc::clone(&self.registry),
            events: Arc::clone(&self.events),
            connectivity: self.connectivity.clone(),
            config: Arc::clone(&self.config),
        }
    }
}
