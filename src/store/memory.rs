// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory store backend.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::locks::{resilient_read, resilient_write};
use crate::store::Store;
use crate::types::{QueueEntry, RegistryEntry};

/// Process-local store over two HashMaps.
///
/// An optional payload capacity simulates a bounded host: a queue put
/// whose payload would push the total stored bytes past the capacity is
/// rejected with [`StoreError::QuotaExceeded`], exactly as a constrained
/// browser store would.
#[derive(Debug, Default)]
pub struct MemoryStore {
    registry: RwLock<HashMap<String, RegistryEntry>>,
    queue: RwLock<HashMap<String, QueueEntry>>,
    payload_capacity: Option<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that rejects payload writes beyond `capacity` total bytes.
    pub fn with_payload_capacity(capacity: u64) -> Self {
        Self {
            payload_capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Total payload bytes currently stored on queue rows.
    pub fn stored_payload_bytes(&self) -> u64 {
        let queue = resilient_read(&self.queue);
        queue
            .values()
            .filter_map(|q| q.data.as_ref().map(|d| d.len() as u64))
            .sum()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn registry_get(&self, id: &str) -> Result<Option<RegistryEntry>, StoreError> {
        Ok(resilient_read(&self.registry).get(id).cloned())
    }

    async fn registry_put(&self, entry: RegistryEntry) -> Result<(), StoreError> {
        resilient_write(&self.registry).insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn registry_delete(&self, id: &str) -> Result<(), StoreError> {
        resilient_write(&self.registry).remove(id);
        Ok(())
    }

    async fn registry_all(&self) -> Result<Vec<RegistryEntry>, StoreError> {
        Ok(resilient_read(&self.registry).values().cloned().collect())
    }

    async fn queue_get(&self, id: &str) -> Result<Option<QueueEntry>, StoreError> {
        Ok(resilient_read(&self.queue).get(id).cloned())
    }

    async fn queue_put(&self, entry: QueueEntry) -> Result<(), StoreError> {
        let mut queue = resilient_write(&self.queue);
        if let (Some(capacity), Some(data)) = (self.payload_capacity, entry.data.as_ref()) {
            let others: u64 = queue
                .iter()
                .filter(|(id, _)| id.as_str() != entry.id)
                .filter_map(|(_, q)| q.data.as_ref().map(|d| d.len() as u64))
                .sum();
            if others + data.len() as u64 > capacity {
                return Err(StoreError::QuotaExceeded);
            }
        }
        queue.insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn queue_delete(&self, id: &str) -> Result<(), StoreError> {
        resilient_write(&self.queue).remove(id);
        Ok(())
    }

    async fn queue_all(&self) -> Result<Vec<QueueEntry>, StoreError> {
        Ok(resilient_read(&self.queue).values().cloned().collect())
    }

    async fn queue_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(resilient_read(&self.queue).keys().cloned().collect())
    }
}
