// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Storage seam for the registry and queue tables.
//!
//! The manager persists two logical tables keyed by item id: `registry`
//! (authoritative metadata plus mirrored status) and `queue` (download
//! state plus the payload itself). Backends only need atomic single-row
//! puts; there is no multi-row transaction requirement.
//!
//! Two backends ship with the crate:
//!
//! - [`MemoryStore`]: process-local HashMaps, used in tests and by hosts
//!   that persist elsewhere.
//! - [`FileStore`]: one JSON document written with a temp-file-and-rename
//!   strategy under an advisory file lock, so a crash never leaves a
//!   half-written database behind.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{QueueEntry, RegistryEntry};

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Typed access to the two tables.
#[async_trait]
pub trait Store: Send + Sync {
    async fn registry_get(&self, id: &str) -> Result<Option<RegistryEntry>, StoreError>;
    async fn registry_put(&self, entry: RegistryEntry) -> Result<(), StoreError>;
    async fn registry_delete(&self, id: &str) -> Result<(), StoreError>;
    async fn registry_all(&self) -> Result<Vec<RegistryEntry>, StoreError>;

    async fn queue_get(&self, id: &str) -> Result<Option<QueueEntry>, StoreError>;
    async fn queue_put(&self, entry: QueueEntry) -> Result<(), StoreError>;
    async fn queue_delete(&self, id: &str) -> Result<(), StoreError>;
    async fn queue_all(&self) -> Result<Vec<QueueEntry>, StoreError>;
    async fn queue_ids(&self) -> Result<Vec<String>, StoreError>;
}
