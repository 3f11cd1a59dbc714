// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! offline-data-manager - durable, resumable, priority-ordered downloads
//!
//! Register a catalog of files by stable id, URL, and version; the manager
//! fetches them in priority order, stores the bytes in a two-table
//! key/value store, expires them on TTL, and refreshes them on version
//! bumps. Payloads are opaque: nothing is parsed or decompressed.
//!
//! The moving parts:
//!
//! - [`registry`] - registration, version monotonicity, expiry, status
//!   projection, payload retrieval
//! - [`download`] - event-driven drain loop, chunked/resumable transfers,
//!   retry with exponential backoff, quota-aware deferral, deletion
//! - [`store`] - the two-table storage seam plus in-memory and file-backed
//!   backends
//! - [`fetch`] - the HTTP seam plus a reqwest-backed default
//! - [`probe`] - storage quota estimation and the headroom predicate
//! - [`connectivity`] - online/offline signal with manual override
//! - [`events`] - synchronous topic emitter used by everything above
//!
//! Most callers only touch [`OfflineDataManager`]:
//!
//! ```rust,no_run
//! use offline_data_manager::{FileRegistration, OfflineDataManager, Topic};
//!
//! # async fn example() -> Result<(), offline_data_manager::ManagerError> {
//! let manager = OfflineDataManager::builder().build()?;
//! manager.on(Topic::Complete, |event| println!("done: {:?}", event));
//! manager.start().await;
//! manager.start_monitoring();
//!
//! manager
//!     .register_file(
//!         FileRegistration::new("tiles", "https://cdn.example.com/tiles.bin", 1)
//!             .with_priority(1)
//!             .with_ttl(86_400),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connectivity;
pub mod download;
pub mod error;
pub mod events;
pub mod fetch;
pub mod locks;
pub mod manager;
pub mod probe;
pub mod registry;
pub mod store;
pub mod types;

// Re-export the surface most callers need.
pub use config::ManagerConfig;
pub use connectivity::ConnectivityMonitor;
pub use download::{DownloadEngine, TransferOutcome, Wake};
pub use error::{FetchError, ManagerError, StoreError};
pub use events::{Event, EventBus, RegistrationReason, SubscriptionId, Topic};
pub use fetch::{FetchRequest, Fetcher, HttpFetcher, HttpMethod, HttpResponse};
pub use manager::{ManagerBuilder, OfflineDataManager};
pub use probe::{FixedProbe, StorageEstimate, StorageProbe, UnboundedProbe};
pub use registry::{CatalogStatus, RegisterBatchResult, RegistryManager};
pub use store::{FileStore, MemoryStore, Store};
pub use types::{
    FileRegistration, ItemStatus, QueueEntry, RegistryEntry, RetrievedFile, StatusView,
};
