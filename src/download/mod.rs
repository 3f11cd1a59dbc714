// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download engine for registered files.
//!
//! This module owns the event-driven drain loop, the per-item transfer
//! pipeline, and the delete operations (which must abort in-flight work):
//!
//! ```text
//! ┌──────────────────┐  wake   ┌──────────────────┐
//! │ RegistryManager  │────────▶│ DownloadEngine   │
//! │ (register/expiry)│         │ driver (tokio)   │
//! └────────┬─────────┘         └────────┬─────────┘
//!          │                            │ up to `concurrency`
//!          ▼                            ▼
//! ┌──────────────────┐         ┌──────────────────┐
//! │ Store            │◀───────▶│ transfer pipeline│──▶ Fetcher (HTTP)
//! │ registry + queue │ mirror  │ probe/chunk/retry│
//! └──────────────────┘         └──────────────────┘
//! ```
//!
//! The drain loop blocks on a single [`Wake`] handle when idle; file
//! registration, retry, deletion, and connectivity restoration all resolve
//! it, so the loop never polls. Transfers over 5 MiB against Range-capable
//! servers run as sequential 2 MiB chunk GETs with the resumption cursor
//! persisted after every chunk; everything else streams in one GET.

pub mod engine;
pub(crate) mod transfer;
pub mod types;

pub use engine::DownloadEngine;
pub use types::{PartialTransfer, TransferOutcome, Wake};
