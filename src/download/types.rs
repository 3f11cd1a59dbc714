// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Support types for the download engine.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::fetch::HttpResponse;

/// Wake handle for the drain loop.
///
/// Edge-triggered and coalescing: any number of notifications while the
/// loop is busy collapse into a single pending wake, and a wake arriving
/// between cycles is never lost because the loop installs its waiter
/// before checking for work. The engine owns the primitive; the registry
/// manager and deleter hold clones and call [`Wake::notify`].
#[derive(Clone, Default)]
pub struct Wake {
    inner: Arc<Notify>,
}

impl Wake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the drain loop if it is idle; coalesces with pending wakes.
    pub fn notify(&self) {
        self.inner.notify_one();
    }

    /// Future resolving on the next notification (or immediately when one
    /// is already pending).
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.inner.notified()
    }
}

/// How one occupancy of a transfer slot ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Payload stored; `complete` emitted.
    Completed,
    /// Cancelled (abort, stop, offline) or the row vanished mid-transfer.
    Paused,
    /// Retry budget exhausted.
    Failed,
    /// No storage headroom; re-evaluated next drain cycle.
    Deferred,
}

/// Chunks accumulated for an in-flight item, kept by the engine across
/// pauses so a resumed transfer picks up at its persisted cursor.
///
/// The buffer lives only in process memory; after a restart the persisted
/// cursor has no matching buffer and the transfer restarts from zero.
#[derive(Debug, Default)]
pub struct PartialTransfer {
    chunks: Vec<Bytes>,
    bytes: u64,
}

impl PartialTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: Bytes) {
        self.bytes += chunk.len() as u64;
        self.chunks.push(chunk);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
    }

    /// Concatenate the chunks into one contiguous payload. Non-consuming,
    /// so a failed store write can retry later without refetching.
    pub fn concat(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.bytes as usize);
        for chunk in &self.chunks {
            payload.extend_from_slice(chunk);
        }
        payload
    }
}

/// What a HEAD probe learned about the remote resource.
#[derive(Debug, Clone, Default)]
pub(crate) struct HeadProbe {
    pub supports_range: bool,
    pub total_bytes: Option<u64>,
    pub mime_type: Option<String>,
}

impl HeadProbe {
    /// Probe results for a failed or refused HEAD: full-body GET territory.
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn from_response(response: &HttpResponse) -> Self {
        Self {
            supports_range: response
                .header("accept-ranges")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("bytes")),
            total_bytes: content_length_if_identity(response),
            mime_type: parse_mime(response.header("content-type")),
        }
    }
}

/// `Content-Length`, but only when no content coding other than identity
/// is applied; a compressed transfer size would mislead progress.
pub(crate) fn content_length_if_identity(response: &HttpResponse) -> Option<u64> {
    if let Some(encoding) = response.header("content-encoding") {
        let identity = encoding
            .split(',')
            .map(str::trim)
            .all(|token| token.is_empty() || token.eq_ignore_ascii_case("identity"));
        if !identity {
            return None;
        }
    }
    response.header("content-length")?.trim().parse().ok()
}

/// First token of `Content-Type` with parameters stripped.
pub(crate) fn parse_mime(header: Option<&str>) -> Option<String> {
    let token = header?.split(';').next()?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
