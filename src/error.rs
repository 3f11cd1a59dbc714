// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the offline data manager.
//!
//! Caller-facing failures (`ManagerError`) are distinct from the transient
//! transfer failures that the download engine handles internally through
//! retry and backoff. Transfer failures never surface as `Err` values;
//! they are published on the `error` event topic instead.

use thiserror::Error;

use crate::types::ItemStatus;

/// Errors raised by the storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend refused the write because the storage quota is exhausted.
    /// The engine maps this to a `deferred` transition rather than a retry.
    #[error("storage quota exceeded")]
    QuotaExceeded,

    /// Any other backend failure.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A record could not be serialized or deserialized.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem-level failure from a persistent backend.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the fetch primitive.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection failure, DNS failure, or a broken stream mid-body.
    #[error("network error: {0}")]
    Network(String),

    /// The request could not be constructed (bad URL, bad header value).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Caller-facing errors for registry and retrieval operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// A registration failed shape validation.
    #[error("invalid registration: {0}")]
    Validation(String),

    /// No file is registered under the given id.
    #[error("no file registered under id '{0}'")]
    NotRegistered(String),

    /// The file exists but its payload is not retrievable yet.
    #[error("file '{id}' is not ready for retrieval (status: {status})")]
    NotReady { id: String, status: ItemStatus },

    /// A storage operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A component could not be constructed during wiring.
    #[error("initialization failed: {0}")]
    Init(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_display_includes_status() {
        let err = ManagerError::NotReady {
            id: "report".to_string(),
            status: ItemStatus::Pending,
        };
        let msg = err.to_string();
        assert!(msg.contains("report"), "message should name the id: {}", msg);
        assert!(msg.contains("pending"), "message should name the status: {}", msg);
    }

    #[test]
    fn test_store_error_converts_to_manager_error() {
        let err: ManagerError = StoreError::QuotaExceeded.into();
        assert!(matches!(err, ManagerError::Store(StoreError::QuotaExceeded)));
    }
}
