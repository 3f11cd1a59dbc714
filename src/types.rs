// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core record types for the offline data manager.
//!
//! Two persistent records exist per registered file: the [`RegistryEntry`]
//! (authoritative identity, version, priority) and the [`QueueEntry`]
//! (transient download state plus the payload itself once complete). The
//! registry row mirrors the queue row's status fields so that status reads
//! touch a single table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ManagerError;

/// Default scheduling priority; lower values download earlier.
pub const DEFAULT_PRIORITY: i32 = 10;

/// MIME type used when nothing more specific could be resolved.
pub const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

/// Deferral reason recorded when the storage probe reports no headroom.
pub const REASON_INSUFFICIENT_STORAGE: &str = "insufficient-storage";

/// Deferral reason recorded when a transfer is paused by an offline edge.
pub const REASON_NETWORK_OFFLINE: &str = "network-offline";

/// Lifecycle status of a managed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemStatus {
    /// Waiting for a download slot.
    Pending,
    /// A transfer is currently running.
    InProgress,
    /// Cancelled mid-transfer; the resumption cursor is preserved.
    Paused,
    /// Downloaded and retrievable.
    Complete,
    /// TTL elapsed; payload still retrievable, refresh queued.
    Expired,
    /// All retry attempts exhausted.
    Failed,
    /// Waiting for storage headroom.
    Deferred,
}

impl ItemStatus {
    /// Returns true when the payload is addressable by callers.
    pub fn is_ready(&self) -> bool {
        matches!(self, ItemStatus::Complete | ItemStatus::Expired)
    }

    /// Returns true when the drain loop should consider this row for work.
    pub(crate) fn is_eligible(&self) -> bool {
        matches!(
            self,
            ItemStatus::Pending
                | ItemStatus::InProgress
                | ItemStatus::Paused
                | ItemStatus::Deferred
                | ItemStatus::Expired
        )
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in-progress",
            ItemStatus::Paused => "paused",
            ItemStatus::Complete => "complete",
            ItemStatus::Expired => "expired",
            ItemStatus::Failed => "failed",
            ItemStatus::Deferred => "deferred",
        };
        write!(f, "{}", name)
    }
}

/// Caller-supplied description of a file to manage.
///
/// # Example
///
/// ```
/// use offline_data_manager::FileRegistration;
///
/// let reg = FileRegistration::new("tileset", "https://cdn.example.com/tiles.bin", 3)
///     .with_priority(1)
///     .with_ttl(3600)
///     .protected();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRegistration {
    /// Stable identifier, unique across the catalog.
    pub id: String,
    /// URL fetched verbatim.
    pub download_url: String,
    /// Expected MIME type; `None` means infer at download time.
    pub mime_type: Option<String>,
    /// Monotonic version; a strict increase triggers a refresh.
    pub version: u64,
    /// Protected rows survive deletion with a reset instead of removal.
    pub protected: bool,
    /// Lower values download earlier. Defaults to [`DEFAULT_PRIORITY`].
    pub priority: i32,
    /// Seconds after completion at which the payload expires; 0 = never.
    pub ttl_seconds: u64,
    /// Optional size hint in bytes, consulted before dispatch.
    pub total_bytes: Option<u64>,
    /// Opaque caller-owned metadata.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl FileRegistration {
    /// Create a registration with default priority, no TTL, no protection.
    pub fn new(id: impl Into<String>, download_url: impl Into<String>, version: u64) -> Self {
        Self {
            id: id.into(),
            download_url: download_url.into(),
            mime_type: None,
            version,
            protected: false,
            priority: DEFAULT_PRIORITY,
            ttl_seconds: 0,
            total_bytes: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Set the expected MIME type.
    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }

    /// Set the scheduling priority (lower = earlier).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the TTL in seconds (0 = never expires).
    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Set the expected total size in bytes.
    pub fn with_total_bytes(mut self, total: u64) -> Self {
        self.total_bytes = Some(total);
        self
    }

    /// Attach caller-owned metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Mark the entry as protected.
    pub fn protected(mut self) -> Self {
        self.protected = true;
        self
    }

    /// Validate the registration shape.
    pub(crate) fn validate(&self) -> Result<(), ManagerError> {
        if self.id.trim().is_empty() {
            return Err(ManagerError::Validation("id must be a non-empty string".into()));
        }
        if self.download_url.trim().is_empty() {
            return Err(ManagerError::Validation(format!(
                "download_url must be a non-empty string (id '{}')",
                self.id
            )));
        }
        if let Some(mime) = &self.mime_type {
            if mime.trim().is_empty() {
                return Err(ManagerError::Validation(format!(
                    "mime_type must not be empty when present (id '{}')",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

/// Authoritative registry record for one managed file.
///
/// Carries the caller-supplied fields plus the mirrored status fields the
/// engine writes alongside every queue update, so that [`StatusView`]
/// projections read one row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: String,
    pub download_url: String,
    pub mime_type: Option<String>,
    pub version: u64,
    pub protected: bool,
    pub priority: i32,
    pub ttl_seconds: u64,
    pub total_bytes: Option<u64>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    // Mirrored from the queue row.
    pub status: ItemStatus,
    pub bytes_downloaded: u64,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub deferred_reason: Option<String>,
}

impl RegistryEntry {
    /// Build a fresh registry row from a validated registration.
    pub(crate) fn from_registration(reg: FileRegistration, now: DateTime<Utc>) -> Self {
        Self {
            id: reg.id,
            download_url: reg.download_url,
            mime_type: reg.mime_type,
            version: reg.version,
            protected: reg.protected,
            priority: reg.priority,
            ttl_seconds: reg.ttl_seconds,
            total_bytes: reg.total_bytes,
            metadata: reg.metadata,
            registered_at: now,
            updated_at: now,
            status: ItemStatus::Pending,
            bytes_downloaded: 0,
            completed_at: None,
            expires_at: None,
            error_message: None,
            deferred_reason: None,
        }
    }

    /// Overlay the caller-supplied fields of a newer registration,
    /// preserving `registered_at`.
    pub(crate) fn apply_registration(&mut self, reg: FileRegistration, now: DateTime<Utc>) {
        self.download_url = reg.download_url;
        self.mime_type = reg.mime_type;
        self.version = reg.version;
        self.protected = reg.protected;
        self.priority = reg.priority;
        self.ttl_seconds = reg.ttl_seconds;
        self.total_bytes = reg.total_bytes;
        self.metadata = reg.metadata;
        self.updated_at = now;
    }

    /// Mirror the queue row's status fields onto this registry row.
    ///
    /// `total_bytes` is only overwritten once the queue row has learned a
    /// concrete size; a caller-supplied hint survives until then.
    pub(crate) fn apply_mirror(&mut self, queue: &QueueEntry) {
        self.status = queue.status;
        self.bytes_downloaded = queue.bytes_downloaded;
        if queue.total_bytes.is_some() {
            self.total_bytes = queue.total_bytes;
        }
        self.completed_at = queue.completed_at;
        self.expires_at = queue.expires_at;
        self.error_message = queue.error_message.clone();
        self.deferred_reason = queue.deferred_reason.clone();
        self.updated_at = Utc::now();
    }
}

/// Transient download state for one managed file.
///
/// `data` is only populated when the status is `complete` or `expired`;
/// a partially downloaded payload is never stored here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub status: ItemStatus,
    pub data: Option<Vec<u8>>,
    pub mime_type: Option<String>,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    /// Persisted resumption cursor for chunked transfers.
    pub byte_offset: u64,
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub deferred_reason: Option<String>,
}

impl QueueEntry {
    /// A fresh pending row with no payload and zeroed counters.
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ItemStatus::Pending,
            data: None,
            mime_type: None,
            bytes_downloaded: 0,
            total_bytes: None,
            byte_offset: 0,
            retry_count: 0,
            last_attempt_at: None,
            completed_at: None,
            expires_at: None,
            error_message: None,
            deferred_reason: None,
        }
    }

    /// Reset attempt state for a version refresh while keeping the current
    /// payload and resolved MIME type retrievable.
    pub(crate) fn reset_for_refresh(&mut self) {
        self.status = ItemStatus::Pending;
        self.bytes_downloaded = 0;
        self.total_bytes = None;
        self.byte_offset = 0;
        self.retry_count = 0;
        self.last_attempt_at = None;
        self.completed_at = None;
        self.expires_at = None;
        self.error_message = None;
        self.deferred_reason = None;
    }

    /// Progress percentage, or `None` while the total size is unknown.
    pub fn progress_percent(&self) -> Option<u32> {
        percent(self.bytes_downloaded, self.total_bytes)
    }
}

/// Compute a rounded progress percentage. A zero-byte total counts as 100.
pub(crate) fn percent(downloaded: u64, total: Option<u64>) -> Option<u32> {
    total.map(|t| {
        if t == 0 {
            100
        } else {
            ((downloaded as f64 / t as f64) * 100.0).round() as u32
        }
    })
}

/// Read-only status projection built from the registry row alone.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub id: String,
    pub download_url: String,
    pub mime_type: Option<String>,
    pub version: u64,
    pub protected: bool,
    pub priority: i32,
    pub ttl_seconds: u64,
    pub status: ItemStatus,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    /// Rounded percentage; `None` while the total size is unknown.
    pub percent: Option<u32>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub deferred_reason: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl StatusView {
    pub(crate) fn project(entry: &RegistryEntry) -> Self {
        Self {
            id: entry.id.clone(),
            download_url: entry.download_url.clone(),
            mime_type: entry.mime_type.clone(),
            version: entry.version,
            protected: entry.protected,
            priority: entry.priority,
            ttl_seconds: entry.ttl_seconds,
            status: entry.status,
            bytes_downloaded: entry.bytes_downloaded,
            total_bytes: entry.total_bytes,
            percent: percent(entry.bytes_downloaded, entry.total_bytes),
            registered_at: entry.registered_at,
            updated_at: entry.updated_at,
            completed_at: entry.completed_at,
            expires_at: entry.expires_at,
            error_message: entry.error_message.clone(),
            deferred_reason: entry.deferred_reason.clone(),
            metadata: entry.metadata.clone(),
        }
    }
}

/// A retrieved payload with its resolved MIME type.
#[derive(Debug, Clone)]
pub struct RetrievedFile {
    pub data: Vec<u8>,
    pub mime_type: String,
}
