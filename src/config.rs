// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration for the offline data manager.

use std::time::Duration;

/// Default database name used by the persistent store.
pub const DEFAULT_DATABASE_NAME: &str = "offline-data-manager";

/// Default schema version for the persistent store.
pub const DEFAULT_SCHEMA_VERSION: u32 = 1;

/// Default number of concurrent transfers.
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Size of each Range request in a chunked transfer (2 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// Chunked transfers are only used for bodies strictly larger than this (5 MiB).
pub const DEFAULT_CHUNK_THRESHOLD: u64 = 5 * 1024 * 1024;

/// Retries after the first failed attempt; six attempts total.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Base delay for exponential backoff (1s, 2s, 4s, 8s, 16s).
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Tunable settings for the manager and its download engine.
///
/// The defaults match production behavior; tests shrink the backoff and
/// chunk sizes to keep runs fast.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Name of the backing database (used by the persistent store).
    pub database_name: String,
    /// Schema version of the backing database.
    pub schema_version: u32,
    /// Maximum number of transfers running at once.
    pub concurrency: usize,
    /// Bytes requested per Range GET in a chunked transfer.
    pub chunk_size: u64,
    /// Bodies strictly larger than this use chunked transfers.
    pub chunk_threshold: u64,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Base delay for exponential retry backoff.
    pub retry_backoff: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            database_name: DEFAULT_DATABASE_NAME.to_string(),
            schema_version: DEFAULT_SCHEMA_VERSION,
            concurrency: DEFAULT_CONCURRENCY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl ManagerConfig {
    /// Backoff delay before the given retry (1-based), doubling each time.
    pub(crate) fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        self.retry_backoff * 2u32.saturating_pow(exponent)
    }
}
