// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Storage quota probing.
//!
//! The download engine consults the probe before dispatching a transfer
//! whose size is known. The headroom predicate keeps 10% of the quota in
//! reserve so the host never runs flush against its storage limit.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;

/// Fraction of the quota held back from the headroom calculation.
pub const QUOTA_HOLDBACK: f64 = 0.10;

/// A point-in-time storage estimate, all values in bytes.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StorageEstimate {
    pub usage: u64,
    pub quota: u64,
    pub available: u64,
}

/// Source of storage usage and quota information.
#[async_trait]
pub trait StorageProbe: Send + Sync {
    /// Current usage, quota, and available bytes.
    async fn estimate(&self) -> StorageEstimate;

    /// Whether `needed` bytes fit while holding back 10% of the quota.
    async fn has_enough_space(&self, needed: u64) -> bool {
        let estimate = self.estimate().await;
        let holdback = (estimate.quota as f64 * QUOTA_HOLDBACK) as u64;
        estimate.available.saturating_sub(holdback) >= needed
    }

    /// Ask the host to grant durable persistence. Default: not supported.
    async fn request_persistence(&self) -> bool {
        false
    }

    /// Whether durable persistence has been granted. Default: no.
    async fn is_persisted(&self) -> bool {
        false
    }
}

/// Probe for hosts without a meaningful quota; never defers anything.
#[derive(Debug, Default)]
pub struct UnboundedProbe;

#[async_trait]
impl StorageProbe for UnboundedProbe {
    async fn estimate(&self) -> StorageEstimate {
        // Half of u64::MAX leaves the holdback arithmetic far from overflow.
        let quota = u64::MAX / 2;
        StorageEstimate {
            usage: 0,
            quota,
            available: quota,
        }
    }
}

/// Probe with a fixed quota and an adjustable usage figure.
///
/// Suited to constrained hosts where the embedder tracks usage itself,
/// and to tests that need deterministic deferral behavior.
#[derive(Debug)]
pub struct FixedProbe {
    quota: u64,
    usage: AtomicU64,
}

impl FixedProbe {
    pub fn new(quota: u64) -> Self {
        Self {
            quota,
            usage: AtomicU64::new(0),
        }
    }

    pub fn set_usage(&self, usage: u64) {
        self.usage.store(usage, Ordering::Relaxed);
    }

    pub fn add_usage(&self, delta: u64) {
        self.usage.fetch_add(delta, Ordering::Relaxed);
    }
}

#[async_trait]
impl StorageProbe for FixedProbe {
    async fn estimate(&self) -> StorageEstimate {
        let usage = self.usage.load(Ordering::Relaxed);
        StorageEstimate {
            usage,
            quota: self.quota,
            available: self.quota.saturating_sub(usage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unbounded_probe_always_has_space() {
        let probe = UnboundedProbe;
        assert!(probe.has_enough_space(u64::MAX / 4).await);
    }

    #[tokio::test]
    async fn test_fixed_probe_holds_back_ten_percent() {
        // quota 1e10, usage 5e9: available 5e9, threshold 4e9.
        let probe = FixedProbe::new(10_000_000_000);
        probe.set_usage(5_000_000_000);

        assert!(probe.has_enough_space(4_000_000_000).await);
        assert!(!probe.has_enough_space(4_000_000_001).await);
        assert!(!probe.has_enough_space(9_000_000_000).await);
    }

    #[tokio::test]
    async fn test_fixed_probe_usage_can_exceed_quota() {
        let probe = FixedProbe::new(100);
        probe.set_usage(150);
        let estimate = probe.estimate().await;
        assert_eq!(estimate.available, 0);
        assert!(!probe.has_enough_space(1).await);
    }
}
