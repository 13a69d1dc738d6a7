// SPDX-License-Identifier: MIT OR Apache-2.0
//! Operation counters for a store handle.
//!
//! Low-overhead atomic counters; callers read them through a point-in-time
//! [`MetricsSnapshot`]. Counting stays in the facade so backends do not
//! have to carry instrumentation themselves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Live counters owned by a store handle.
pub struct StoreMetrics {
    fetches: AtomicU64,
    stores: AtomicU64,
    removes: AtomicU64,
    iterated: AtomicU64,
    keys_sealed: AtomicU64,
    keys_unsealed: AtomicU64,
    foreign_skipped: AtomicU64,
    start_time: Instant,
}

impl StoreMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            fetches: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            removes: AtomicU64::new(0),
            iterated: AtomicU64::new(0),
            keys_sealed: AtomicU64::new(0),
            keys_unsealed: AtomicU64::new(0),
            foreign_skipped: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    #[inline]
    pub fn record_fetch(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_store(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_iterated(&self) {
        self.iterated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_keys_sealed(&self, count: u64) {
        self.keys_sealed.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_keys_unsealed(&self, count: u64) {
        self.keys_unsealed.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_foreign_skipped(&self) {
        self.foreign_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            fetches: self.fetches.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            iterated: self.iterated.load(Ordering::Relaxed),
            keys_sealed: self.keys_sealed.load(Ordering::Relaxed),
            keys_unsealed: self.keys_unsealed.load(Ordering::Relaxed),
            foreign_skipped: self.foreign_skipped.load(Ordering::Relaxed),
            uptime_ms: u64::try_from(self.start_time.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of [`StoreMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub fetches: u64,
    pub stores: u64,
    pub removes: u64,
    pub iterated: u64,
    pub keys_sealed: u64,
    pub keys_unsealed: u64,
    pub foreign_skipped: u64,
    pub uptime_ms: u64,
}

impl MetricsSnapshot {
    /// Record-level operations issued against the backend.
    #[must_use]
    pub const fn total_operations(&self) -> u64 {
        self.fetches + self.stores + self.removes + self.iterated
    }
}
