//! Counters for connection setup and provider cache activity.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Metrics shared by the establisher, coordinator and provider cache.
pub struct McpMetrics {
    // Connection metrics
    connections_opened: AtomicU64,
    connection_errors: AtomicU64,
    connections_abandoned: AtomicU64,
    dispose_errors: AtomicU64,

    // Cache metrics
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    coalesced_waits: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
    cleared: AtomicU64,
    factory_failures: AtomicU64,

    // Per-endpoint connect failures
    endpoint_errors: DashMap<String, u64>,
}

impl McpMetrics {
    pub fn new() -> Self {
        Self {
            connections_opened: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            connections_abandoned: AtomicU64::new(0),
            dispose_errors: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            coalesced_waits: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            cleared: AtomicU64::new(0),
            factory_failures: AtomicU64::new(0),
            endpoint_errors: DashMap::new(),
        }
    }

    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_error(&self, endpoint: &str) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
        *self
            .endpoint_errors
            .entry(endpoint.to_string())
            .or_insert(0) += 1;
    }

    /// A connection was still pending when its bundle timed out.
    pub fn record_connection_abandoned(&self) {
        self.connections_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispose_error(&self) {
        self.dispose_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A caller joined an in-flight creation instead of starting its own.
    pub fn record_coalesced_wait(&self) {
        self.coalesced_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_expirations(&self, count: usize) {
        self.expirations.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_invalidations(&self, count: usize) {
        self.invalidations.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Entries dropped by a full clear of the cache.
    pub fn record_cleared(&self, count: usize) {
        self.cleared.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_factory_failure(&self) {
        self.factory_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Connect failures recorded for one endpoint.
    pub fn endpoint_errors(&self, endpoint: &str) -> u64 {
        self.endpoint_errors
            .get(endpoint)
            .map(|count| *count)
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            connections_abandoned: self.connections_abandoned.load(Ordering::Relaxed),
            dispose_errors: self.dispose_errors.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            coalesced_waits: self.coalesced_waits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            cleared: self.cleared.load(Ordering::Relaxed),
            factory_failures: self.factory_failures.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.connections_opened.store(0, Ordering::Relaxed);
        self.connection_errors.store(0, Ordering::Relaxed);
        self.connections_abandoned.store(0, Ordering::Relaxed);
        self.dispose_errors.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.coalesced_waits.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.expirations.store(0, Ordering::Relaxed);
        self.invalidations.store(0, Ordering::Relaxed);
        self.cleared.store(0, Ordering::Relaxed);
        self.factory_failures.store(0, Ordering::Relaxed);
        self.endpoint_errors.clear();
    }
}

impl Default for McpMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`McpMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connection_errors: u64,
    pub connections_abandoned: u64,
    pub dispose_errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub coalesced_waits: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub cleared: u64,
    pub factory_failures: u64,
}

impl MetricsSnapshot {
    /// Fraction of lookups served from the cache.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}
