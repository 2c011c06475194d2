//! Per-session cache of provider bundles.
//!
//! Entries are keyed by `(user, session, config hash)` and bounded twice:
//! per user and globally, each by least-recently-used eviction. Entries
//! expire a fixed TTL after creation, either lazily on access or in the
//! periodic sweep. Concurrent misses on one key share a single factory
//! call.
//!
//! All bookkeeping lives under one lock. Bundles removed under the lock are
//! disposed after it is released.

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use futures::{future::join_all, FutureExt};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    key::CacheKey,
    pending::{Outcome, PendingCreation, PendingCreations, Waiter},
};
use crate::{
    core::{bundle::ProviderBundle, config::ProviderCacheConfig, metrics::McpMetrics},
    error::{McpError, McpResult},
    identity::{SessionId, UserId},
};

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub user_counts: HashMap<UserId, usize>,
    /// Creations still running
    pub pending: usize,
}

struct CacheEntry {
    id: u64,
    bundle: Arc<ProviderBundle>,
    created_at: Instant,
    last_accessed_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) > ttl
    }
}

type Removed = Vec<(CacheKey, CacheEntry)>;

struct CacheState {
    /// Global recency order, most recent first
    entries: LruCache<CacheKey, CacheEntry>,
    /// Per-user recency order; values are entry ids
    by_user: HashMap<UserId, LruCache<CacheKey, u64>>,
    pending: PendingCreations,
    shut_down: bool,
}

impl CacheState {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            by_user: HashMap::new(),
            pending: PendingCreations::default(),
            shut_down: false,
        }
    }

    fn touch(&mut self, key: &CacheKey, now: Instant) -> Option<Arc<ProviderBundle>> {
        let entry = self.entries.get_mut(key)?;
        entry.last_accessed_at = now;
        let bundle = Arc::clone(&entry.bundle);
        if let Some(recency) = self.by_user.get_mut(key.user()) {
            recency.get(key);
        }
        Some(bundle)
    }

    fn insert(&mut self, key: CacheKey, entry: CacheEntry) -> Option<(CacheKey, CacheEntry)> {
        self.by_user
            .entry(key.user().clone())
            .or_insert_with(LruCache::unbounded)
            .put(key.clone(), entry.id);
        self.entries.push(key, entry)
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        if let Some(recency) = self.by_user.get_mut(key.user()) {
            recency.pop(key);
            if recency.is_empty() {
                self.by_user.remove(key.user());
            }
        }
        Some(entry)
    }

    /// Remove `key` only if it still holds the entry with `id`.
    fn remove_if_current(&mut self, key: &CacheKey, id: u64) -> Option<CacheEntry> {
        if self.entries.peek(key).is_some_and(|entry| entry.id == id) {
            self.remove(key)
        } else {
            None
        }
    }

    /// Evict least-recently-used entries until both bounds hold.
    /// The entry just inserted under `fresh` is never chosen.
    fn enforce_limits(&mut self, fresh: &CacheKey, config: &ProviderCacheConfig) -> Removed {
        let mut evicted = Vec::new();

        while let Some(recency) = self.by_user.get(fresh.user()) {
            if recency.len() <= config.max_entries_per_user {
                break;
            }
            let victim = recency
                .iter()
                .rev()
                .find(|(key, _)| *key != fresh)
                .map(|(key, id)| (key.clone(), *id));
            let Some((key, id)) = victim else { break };
            match self.remove_if_current(&key, id) {
                Some(entry) => evicted.push((key, entry)),
                None => break,
            }
        }

        while self.entries.len() > config.max_total_entries {
            let victim = self
                .entries
                .iter()
                .rev()
                .find(|(key, _)| *key != fresh)
                .map(|(key, entry)| (key.clone(), entry.id));
            let Some((key, id)) = victim else { break };
            match self.remove_if_current(&key, id) {
                Some(entry) => evicted.push((key, entry)),
                None => break,
            }
        }

        evicted
    }

    fn take_expired(&mut self, now: Instant, ttl: Duration) -> Removed {
        let expired: Vec<(CacheKey, u64)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now, ttl))
            .map(|(key, entry)| (key.clone(), entry.id))
            .collect();
        expired
            .into_iter()
            .filter_map(|(key, id)| {
                let entry = self.remove_if_current(&key, id)?;
                Some((key, entry))
            })
            .collect()
    }

    fn take_user(&mut self, user: &UserId) -> Removed {
        let keys: Vec<CacheKey> = self
            .by_user
            .get(user)
            .map(|recency| recency.iter().map(|(key, _)| key.clone()).collect())
            .unwrap_or_default();
        keys.into_iter()
            .filter_map(|key| {
                let entry = self.remove(&key)?;
                Some((key, entry))
            })
            .collect()
    }

    fn take_all(&mut self) -> Removed {
        self.by_user.clear();
        let mut removed = Vec::with_capacity(self.entries.len());
        while let Some(pair) = self.entries.pop_lru() {
            removed.push(pair);
        }
        removed
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            total_entries: self.entries.len(),
            user_counts: self
                .by_user
                .iter()
                .map(|(user, recency)| (user.clone(), recency.len()))
                .collect(),
            pending: self.pending.len(),
        }
    }
}

enum Lookup {
    Hit(Arc<ProviderBundle>),
    Join(Waiter),
    /// New pending creation, plus the expired entry it replaces
    Create(PendingCreation, Option<(CacheKey, CacheEntry)>),
}

struct Inner {
    config: ProviderCacheConfig,
    state: Mutex<CacheState>,
    metrics: Arc<McpMetrics>,
    next_id: AtomicU64,
    sweep: CancellationToken,
}

impl Inner {
    fn lock_operational(&self) -> McpResult<parking_lot::MutexGuard<'_, CacheState>> {
        let state = self.state.lock();
        if state.shut_down {
            return Err(McpError::CacheShutdown);
        }
        Ok(state)
    }

    /// Called by the creation task once the factory settled.
    async fn finish_creation(
        &self,
        key: CacheKey,
        pending: PendingCreation,
        result: McpResult<ProviderBundle>,
    ) -> McpResult<Arc<ProviderBundle>> {
        let bundle = match result {
            Ok(bundle) => Arc::new(bundle),
            Err(e) => {
                self.metrics.record_factory_failure();
                self.state
                    .lock()
                    .pending
                    .remove_if_current(&key, pending.id());
                pending.complete(Outcome::Failed(e.to_string()));
                warn!(
                    user = %key.user(),
                    session = %key.session(),
                    error = %e,
                    "Provider factory failed, nothing cached"
                );
                return Err(e);
            }
        };

        let now = Instant::now();
        let (accepted, evicted) = {
            let mut state = self.state.lock();
            if state.pending.remove_if_current(&key, pending.id()) {
                let entry = CacheEntry {
                    id: pending.id(),
                    bundle: Arc::clone(&bundle),
                    created_at: now,
                    last_accessed_at: now,
                };
                let mut evicted: Removed = state.insert(key.clone(), entry).into_iter().collect();
                evicted.extend(state.enforce_limits(&key, &self.config));
                (true, evicted)
            } else {
                (false, Vec::new())
            }
        };

        if !accepted {
            debug!(
                user = %key.user(),
                session = %key.session(),
                "Bundle creation was revoked, disposing result"
            );
            bundle.dispose().await;
            return Err(McpError::CreationCancelled(key.to_string()));
        }

        pending.complete(Outcome::Ready(Arc::clone(&bundle)));
        if !evicted.is_empty() {
            self.metrics.record_evictions(evicted.len());
            dispose_entries(evicted, "evicted").await;
        }
        Ok(bundle)
    }

    async fn purge_expired(&self) -> usize {
        let expired = {
            let mut state = self.state.lock();
            if state.shut_down {
                return 0;
            }
            state.take_expired(Instant::now(), self.config.ttl())
        };
        let count = expired.len();
        if count > 0 {
            self.metrics.record_expirations(count);
            dispose_entries(expired, "expired").await;
        }
        count
    }
}

/// Dispose removed entries on a task of their own.
///
/// The task is spawned before the returned future is first polled, so the
/// disposal completes even if the caller stops waiting for it.
fn dispose_entries(removed: Removed, reason: &'static str) -> impl Future<Output = ()> {
    let task = (!removed.is_empty()).then(|| {
        tokio::spawn(async move {
            let disposals = removed.into_iter().map(|(key, entry)| async move {
                debug!(
                    user = %key.user(),
                    session = %key.session(),
                    idle = ?entry.last_accessed_at.elapsed(),
                    reason,
                    "Removing provider bundle"
                );
                entry.bundle.dispose().await;
            });
            join_all(disposals).await;
        })
    });
    async move {
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(reason, error = %e, "Provider bundle disposal task failed");
            }
        }
    }
}

fn factory_panicked() -> McpError {
    McpError::Factory("provider factory panicked".to_string())
}

fn spawn_sweep(inner: Weak<Inner>, interval: Duration, stop: CancellationToken) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("No tokio runtime available, provider cache relies on lazy expiry only");
        return;
    };

    runtime.spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else { break };
                    let expired = inner.purge_expired().await;
                    if expired > 0 {
                        debug!(expired, "Provider cache sweep removed expired bundles");
                    }
                }
            }
        }
        debug!("Provider cache sweep stopped");
    });
}

/// Cache of provider bundles scoped by user, session and configuration.
pub struct ProviderCache {
    inner: Arc<Inner>,
}

impl ProviderCache {
    /// Create a cache and start its expiry sweep.
    ///
    /// Fails with [`McpError::Config`] when the limits are invalid.
    pub fn new(config: ProviderCacheConfig) -> McpResult<Self> {
        Self::with_metrics(config, Arc::new(McpMetrics::new()))
    }

    pub fn with_metrics(config: ProviderCacheConfig, metrics: Arc<McpMetrics>) -> McpResult<Self> {
        config.validate()?;

        let inner = Arc::new(Inner {
            state: Mutex::new(CacheState::new()),
            metrics,
            next_id: AtomicU64::new(1),
            sweep: CancellationToken::new(),
            config,
        });
        spawn_sweep(
            Arc::downgrade(&inner),
            inner.config.cleanup_interval(),
            inner.sweep.clone(),
        );

        info!(
            max_entries_per_user = inner.config.max_entries_per_user,
            max_total_entries = inner.config.max_total_entries,
            ttl_ms = inner.config.ttl_ms,
            "Provider cache started"
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &ProviderCacheConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> Arc<McpMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Return the cached bundle for `(user, session, config)`, creating it
    /// with `factory` on a miss.
    ///
    /// Concurrent misses on the same key share one factory call. The factory
    /// runs in its own task, so dropping this future does not abandon other
    /// callers waiting on the same creation.
    pub async fn get_or_create<C, F, Fut>(
        &self,
        user_id: impl Into<UserId>,
        session_id: impl Into<SessionId>,
        config: &C,
        factory: F,
    ) -> McpResult<Arc<ProviderBundle>>
    where
        C: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = McpResult<ProviderBundle>> + Send + 'static,
    {
        let key = CacheKey::for_config(user_id.into(), session_id.into(), config)?;
        let now = Instant::now();

        let lookup = {
            let mut state = self.inner.lock_operational()?;

            let mut expired = None;
            let stale = state
                .entries
                .peek(&key)
                .map(|entry| entry.is_expired(now, self.inner.config.ttl()));
            if stale == Some(true) {
                expired = state.remove(&key).map(|entry| (key.clone(), entry));
            }

            if let Some(bundle) = state.touch(&key, now) {
                Lookup::Hit(bundle)
            } else if let Some(waiter) = state.pending.subscribe(&key) {
                Lookup::Join(waiter)
            } else {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                Lookup::Create(state.pending.register(key.clone(), id), expired)
            }
        };

        match lookup {
            Lookup::Hit(bundle) => {
                self.inner.metrics.record_cache_hit();
                Ok(bundle)
            }
            Lookup::Join(waiter) => {
                self.inner.metrics.record_coalesced_wait();
                debug!(
                    user = %key.user(),
                    session = %key.session(),
                    "Joining in-flight bundle creation"
                );
                waiter.wait().await
            }
            Lookup::Create(pending, expired) => {
                self.inner.metrics.record_cache_miss();
                // Spawned before any await so the pending marker is always resolved
                let task = self.spawn_creation(key, pending, factory);

                if let Some(removed) = expired {
                    self.inner.metrics.record_expirations(1);
                    dispose_entries(vec![removed], "expired").await;
                }

                match task.await {
                    Ok(result) => result,
                    Err(e) => Err(McpError::CreationCancelled(format!(
                        "creation task failed: {}",
                        e
                    ))),
                }
            }
        }
    }

    fn spawn_creation<F, Fut>(
        &self,
        key: CacheKey,
        pending: PendingCreation,
        factory: F,
    ) -> JoinHandle<McpResult<Arc<ProviderBundle>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = McpResult<ProviderBundle>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let creation = std::panic::catch_unwind(AssertUnwindSafe(factory));
        tokio::spawn(async move {
            let result = match creation {
                Ok(creation) => AssertUnwindSafe(creation)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(factory_panicked())),
                Err(_) => Err(factory_panicked()),
            };
            inner.finish_creation(key, pending, result).await
        })
    }

    /// Remove and dispose every entry of `user_id`, and revoke the user's
    /// in-flight creations. Other users are untouched.
    pub async fn invalidate_user(&self, user_id: impl Into<UserId>) -> McpResult<()> {
        let user = user_id.into();
        let (removed, revoked) = {
            let mut state = self.inner.lock_operational()?;
            (state.take_user(&user), state.pending.drain_user(&user))
        };

        for pending in &revoked {
            pending.cancel("user invalidated");
        }
        info!(
            user = %user,
            entries = removed.len(),
            pending = revoked.len(),
            "Invalidated provider bundles for user"
        );
        self.inner.metrics.record_invalidations(removed.len());
        dispose_entries(removed, "invalidated").await;
        Ok(())
    }

    /// Remove expired entries now instead of waiting for the sweep.
    pub async fn purge_expired(&self) -> McpResult<usize> {
        if self.is_shut_down() {
            return Err(McpError::CacheShutdown);
        }
        Ok(self.inner.purge_expired().await)
    }

    pub fn get_stats(&self) -> McpResult<CacheStats> {
        Ok(self.inner.lock_operational()?.stats())
    }

    /// Dispose and remove everything. The cache stays usable.
    pub async fn clear(&self) -> McpResult<()> {
        let (removed, revoked) = {
            let mut state = self.inner.lock_operational()?;
            (state.take_all(), state.pending.drain())
        };
        for pending in &revoked {
            pending.cancel("cache cleared");
        }
        info!(
            entries = removed.len(),
            pending = revoked.len(),
            "Cleared provider cache"
        );
        self.inner.metrics.record_cleared(removed.len());
        dispose_entries(removed, "cleared").await;
        Ok(())
    }

    /// Dispose everything, stop the sweep and refuse further use.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> McpResult<()> {
        let (removed, revoked) = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return Ok(());
            }
            state.shut_down = true;
            (state.take_all(), state.pending.drain())
        };
        self.inner.sweep.cancel();

        for pending in &revoked {
            pending.cancel("cache shut down");
        }
        info!(
            entries = removed.len(),
            pending = revoked.len(),
            "Shutting down provider cache"
        );
        dispose_entries(removed, "shutdown").await;
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().shut_down
    }
}

impl Drop for ProviderCache {
    fn drop(&mut self) {
        self.inner.sweep.cancel();
    }
}
