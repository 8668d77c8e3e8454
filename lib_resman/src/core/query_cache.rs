//! # Query Deduplicator / Cache
//!
//! Sits between domain code and its backend calls. Given a key and a producer,
//! [`QueryCache::get`] guarantees that **at most one producer call per key is
//! outstanding at any instant**: concurrent callers for the same key await one
//! shared future. Successful results are cached under the freshness policy that
//! matches the key; failures are fanned out to every waiter and never cached.
//!
//! ## Eviction
//!
//! - **TTL**: expired entries are purged on read and by the periodic
//!   [`QueryCache::sweep`]. An expired entry is never served.
//! - **Per-prefix cap**: when an insertion would push a prefix past its
//!   `max_entries`, the oldest ~30% of that prefix's entries are dropped. This
//!   is age-based, not LRU.
//! - **Pending cap**: when the number of in-flight requests reaches the cap, the
//!   oldest `Low` request is discarded. Its producer keeps running, but the
//!   result is never cached and its waiters are rejected.
//! - **Pressure**: see [`QueryCache::apply_pressure`].
//!
//! ## Cancellation
//!
//! Producers are never aborted. Every in-flight request carries a
//! request handle whose flags are checked before a result is published.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::configs::CacheSettings;
use crate::core::memory_guard::{
    PressureLevel, PressureListener, PressureSample, PressureThresholds,
};
use crate::core::policy::{PolicyTable, Priority};
use crate::error::{ResourceError, ResourceResult};
use crate::sync::mutex_lock;

const SOURCE: &str = "core::query_cache";

/// Per-call options for [`QueryCache::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetOptions {
    /// Overrides the priority class of the key's policy.
    pub priority: Option<Priority>,
    /// Serve a fresh cached value when one exists.
    pub use_cache: bool,
    /// Skip the cache even if a fresh value exists. In-flight requests are
    /// still joined.
    pub force_fresh: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            priority: None,
            use_cache: true,
            force_fresh: false,
        }
    }
}

impl GetOptions {
    /// Default options: use the cache, policy priority.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an explicit priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Bypasses cached values for this call.
    pub fn force_fresh(mut self) -> Self {
        self.force_fresh = true;
        self
    }

    /// Disables cache reads for this call.
    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }
}

/// Counters describing cache behaviour since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Calls served from a fresh entry.
    pub hits: u64,
    /// Calls that started a producer.
    pub misses: u64,
    /// Calls that joined an in-flight producer.
    pub joins: u64,
    /// Results written to the cache.
    pub stores: u64,
    /// Results not written because of soft mode or discarded bookkeeping.
    pub skipped_stores: u64,
    /// Entries purged because their TTL elapsed.
    pub expired: u64,
    /// Entries removed by the per-prefix cap.
    pub capacity_evictions: u64,
    /// Entries removed by memory pressure.
    pub pressure_evictions: u64,
    /// In-flight requests discarded by the pending cap.
    pub pending_evictions: u64,
    /// Producer calls that failed.
    pub producer_failures: u64,
}

/// Bookkeeping handle for one in-flight producer call.
///
/// Nothing here aborts the producer; the flags only decide what happens to its
/// result once it settles.
#[derive(Debug)]
pub(crate) struct RequestHandle {
    id: u64,
    discarded: AtomicBool,
    cacheable: AtomicBool,
}

impl RequestHandle {
    fn new(id: u64) -> Self {
        Self {
            id,
            discarded: AtomicBool::new(false),
            cacheable: AtomicBool::new(true),
        }
    }

    /// Drops the result entirely: it is neither cached nor delivered.
    fn discard(&self) {
        self.discarded.store(true, Ordering::Release);
        self.cacheable.store(false, Ordering::Release);
    }

    /// Delivers the result to current waiters but keeps it out of the cache.
    fn forbid_caching(&self) {
        self.cacheable.store(false, Ordering::Release);
    }

    fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    fn is_cacheable(&self) -> bool {
        self.cacheable.load(Ordering::Acquire)
    }
}

type SharedFetch<V> = Shared<BoxFuture<'static, ResourceResult<Arc<V>>>>;

struct CacheEntry<V> {
    value: Arc<V>,
    stored_at: Instant,
    ttl: Duration,
    priority: Priority,
    prefix: String,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) <= self.ttl
    }
}

struct PendingRequest<V> {
    handle: Arc<RequestHandle>,
    fetch: SharedFetch<V>,
    started_at: Instant,
    priority: Priority,
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    pending: HashMap<String, PendingRequest<V>>,
    level: PressureLevel,
    next_request_id: u64,
    stats: CacheStats,
}

struct CacheInner<V> {
    policies: Arc<PolicyTable>,
    settings: CacheSettings,
    thresholds: PressureThresholds,
    state: Mutex<CacheState<V>>,
}

/// # Query Cache
///
/// Cheap to clone; clones share the same state.
pub struct QueryCache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for QueryCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> QueryCache<V>
where
    V: Send + Sync + 'static,
{
    /// Creates an empty cache governed by `policies`.
    pub fn new(
        policies: Arc<PolicyTable>,
        settings: CacheSettings,
        thresholds: PressureThresholds,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                policies,
                settings,
                thresholds,
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    pending: HashMap::new(),
                    level: PressureLevel::Nominal,
                    next_request_id: 0,
                    stats: CacheStats::default(),
                }),
            }),
        }
    }

    /// # Get
    ///
    /// Returns the value for `key`, calling `producer` only when neither a
    /// fresh entry nor an in-flight request exists. Must be called from within
    /// a Tokio runtime: the producer runs on a spawned task so that it settles
    /// (and its bookkeeping is cleaned up) even if every caller goes away.
    pub async fn get<F, Fut>(&self, key: &str, producer: F, options: GetOptions) -> ResourceResult<Arc<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let fetch = {
            let mut guard = mutex_lock(&self.inner.state, SOURCE, "get");
            let state = &mut *guard;
            let now = Instant::now();

            if options.use_cache && !options.force_fresh {
                let fresh = state.entries.get(key).map(|entry| {
                    entry
                        .is_fresh(now)
                        .then(|| Arc::clone(&entry.value))
                });
                match fresh {
                    Some(Some(value)) => {
                        state.stats.hits += 1;
                        debug!(key, "Cache hit");
                        return Ok(value);
                    }
                    Some(None) => {
                        state.entries.remove(key);
                        state.stats.expired += 1;
                        debug!(key, "Purged expired entry on read");
                    }
                    None => {}
                }
            }

            if let Some(pending) = state.pending.get(key) {
                state.stats.joins += 1;
                debug!(key, "Joined in-flight request");
                pending.fetch.clone()
            } else {
                let priority = options
                    .priority
                    .unwrap_or_else(|| self.inner.policies.resolve(key).priority);
                if state.pending.len() >= self.inner.settings.max_pending
                    && !self.inner.evict_oldest_low_pending(state)
                    && priority == Priority::Low
                {
                    warn!(key, "Pending request cap reached; rejecting low-priority request");
                    return Err(ResourceError::CapacityRejection {
                        resource: "pending request",
                        id: key.to_string(),
                    });
                }
                state.stats.misses += 1;
                self.start_fetch(state, key, producer, priority, now)
            }
        };

        fetch.await
    }

    fn start_fetch<F, Fut>(
        &self,
        state: &mut CacheState<V>,
        key: &str,
        producer: F,
        priority: Priority,
        now: Instant,
    ) -> SharedFetch<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        state.next_request_id += 1;
        let handle = Arc::new(RequestHandle::new(state.next_request_id));

        let weak = Arc::downgrade(&self.inner);
        let task_key = key.to_string();
        let task_handle = Arc::clone(&handle);
        let task = tokio::spawn(async move {
            let outcome = match std::panic::catch_unwind(AssertUnwindSafe(producer)) {
                Ok(fut) => AssertUnwindSafe(fut)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("producer panicked"))),
                Err(_) => Err(anyhow::anyhow!("producer panicked")),
            };
            CacheInner::settle(weak, &task_key, &task_handle, priority, outcome)
        });

        let fetch = async move { task.await.unwrap_or(Err(ResourceError::Shutdown)) }
            .boxed()
            .shared();

        state.pending.insert(
            key.to_string(),
            PendingRequest {
                handle,
                fetch: fetch.clone(),
                started_at: now,
                priority,
            },
        );
        debug!(key, %priority, in_flight = state.pending.len(), "Started producer");
        fetch
    }

    /// Removes every entry whose key contains `pattern`. Returns how many were removed.
    ///
    /// Matching in-flight requests lose their bookkeeping too: their current
    /// waiters still get the value, but it is not cached, and the next caller
    /// starts a fresh fetch.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "invalidate");
        let before = state.entries.len();
        state.entries.retain(|key, _| !key.contains(pattern));
        let removed = before - state.entries.len();

        let mut detached = 0;
        state.pending.retain(|key, pending| {
            if !key.contains(pattern) {
                return true;
            }
            pending.handle.forbid_caching();
            detached += 1;
            false
        });

        if removed > 0 || detached > 0 {
            debug!(pattern, removed, detached, "Invalidated entries");
        }
        removed
    }

    /// Purges every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "sweep");
        let now = Instant::now();
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.is_fresh(now));
        let removed = before - state.entries.len();
        state.stats.expired += removed as u64;
        if removed > 0 {
            debug!(removed, remaining = state.entries.len(), "Swept expired entries");
        }
        removed
    }

    /// # Apply Pressure
    ///
    /// Moves the cache into the degradation mode matching `sample`:
    ///
    /// - `Soft`: only `Critical` results are inserted from now on.
    /// - `Hard`: every non-critical entry is dropped immediately, and
    ///   non-critical in-flight requests lose their bookkeeping. Their producers
    ///   finish and current waiters still get the value, but it is not cached.
    /// - `Emergency`: everything is dropped, critical entries and requests included.
    pub fn apply_pressure(&self, sample: &PressureSample) {
        let level = self.inner.thresholds.level(sample.used_ratio);
        let mut state = mutex_lock(&self.inner.state, SOURCE, "apply_pressure");
        let previous = std::mem::replace(&mut state.level, level);

        let keep_critical = match level {
            PressureLevel::Nominal | PressureLevel::Soft => {
                if level != previous {
                    info!(?previous, ?level, "Cache degradation mode changed");
                }
                return;
            }
            PressureLevel::Hard => true,
            PressureLevel::Emergency => false,
        };

        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| keep_critical && entry.priority.is_critical());
        let dropped_entries = before - state.entries.len();

        let mut dropped_pending = 0;
        state.pending.retain(|_, pending| {
            if keep_critical && pending.priority.is_critical() {
                return true;
            }
            pending.handle.forbid_caching();
            dropped_pending += 1;
            false
        });

        state.stats.pressure_evictions += dropped_entries as u64;
        if dropped_entries > 0 || dropped_pending > 0 || level != previous {
            warn!(
                ?level,
                used_ratio = sample.used_ratio,
                dropped_entries,
                dropped_pending,
                remaining = state.entries.len(),
                "Cache shed under memory pressure"
            );
        }
    }

    /// Drops every entry and forgets every in-flight request.
    pub fn clear(&self) {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "clear");
        state.entries.clear();
        for pending in state.pending.values() {
            pending.handle.forbid_caching();
        }
        state.pending.clear();
    }

    /// Returns the cached value for `key` if it is still fresh, without
    /// touching the producer path or the statistics.
    pub fn peek(&self, key: &str) -> Option<Arc<V>> {
        let state = mutex_lock(&self.inner.state, SOURCE, "peek");
        let now = Instant::now();
        state
            .entries
            .get(key)
            .filter(|entry| entry.is_fresh(now))
            .map(|entry| Arc::clone(&entry.value))
    }

    /// Number of cached entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "len").entries.len()
    }

    /// Returns `true` when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of in-flight requests with bookkeeping.
    pub fn pending_len(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "pending_len").pending.len()
    }

    /// Current degradation level.
    pub fn level(&self) -> PressureLevel {
        mutex_lock(&self.inner.state, SOURCE, "level").level
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        mutex_lock(&self.inner.state, SOURCE, "stats").stats
    }

    /// The policy table this cache resolves keys against.
    pub fn policies(&self) -> &PolicyTable {
        &self.inner.policies
    }

    /// Sweeps every `period` until `shutdown` is cancelled.
    pub async fn run_sweeper(&self, period: Duration, shutdown: tokio_util::sync::CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep();
                }
            }
        }
    }
}

impl<V> CacheInner<V> {
    /// Publishes a settled producer result. Runs exactly once per request.
    fn settle(
        weak: Weak<Self>,
        key: &str,
        handle: &RequestHandle,
        priority: Priority,
        outcome: anyhow::Result<V>,
    ) -> ResourceResult<Arc<V>> {
        let outcome = outcome
            .map(Arc::new)
            .map_err(|cause| ResourceError::producer(key, cause));

        let Some(inner) = weak.upgrade() else {
            return outcome;
        };
        let mut state = mutex_lock(&inner.state, SOURCE, "settle");

        // A newer request may own the slot if this one was evicted.
        if state
            .pending
            .get(key)
            .is_some_and(|pending| pending.handle.id == handle.id)
        {
            state.pending.remove(key);
        }

        if handle.is_discarded() {
            debug!(key, "Discarded result of evicted request");
            return Err(ResourceError::CapacityRejection {
                resource: "pending request",
                id: key.to_string(),
            });
        }

        match &outcome {
            Ok(value) if handle.is_cacheable() => {
                inner.store(&mut state, key, Arc::clone(value), priority);
            }
            Ok(_) => {
                state.stats.skipped_stores += 1;
                debug!(key, "Result delivered but not cached");
            }
            Err(err) => {
                state.stats.producer_failures += 1;
                debug!(key, error = %err, "Producer failed");
            }
        }
        outcome
    }

    fn store(&self, state: &mut CacheState<V>, key: &str, value: Arc<V>, priority: Priority) {
        if state.level >= PressureLevel::Soft && !priority.is_critical() {
            state.stats.skipped_stores += 1;
            debug!(key, level = ?state.level, "Soft mode: skipping non-critical insert");
            return;
        }

        let policy = self.policies.resolve(key);
        if !state.entries.contains_key(key) {
            let in_prefix = state
                .entries
                .values()
                .filter(|entry| entry.prefix == policy.prefix_match)
                .count();
            if in_prefix + 1 > policy.max_entries {
                let evicted = self.evict_oldest_in_prefix(state, &policy.prefix_match, in_prefix);
                state.stats.capacity_evictions += evicted as u64;
            }
        }

        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl: policy.ttl,
                priority,
                prefix: policy.prefix_match.clone(),
            },
        );
        state.stats.stores += 1;
    }

    /// Drops the oldest share of a prefix's entries. Age-based, not LRU.
    fn evict_oldest_in_prefix(&self, state: &mut CacheState<V>, prefix: &str, in_prefix: usize) -> usize {
        let quota = ((in_prefix as f64) * self.settings.eviction_fraction).ceil() as usize;
        let quota = quota.clamp(1, in_prefix.max(1));

        let mut aged: Vec<(Instant, String)> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.prefix == prefix)
            .map(|(key, entry)| (entry.stored_at, key.clone()))
            .collect();
        aged.sort();

        for (_, key) in aged.iter().take(quota) {
            state.entries.remove(key);
        }
        let evicted = quota.min(aged.len());
        debug!(prefix, evicted, "Prefix over capacity; evicted oldest entries");
        evicted
    }

    /// Discards the oldest low-priority in-flight request. Returns `false` if
    /// there was none.
    fn evict_oldest_low_pending(&self, state: &mut CacheState<V>) -> bool {
        let victim = state
            .pending
            .iter()
            .filter(|(_, pending)| pending.priority == Priority::Low)
            .min_by_key(|(_, pending)| (pending.started_at, pending.handle.id))
            .map(|(key, _)| key.clone());

        let Some(victim) = victim else {
            return false;
        };
        if let Some(pending) = state.pending.remove(&victim) {
            pending.handle.discard();
            state.stats.pending_evictions += 1;
            warn!(key = %victim, "Pending request cap reached; discarded oldest low-priority request");
        }
        true
    }
}

impl<V> PressureListener for QueryCache<V>
where
    V: Send + Sync + 'static,
{
    fn on_pressure(&self, sample: &PressureSample) {
        self.apply_pressure(sample);
    }
}
