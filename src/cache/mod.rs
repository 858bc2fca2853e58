//! Cache & coalescing store.
//!
//! This module provides:
//! - `CacheEntry`: a value with the instant it was fetched and its TTL
//! - `CoalescingCache`: TTL memoization plus in-flight request sharing
//! - `SharedStateStore`: the typed store every window builds at start-up
//!
//! The check-and-set of the pending slot happens under a synchronous lock
//! with no `.await` in between, so two near-simultaneous callers can never
//! both become the fetching leader for one key.

pub mod store;

pub use store::SharedStateStore;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::error::GuardError;

// ============================================================================
// CacheEntry
// ============================================================================

/// A memoized value.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// Cached value
    pub value: V,
    /// When the value was fetched (or written through)
    pub fetched_at: Instant,
    /// Maximum age
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    /// An entry is valid while strictly younger than its TTL; the boundary
    /// itself counts as expired.
    pub fn is_valid(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < self.ttl
    }
}

// ============================================================================
// CoalescingCache
// ============================================================================

type Outcome<V> = Option<Result<V, GuardError>>;

struct Pending<V> {
    id: u64,
    rx: watch::Receiver<Outcome<V>>,
}

struct Inner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    pending: HashMap<K, Pending<V>>,
    next_id: u64,
}

enum Step<V> {
    Hit(V),
    Join(watch::Receiver<Outcome<V>>),
    Lead(watch::Sender<Outcome<V>>, u64),
}

/// TTL cache that shares one in-flight fetch among concurrent callers.
pub struct CoalescingCache<K, V> {
    name: &'static str,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> fmt::Debug for CoalescingCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescingCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl<K, V> CoalescingCache<K, V> {
    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the leader's pending slot even if the leading future is dropped.
struct PendingGuard<'a, K: Eq + Hash, V> {
    cache: &'a CoalescingCache<K, V>,
    key: &'a K,
    id: u64,
}

impl<K: Eq + Hash, V> Drop for PendingGuard<'_, K, V> {
    fn drop(&mut self) {
        let mut inner = self.cache.lock();
        if inner.pending.get(self.key).is_some_and(|p| p.id == self.id) {
            inner.pending.remove(self.key);
        }
    }
}

impl<K, V> CoalescingCache<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone + Default,
{
    /// Creates an empty cache.
    pub fn new(name: &'static str, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            ttl,
            clock,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                pending: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Returns the TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Reads `key`, degrading a failed fetch to the last known value, or to
    /// `V::default()` when nothing was ever cached. The fallback is never
    /// stored.
    pub async fn get_with<F, Fut>(&self, key: &K, fetch: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, GuardError>>,
    {
        match self.try_get_with(key, fetch).await {
            Ok(value) => value,
            Err(e) => {
                let stale = self.lock().entries.get(key).map(|entry| entry.value.clone());
                tracing::warn!(
                    cache = self.name,
                    ?key,
                    error = %e,
                    has_stale = stale.is_some(),
                    "read failed, serving fallback"
                );
                stale.unwrap_or_default()
            }
        }
    }

    /// Reads `key`, surfacing a failed fetch to every caller that shared it.
    ///
    /// # Errors
    ///
    /// Returns the fetch error. Nothing is cached in that case.
    pub async fn try_get_with<F, Fut>(&self, key: &K, fetch: F) -> Result<V, GuardError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, GuardError>>,
    {
        let mut fetch = Some(fetch);
        loop {
            match self.step(key) {
                Step::Hit(value) => {
                    tracing::debug!(cache = self.name, ?key, "cache hit");
                    return Ok(value);
                }
                Step::Join(mut rx) => {
                    tracing::debug!(cache = self.name, ?key, "joining in-flight fetch");
                    let joined = rx.wait_for(Option::is_some).await.map(|o| o.clone());
                    match joined {
                        Ok(Some(outcome)) => return outcome,
                        // The leader was dropped before finishing; try again.
                        _ => continue,
                    }
                }
                Step::Lead(tx, id) => {
                    let Some(fetch) = fetch.take() else {
                        return Err(GuardError::fetch(self.name, "fetch already consumed"));
                    };
                    return self.lead(key, id, tx, fetch).await;
                }
            }
        }
    }

    fn step(&self, key: &K) -> Step<V> {
        let now = self.clock.now();
        let mut inner = self.lock();

        if let Some(entry) = inner.entries.get(key) {
            if entry.is_valid(now) {
                return Step::Hit(entry.value.clone());
            }
        }

        if let Some(pending) = inner.pending.get(key) {
            return Step::Join(pending.rx.clone());
        }

        let (tx, rx) = watch::channel(None);
        inner.next_id += 1;
        let id = inner.next_id;
        inner.pending.insert(key.clone(), Pending { id, rx });
        Step::Lead(tx, id)
    }

    async fn lead<F, Fut>(
        &self,
        key: &K,
        id: u64,
        tx: watch::Sender<Outcome<V>>,
        fetch: F,
    ) -> Result<V, GuardError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, GuardError>>,
    {
        let _guard = PendingGuard {
            cache: self,
            key,
            id,
        };

        tracing::debug!(cache = self.name, ?key, "fetching");
        let result = fetch().await;

        if let Ok(value) = &result {
            let now = self.clock.now();
            let mut inner = self.lock();
            // A write-through or invalidation while we were fetching removed
            // our slot; the fetched value is older than that write.
            if inner.pending.get(key).is_some_and(|p| p.id == id) {
                inner.entries.insert(
                    key.clone(),
                    CacheEntry {
                        value: value.clone(),
                        fetched_at: now,
                        ttl: self.ttl,
                    },
                );
            }
        }

        tx.send_replace(Some(result.clone()));
        result
    }

    /// Writes `value` through, replacing any cached value and detaching any
    /// in-flight fetch so it cannot overwrite the newer value.
    pub fn put(&self, key: K, value: V) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.pending.remove(&key);
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                fetched_at: now,
                ttl: self.ttl,
            },
        );
    }

    /// Returns the cached value if it is still valid.
    pub fn peek(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        self.lock()
            .entries
            .get(key)
            .filter(|e| e.is_valid(now))
            .map(|e| e.value.clone())
    }

    /// Drops the entry for `key` so the next read refetches.
    pub fn invalidate(&self, key: &K) {
        let mut inner = self.lock();
        inner.entries.remove(key);
        inner.pending.remove(key);
    }

    /// Drops every entry.
    pub fn invalidate_all(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.pending.clear();
    }

    /// Returns true if a fetch for `key` is in flight.
    pub fn is_pending(&self, key: &K) -> bool {
        self.lock().pending.contains_key(key)
    }
}

// ============================================================================
// Tests
// ============================================================================
