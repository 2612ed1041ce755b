//! TTL-bounded oracle cache.
//!
//! Snapshots younger than the TTL are served from an LRU. Expired entries
//! are never served: the inner oracle is re-read with bounded retries and,
//! if every attempt fails, the caller gets `OracleUnavailable`.

use crate::config::OracleConfig;
use crate::oracle::{ChainOracle, ChainSnapshot, OracleError};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt::Display;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OracleCacheStats {
    /// Reads served from a fresh entry.
    pub hits: u64,
    /// Reads that went to the inner oracle.
    pub misses: u64,
    /// Reads that failed after all retries.
    pub failures: u64,
}

#[derive(Debug, Clone, Copy)]
struct CachedSnapshot {
    snapshot: ChainSnapshot,
    fetched_at: Instant,
}

/// Fail-closed caching wrapper around a [`ChainOracle`].
pub struct CachedOracle<O, C, K> {
    inner: O,
    entries: Mutex<LruCache<(C, K), CachedSnapshot>>,
    ttl: Duration,
    retry_attempts: u32,
    retry_backoff: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
}

impl<O, C, K> CachedOracle<O, C, K>
where
    O: ChainOracle<C, K>,
    C: Clone + Eq + Hash + Display + Send + Sync,
    K: Clone + Eq + Hash + Display + Send + Sync,
{
    /// Wrap `inner` using the TTL and retry policy from `config`.
    #[must_use]
    pub fn new(inner: O, config: &OracleConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: config.ttl(),
            retry_attempts: config.retry_attempts,
            retry_backoff: config.retry_backoff(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Drop every cached entry for `client`.
    pub fn invalidate(&self, client: &C) {
        let mut entries = self.entries.lock();
        let stale: Vec<(C, K)> = entries
            .iter()
            .filter(|((c, _), _)| c == client)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            entries.pop(&key);
        }
    }

    /// Number of cached entries (fresh or not).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> OracleCacheStats {
        OracleCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn fresh(&self, key: &(C, K)) -> Option<ChainSnapshot> {
        let mut entries = self.entries.lock();
        let entry = *entries.get(key)?;
        if entry.fetched_at.elapsed() < self.ttl {
            return Some(entry.snapshot);
        }
        entries.pop(key);
        None
    }

    async fn read_through(&self, client: &C, vendor: &K) -> Result<ChainSnapshot, OracleError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.snapshot(client, vendor).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if attempt < self.retry_attempts => {
                    attempt += 1;
                    debug!("Oracle read for {client} failed (attempt {attempt}): {e}");
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Oracle read for {client} failed after {} attempts: {e}",
                        attempt + 1
                    );
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl<O, C, K> ChainOracle<C, K> for CachedOracle<O, C, K>
where
    O: ChainOracle<C, K>,
    C: Clone + Eq + Hash + Display + Send + Sync,
    K: Clone + Eq + Hash + Display + Send + Sync,
{
    async fn snapshot(&self, client: &C, vendor: &K) -> Result<ChainSnapshot, OracleError> {
        let key = (client.clone(), vendor.clone());
        if let Some(snapshot) = self.fresh(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(snapshot);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let snapshot = self.read_through(client, vendor).await?;
        self.entries.lock().put(
            key,
            CachedSnapshot {
                snapshot,
                fetched_at: Instant::now(),
            },
        );
        Ok(snapshot)
    }
}
