//! Query result cache.
//!
//! Maps a normalized query plus a scope fingerprint (embedding model,
//! dimensionality, ranking parameters, filters) to a ranked result list.
//!
//! - Bounded by entry count; the least recently used entry is evicted first.
//! - Entries older than the TTL are treated as absent and dropped on access.
//! - [`QueryCache::invalidate_all`] clears everything and bumps a generation
//!   counter. Writers that captured an older generation are ignored by
//!   [`QueryCache::put_if_current`], so a query that raced a reload cannot
//!   repopulate the cache with stale results.
//!
//! All operations take one short `Mutex` section; concurrent writers to the
//! same key resolve as last-write-wins.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::CacheError;
use crate::models::ResultItem;

/// Lowercase, collapse internal whitespace, trim.
///
/// Idempotent: `normalize_query(normalize_query(q)) == normalize_query(q)`.
pub fn normalize_query(query: &str) -> String {
    query
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cache key: normalized query text plus a hashed scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    query: String,
    scope: String,
}

impl CacheKey {
    /// Build a key from raw query text and an arbitrary scope description.
    ///
    /// Two queries that differ only in casing or whitespace map to the same
    /// key when their scopes are equal.
    pub fn new(query: &str, scope: &str) -> Self {
        let digest = Sha256::digest(scope.as_bytes());
        let scope = digest[..12]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();
        Self {
            query: normalize_query(query),
            scope,
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }
}

/// A cached ranked result list.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    pub items: Vec<ResultItem>,
    pub sources: Vec<String>,
    /// Times this entry has been served, including the current hit.
    pub hits: u64,
    pub age: Duration,
}

struct CacheEntry {
    items: Vec<ResultItem>,
    sources: Vec<String>,
    created_at: Instant,
    hits: u64,
}

struct Inner {
    entries: LruCache<CacheKey, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub generation: u64,
}

/// Thread-safe LRU + TTL cache of ranked results.
pub struct QueryCache {
    /// `None` when constructed with a zero capacity (caching disabled).
    inner: Option<Mutex<Inner>>,
    capacity: usize,
    ttl: Duration,
    generation: AtomicU64,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("capacity", &self.capacity)
            .field("ttl", &self.ttl)
            .field("generation", &self.generation())
            .finish()
    }
}

impl QueryCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let inner = NonZeroUsize::new(max_entries).map(|cap| {
            Mutex::new(Inner {
                entries: LruCache::new(cap),
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            })
        });
        Self {
            inner,
            capacity: max_entries,
            ttl,
            generation: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current invalidation epoch.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn lock(&self) -> Result<Option<MutexGuard<'_, Inner>>, CacheError> {
        match &self.inner {
            None => Ok(None),
            Some(m) => m.lock().map(Some).map_err(|_| CacheError::Poisoned),
        }
    }

    /// Look up a fresh entry, promoting it to most recently used.
    pub fn get(&self, key: &CacheKey) -> Result<Option<CachedResult>, CacheError> {
        let Some(mut inner) = self.lock()? else {
            return Ok(None);
        };

        let expired = inner
            .entries
            .peek(key)
            .map(|entry| entry.created_at.elapsed() >= self.ttl);

        let Some(expired) = expired else {
            inner.misses += 1;
            return Ok(None);
        };

        if expired {
            inner.entries.pop(key);
            inner.misses += 1;
            inner.expirations += 1;
            tracing::debug!(query = key.query(), "cache entry expired");
            return Ok(None);
        }

        inner.hits += 1;
        let entry = match inner.entries.get_mut(key) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        entry.hits += 1;
        Ok(Some(CachedResult {
            items: entry.items.clone(),
            sources: entry.sources.clone(),
            hits: entry.hits,
            age: entry.created_at.elapsed(),
        }))
    }

    /// Insert or replace an entry, evicting the LRU entry when full.
    pub fn put(
        &self,
        key: CacheKey,
        items: Vec<ResultItem>,
        sources: Vec<String>,
    ) -> Result<(), CacheError> {
        let Some(mut inner) = self.lock()? else {
            return Ok(());
        };
        Self::insert(&mut inner, key, items, sources);
        Ok(())
    }

    /// Like [`put`](Self::put), but only if no invalidation happened since
    /// `generation` was read. Returns whether the entry was stored.
    pub fn put_if_current(
        &self,
        key: CacheKey,
        items: Vec<ResultItem>,
        sources: Vec<String>,
        generation: u64,
    ) -> Result<bool, CacheError> {
        let Some(mut inner) = self.lock()? else {
            return Ok(false);
        };
        if self.generation.load(Ordering::Acquire) != generation {
            tracing::debug!(query = key.query(), "skipping cache write from stale generation");
            return Ok(false);
        }
        Self::insert(&mut inner, key, items, sources);
        Ok(true)
    }

    fn insert(inner: &mut Inner, key: CacheKey, items: Vec<ResultItem>, sources: Vec<String>) {
        let entry = CacheEntry {
            items,
            sources,
            created_at: Instant::now(),
            hits: 0,
        };
        if let Some((evicted, _)) = inner.entries.push(key.clone(), entry) {
            if evicted != key {
                inner.evictions += 1;
                tracing::debug!(query = evicted.query(), "evicted least recently used entry");
            }
        }
    }

    /// Drop every entry and start a new generation.
    pub fn invalidate_all(&self) {
        match self.lock() {
            Ok(Some(mut inner)) => {
                inner.entries.clear();
                self.generation.fetch_add(1, Ordering::AcqRel);
            }
            Ok(None) => {
                self.generation.fetch_add(1, Ordering::AcqRel);
            }
            Err(_) => {
                // Recover the map from a poisoned lock; clearing it restores a valid state.
                if let Some(m) = &self.inner {
                    let mut inner = m.lock().unwrap_or_else(|e| e.into_inner());
                    inner.entries.clear();
                    m.clear_poison();
                }
                self.generation.fetch_add(1, Ordering::AcqRel);
            }
        }
        tracing::debug!(generation = self.generation(), "query cache invalidated");
    }

    /// Remove all expired entries. Returns how many were dropped.
    pub fn purge_expired(&self) -> Result<usize, CacheError> {
        let Some(mut inner) = self.lock()? else {
            return Ok(0);
        };
        let stale: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.created_at.elapsed() >= self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            inner.entries.pop(key);
        }
        inner.expirations += stale.len() as u64;
        Ok(stale.len())
    }

    /// Number of resident entries (expired ones included until touched).
    pub fn len(&self) -> usize {
        match self.lock() {
            Ok(Some(inner)) => inner.entries.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let generation = self.generation();
        match self.lock() {
            Ok(Some(inner)) => CacheStats {
                size: inner.entries.len(),
                capacity: self.capacity,
                hits: inner.hits,
                misses: inner.misses,
                evictions: inner.evictions,
                expirations: inner.expirations,
                generation,
            },
            _ => CacheStats {
                capacity: self.capacity,
                generation,
                ..CacheStats::default()
            },
        }
    }
}
