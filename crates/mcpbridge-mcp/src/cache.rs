//! Bounded tool-result cache.
//!
//! LRU with a per-entry TTL. Expired entries are lazily evicted on lookup;
//! a background evictor may additionally call `purge_expired`. The cache is
//! advisory — a miss is never an error.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Cache key: (MCP, tool, input fingerprint).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub mcp: String,
    pub tool: String,
    pub fingerprint: String,
}

impl CacheKey {
    pub fn new(
        mcp: impl Into<String>,
        tool: impl Into<String>,
        fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            mcp: mcp.into(),
            tool: tool.into(),
            fingerprint: fingerprint.into(),
        }
    }
}

struct CacheEntry {
    value: serde_json::Value,
    inserted_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

pub struct ToolCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ToolCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap();
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a value. Returns it only while its age is within the TTL;
    /// an expired entry is evicted and counted as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<serde_json::Value> {
        let mut entries = self.entries.lock();
        // Resolve the lookup before mutating, so the shared borrow from
        // get() has ended by the time pop() runs.
        let fresh = match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                Some(entry.value.clone())
            }
            Some(_) => None,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        match fresh {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                entries.pop(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a value. At capacity the least-recently-used entry is evicted
    /// first; re-inserting an existing key refreshes age and recency.
    pub fn put(&self, key: CacheKey, value: serde_json::Value) {
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
        };
        self.entries.lock().push(key, entry);
    }

    /// Drop every entry whose age exceeds the TTL.
    pub fn purge_expired(&self) {
        let mut entries = self.entries.lock();
        // LruCache has no retain; collect expired keys first.
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, e)| e.inserted_at.elapsed() > self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            entries.pop(&key);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.entries.lock().len(),
        }
    }
}

/// Default cacheability heuristic for tools without an explicit
/// idempotency declaration: write-like verbs are never cached.
pub fn is_write_like(tool: &str) -> bool {
    const WRITE_PREFIXES: &[&str] = &["create", "update", "delete", "write", "insert"];
    WRITE_PREFIXES.iter().any(|p| tool.starts_with(p))
}
