//! Short-TTL result cache
//!
//! Entries are fresh for `ttl`. Past that they are only visible through
//! [`ResultCache::get_stale`] (fallback path) until the stale ceiling or until
//! the periodic sweep removes them.

use dashmap::DashMap;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::types::CacheKey;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub data: Value,
    pub stored_at: Instant,
}

impl CacheEntry {
    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }
}

pub struct ResultCache {
    entries: DashMap<CacheKey, CacheEntry>,
    ttl: Duration,
    stale_ceiling: Duration,
}

impl ResultCache {
    pub fn new(ttl: Duration, stale_ceiling_factor: u32) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            stale_ceiling: ttl.saturating_mul(stale_ceiling_factor.max(1)),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh read: `None` once the entry is `ttl` old
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.get(key)?;
        if entry.age() < self.ttl {
            Some(entry.clone())
        } else {
            None
        }
    }

    /// Any entry younger than the stale ceiling
    pub fn get_stale(&self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.get(key)?;
        if entry.age() <= self.stale_ceiling {
            Some(entry.clone())
        } else {
            None
        }
    }

    pub fn set(&self, key: CacheKey, data: Value) {
        self.entries.insert(
            key,
            CacheEntry {
                data,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop every entry at or past its TTL; returns how many were removed
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.age() < ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "Swept expired cache entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
