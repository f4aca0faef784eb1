//! Issued-session cache
//!
//! Sessions established by key generation or handshake are kept for
//! `session_token_ttl`. When the cache is full the entry accessed longest ago
//! is evicted.

use crate::config::HybridAuthConfig;
use crate::types::SessionData;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    pub ttl: Duration,
    pub capacity: usize,
}

impl From<&HybridAuthConfig> for CacheLimits {
    fn from(config: &HybridAuthConfig) -> Self {
        CacheLimits {
            ttl: config.session_token_ttl,
            capacity: config.max_cached_sessions,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug)]
struct Entry {
    session: SessionData,
    /// `None` when the TTL reaches past what `Instant` can represent
    expires_at: Option<Instant>,
    last_access: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    stats: CacheStats,
}

#[derive(Debug, Default)]
pub struct SessionCache {
    inner: Mutex<Inner>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: SessionData, limits: CacheLimits) {
        if limits.capacity == 0 {
            return;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        inner.entries.retain(|_, entry| entry.is_live(now));
        while inner.entries.len() >= limits.capacity
            && !inner.entries.contains_key(&session.session_id)
        {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    inner.entries.remove(&id);
                    inner.stats.evictions += 1;
                }
                None => break,
            }
        }

        inner.entries.insert(
            session.session_id.clone(),
            Entry {
                session,
                expires_at: now.checked_add(limits.ttl),
                last_access: now,
            },
        );
    }

    pub fn get(&self, session_id: &str) -> Option<SessionData> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Inner { entries, stats } = &mut *inner;

        match entries.get_mut(session_id) {
            Some(entry) if entry.is_live(now) => {
                entry.last_access = now;
                stats.hits += 1;
                Some(entry.session.clone())
            }
            Some(_) => {
                entries.remove(session_id);
                stats.expirations += 1;
                stats.misses += 1;
                None
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionData> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .remove(session_id)
            .map(|entry| entry.session)
    }

    /// Drop every cached session, returning how many were removed
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = inner.entries.len();
        inner.entries.clear();
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        CacheStats {
            entries: inner.entries.len(),
            ..inner.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> SessionData {
        SessionData {
            session_id: id.to_string(),
            public_key_hash: "0011223344556677".to_string(),
        }
    }

    fn limits(capacity: usize) -> CacheLimits {
        CacheLimits {
            ttl: Duration::from_secs(60),
            capacity,
        }
    }

    #[test]
    fn test_unbounded_ttl_does_not_overflow() {
        let cache = SessionCache::new();
        cache.insert(
            session("s-forever"),
            CacheLimits {
                ttl: Duration::MAX,
                capacity: 4,
            },
        );
        assert!(cache.get("s-forever").is_some());
    }

    #[test]
    fn test_insert_and_get() {
        let cache = SessionCache::new();
        cache.insert(session("s1"), limits(10));
        assert_eq!(cache.get("s1"), Some(session("s1")));
        assert_eq!(cache.get("s2"), None);
        let stats = cache.stats();
        assert_eq!((stats.entries, stats.hits, stats.misses), (1, 1, 1));
    }

    #[test]
    fn test_evicts_least_recently_accessed() {
        let cache = SessionCache::new();
        cache.insert(session("s1"), limits(2));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(session("s2"), limits(2));
        std::thread::sleep(Duration::from_millis(2));
        // Touch s1 so s2 becomes the oldest access
        assert!(cache.get("s1").is_some());
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(session("s3"), limits(2));

        assert!(cache.get("s1").is_some());
        assert!(cache.get("s2").is_none());
        assert!(cache.get("s3").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_expired_entries_are_not_returned() {
        let cache = SessionCache::new();
        cache.insert(
            session("s1"),
            CacheLimits {
                ttl: Duration::from_millis(5),
                capacity: 10,
            },
        );
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("s1"), None);
        assert_eq!(cache.stats().expirations, 1);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_clear_and_remove() {
        let cache = SessionCache::new();
        for id in ["a", "b", "c"] {
            cache.insert(session(id), limits(10));
        }
        assert_eq!(cache.remove("a"), Some(session("a")));
        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_zero_capacity_caches_nothing() {
        let cache = SessionCache::new();
        cache.insert(session("s1"), limits(0));
        assert_eq!(cache.stats().entries, 0);
    }
}
