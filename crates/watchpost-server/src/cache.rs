use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;

/// Logical resources whose computed responses are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Status,
    Keywords,
    Logs,
    Settings,
    Performance,
}

impl CacheKey {
    pub const ALL: [CacheKey; 5] = [
        CacheKey::Status,
        CacheKey::Keywords,
        CacheKey::Logs,
        CacheKey::Settings,
        CacheKey::Performance,
    ];

    /// Faster-moving resources get shorter lifetimes.
    pub fn default_ttl(self) -> Duration {
        let secs = match self {
            CacheKey::Status => 5,
            CacheKey::Keywords => 10,
            CacheKey::Logs => 3,
            CacheKey::Settings => 30,
            CacheKey::Performance => 2,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Value,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }
}

/// Per-resource response cache. Expired entries are dropped on read.
#[derive(Default)]
pub struct ResponseCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: CacheKey) -> Option<Value> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: CacheKey, now: Instant) -> Option<Value> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(&key) {
            Some(entry) if entry.is_fresh(now) => Some(entry.payload.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: CacheKey, payload: Value, ttl: Duration) {
        self.set_at(key, payload, ttl, Instant::now());
    }

    pub fn set_at(&self, key: CacheKey, payload: Value, ttl: Duration, now: Instant) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key,
                CacheEntry {
                    payload,
                    stored_at: now,
                    ttl,
                },
            );
    }

    /// Drops one key. Unknown keys are ignored.
    pub fn invalidate(&self, key: CacheKey) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
    }

    pub fn invalidate_many(&self, keys: &[CacheKey]) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            entries.remove(key);
        }
    }

    pub fn invalidate_all(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
