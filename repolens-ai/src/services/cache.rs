//! Read-path cache with explicit TTLs and repository-scoped invalidation
//!
//! Keys derived from one repository live under `repo:<uuid>:`. Keys derived
//! from every repository (rankings) live under `global:`, and any
//! repository's invalidation drops them.
//!
//! A read that misses takes a [`Stamp`] before querying the store and writes
//! back with [`CacheService::set_as_if_current`]. If an invalidation for the
//! same scope happened in between, the write is skipped so a pre-job result
//! cannot be cached after the job's completion event.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::InsightFilter;

/// Prefix of keys that depend on every repository
pub const GLOBAL_PREFIX: &str = "global:";

/// Prefix shared by every key derived from one repository
pub fn repository_prefix(repository_id: Uuid) -> String {
    format!("repo:{}:", repository_id)
}

pub fn insights_key(repository_id: Uuid, filter: &InsightFilter) -> String {
    format!("repo:{}:insights:{}", repository_id, filter.cache_fragment())
}

pub fn summary_key(repository_id: Uuid) -> String {
    format!("repo:{}:summary", repository_id)
}

pub fn leaderboard_key(limit: u32) -> String {
    format!("{}leaderboard:{}", GLOBAL_PREFIX, limit)
}

/// What to invalidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Key(String),
    Prefix(String),
}

/// Which invalidations a cached value depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Repository(Uuid),
    /// Any repository
    Global,
}

/// Invalidation generation observed before a store read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    scope: Scope,
    generation: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, CacheEntry>,
    generations: HashMap<Uuid, u64>,
    global_generation: u64,
}

impl Entries {
    fn generation(&self, scope: Scope) -> u64 {
        match scope {
            Scope::Repository(id) => self.generations.get(&id).copied().unwrap_or(0),
            Scope::Global => self.global_generation,
        }
    }

    fn insert(&mut self, key: String, value: serde_json::Value, ttl: Duration) {
        let now = Instant::now();
        self.map.retain(|_, e| e.expires_at > now);
        self.map.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + ttl,
            },
        );
    }
}

/// Cache hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Write-backs skipped because the scope was invalidated meanwhile
    pub stale_writes: u64,
}

pub struct CacheService {
    entries: RwLock<Entries>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_writes: AtomicU64,
}

impl CacheService {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_writes: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Value for `key`, or `None` on miss or expiry
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entries = self.entries.read().await;
        match entries.map.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Typed [`get`](Self::get); entries that no longer deserialize count as a miss
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                self.invalidate(Invalidation::Key(key.to_string())).await;
                None
            }
        }
    }

    /// Unconditional store
    pub async fn set(&self, key: impl Into<String>, value: serde_json::Value, ttl: Duration) {
        self.entries.write().await.insert(key.into(), value, ttl);
    }

    /// Current generation of `scope`; take it before reading the store
    pub async fn stamp(&self, scope: Scope) -> Stamp {
        Stamp {
            scope,
            generation: self.entries.read().await.generation(scope),
        }
    }

    /// Store `value` unless `stamp.scope` was invalidated after `stamp` was taken
    ///
    /// Returns whether the value was stored. Values that fail to serialize
    /// are not cached.
    pub async fn set_as_if_current<T: Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
        ttl: Duration,
        stamp: Stamp,
    ) -> bool {
        let key = key.into();
        let json = match serde_json::to_value(value) {
            Ok(json) => json,
            Err(e) => {
                warn!(key = %key, error = %e, "Value not cacheable");
                return false;
            }
        };

        let mut entries = self.entries.write().await;
        if entries.generation(stamp.scope) != stamp.generation {
            self.stale_writes.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Scope invalidated during read, not caching");
            return false;
        }
        entries.insert(key, json, ttl);
        true
    }

    /// Drop one key or every key under a prefix; returns how many were removed
    pub async fn invalidate(&self, target: Invalidation) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.map.len();
        match &target {
            Invalidation::Key(key) => {
                entries.map.remove(key);
            }
            Invalidation::Prefix(prefix) => {
                entries.map.retain(|k, _| !k.starts_with(prefix.as_str()))
            }
        }
        before - entries.map.len()
    }

    /// Drop every entry derived from `repository_id`
    ///
    /// Covers keys under `repo:<id>:` and every `global:` key, and bumps the
    /// repository and global generations.
    pub async fn invalidate_repository(&self, repository_id: Uuid) -> usize {
        let prefix = repository_prefix(repository_id);
        let mut entries = self.entries.write().await;

        *entries.generations.entry(repository_id).or_insert(0) += 1;
        entries.global_generation += 1;

        let before = entries.map.len();
        entries
            .map
            .retain(|key, _| !key.starts_with(&prefix) && !key.starts_with(GLOBAL_PREFIX));
        let removed = before - entries.map.len();

        debug!(repository_id = %repository_id, removed, "Cache invalidated for repository");
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.read().await.map.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_writes: self.stale_writes.load(Ordering::Relaxed),
        }
    }
}
