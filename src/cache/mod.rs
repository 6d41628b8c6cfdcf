//! Result cache
//!
//! TTL key/value store behind a small async trait, plus the typed wrapper the
//! orchestrator publishes through. The wrapper keeps the last value it
//! published for every key so reads can fall back to it once entries expire or
//! the store goes away.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::RwLock as AsyncRwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::CacheError;

/// Cache keys shared by the writer and the read accessors
pub mod keys {
    use crate::types::Symbol;

    pub const SNAPSHOTS: &str = "market:snapshots";
    pub const SIGNALS: &str = "signals:latest";
    pub const STATS: &str = "signals:stats";
    pub const TRUE_OPENS: &str = "structure:true_opens";

    pub fn fractals(symbol: Symbol) -> String {
        format!("structure:fractals:{symbol}")
    }

    pub fn volume(symbol: Symbol) -> String {
        format!("structure:volume:{symbol}")
    }
}

/// Minimal TTL store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Value stored under `key`, `None` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value` under `key` for `ttl`
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process store; expired entries are dropped lazily on read
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: AsyncRwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every expired entry, returning how many were dropped
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Ok(Some(entry.value.clone()))
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }
        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }
}

/// Fully serialized set of values published together
#[derive(Debug, Default)]
pub struct PublishBatch {
    entries: Vec<(String, String, Duration)>,
}

impl PublishBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize `value` into the batch; nothing reaches the store until publish
    pub fn put<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let json = serde_json::to_string(value)?;
        self.entries.push((key.into(), json, ttl));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Typed cache facade with last-good fallback and degraded tracking
pub struct ResultCache {
    store: Arc<dyn CacheStore>,
    last_good: RwLock<HashMap<String, String>>,
    degraded: AtomicBool,
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            last_good: RwLock::new(HashMap::new()),
            degraded: AtomicBool::new(false),
        }
    }

    /// Whether the last store interaction failed
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Read and decode a live entry. Store and decode failures count as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                self.mark_degraded(key, &e);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    /// Last value published under `key`, regardless of TTL
    pub fn last_good<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let map = self.last_good.read().unwrap_or_else(|e| e.into_inner());
        map.get(key).and_then(|raw| serde_json::from_str(raw).ok())
    }

    /// Swap every key of the batch in. Each key is replaced whole; store
    /// failures degrade the cache but the last-good copy is always updated.
    pub async fn publish(&self, batch: PublishBatch) -> usize {
        {
            let mut map = self.last_good.write().unwrap_or_else(|e| e.into_inner());
            for (key, value, _) in &batch.entries {
                map.insert(key.clone(), value.clone());
            }
        }

        let total = batch.entries.len();
        let mut failed = 0usize;
        for (key, value, ttl) in batch.entries {
            if let Err(e) = self.store.set(&key, value, ttl).await {
                failed += 1;
                self.mark_degraded(&key, &e);
            }
        }

        if failed == 0 {
            self.mark_recovered();
        }
        debug!(keys = total, failed, "Published results to cache");
        total - failed
    }

    fn mark_degraded(&self, key: &str, error: &CacheError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(key, error = %error, "Cache store unavailable, continuing uncached");
        }
    }

    fn mark_recovered(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            tracing::info!("Cache store recovered");
        }
    }
}
