use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands};
use parking_lot::Mutex;
use thiserror::Error;
use threadline_kernel::cache_key;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("external cache unavailable: {0}")]
    Unavailable(String),
    #[error("external cache operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Shared key-value cache reachable over the network.
#[async_trait]
pub trait ExternalCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
    async fn del(&self, key: &str) -> Result<(), CacheError>;
    async fn ping(&self) -> Result<(), CacheError>;
}

pub struct RedisCache {
    pool: deadpool_redis::Pool,
}

impl RedisCache {
    pub fn connect(url: &str) -> Result<Self, CacheError> {
        let pool = deadpool_redis::Config::from_url(url)
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl ExternalCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn().await?;
        conn.get::<_, Option<String>>(key)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheHealth {
    /// Reads and writes go to the external cache.
    External,
    /// External cache configured but unreachable; serving from process memory.
    Fallback,
    /// No external cache configured.
    Local,
}

impl CacheHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheHealth::External => "external",
            CacheHealth::Fallback => "fallback",
            CacheHealth::Local => "local",
        }
    }
}

struct FallbackEntry {
    value: String,
    expires_at: Instant,
}

/// Namespaced get/set/del with TTL over an optional external cache, degrading
/// to an in-process map when the external cache fails.
pub struct CacheLayer {
    environment: String,
    external: Option<Arc<dyn ExternalCache>>,
    op_timeout: Duration,
    degraded: AtomicBool,
    fallback: Mutex<HashMap<String, FallbackEntry>>,
    // Keys written or deleted while degraded; deleted from the external cache
    // before it is trusted again.
    pending_invalidations: Mutex<HashSet<String>>,
}

impl CacheLayer {
    pub fn new(
        environment: &str,
        external: Option<Arc<dyn ExternalCache>>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            environment: environment.to_string(),
            external,
            op_timeout,
            degraded: AtomicBool::new(false),
            fallback: Mutex::new(HashMap::new()),
            pending_invalidations: Mutex::new(HashSet::new()),
        }
    }

    pub fn key(&self, organization_id: &str, logical_name: &str) -> String {
        cache_key(&self.environment, organization_id, logical_name)
    }

    pub fn health(&self) -> CacheHealth {
        match &self.external {
            None => CacheHealth::Local,
            Some(_) if self.degraded.load(Ordering::SeqCst) => CacheHealth::Fallback,
            Some(_) => CacheHealth::External,
        }
    }

    fn healthy_external(&self) -> Option<&Arc<dyn ExternalCache>> {
        self.external
            .as_ref()
            .filter(|_| !self.degraded.load(Ordering::SeqCst))
    }

    pub async fn get(&self, organization_id: &str, logical_name: &str) -> Option<String> {
        let key = self.key(organization_id, logical_name);
        if let Some(external) = self.healthy_external() {
            match tokio::time::timeout(self.op_timeout, external.get(&key)).await {
                Ok(Ok(value)) => return value,
                Ok(Err(e)) => self.degrade(&e),
                Err(_) => self.degrade(&CacheError::Timeout(self.op_timeout)),
            }
        }
        self.fallback_get(&key)
    }

    pub async fn set(&self, organization_id: &str, logical_name: &str, value: &str, ttl: Duration) {
        let key = self.key(organization_id, logical_name);
        loop {
            if let Some(external) = self.healthy_external() {
                match tokio::time::timeout(self.op_timeout, external.set(&key, value, ttl)).await {
                    Ok(Ok(())) => {
                        self.fallback.lock().remove(&key);
                        return;
                    }
                    Ok(Err(e)) => self.degrade(&e),
                    Err(_) => self.degrade(&CacheError::Timeout(self.op_timeout)),
                }
            }
            let entry = FallbackEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            };
            if self.write_fallback(&key, |fallback| {
                fallback.insert(key.clone(), entry);
            }) {
                return;
            }
        }
    }

    pub async fn del(&self, organization_id: &str, logical_name: &str) {
        let key = self.key(organization_id, logical_name);
        loop {
            if let Some(external) = self.healthy_external() {
                match tokio::time::timeout(self.op_timeout, external.del(&key)).await {
                    Ok(Ok(())) => {
                        self.fallback.lock().remove(&key);
                        return;
                    }
                    Ok(Err(e)) => self.degrade(&e),
                    Err(_) => self.degrade(&CacheError::Timeout(self.op_timeout)),
                }
            }
            if self.write_fallback(&key, |fallback| {
                fallback.remove(&key);
            }) {
                return;
            }
        }
    }

    // Applies a fallback write and records the key for replay, both under the
    // invalidation lock so recovery cannot complete between the two. Returns
    // false when recovery already finished and the write belongs externally.
    fn write_fallback(
        &self,
        key: &str,
        apply: impl FnOnce(&mut HashMap<String, FallbackEntry>),
    ) -> bool {
        let mut pending = self.pending_invalidations.lock();
        if self.external.is_some() {
            if !self.degraded.load(Ordering::SeqCst) {
                return false;
            }
            pending.insert(key.to_string());
        }
        apply(&mut self.fallback.lock());
        true
    }

    fn fallback_get(&self, key: &str) -> Option<String> {
        let mut fallback = self.fallback.lock();
        match fallback.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                fallback.remove(key);
                None
            }
            None => None,
        }
    }

    fn degrade(&self, error: &CacheError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(
                from = CacheHealth::External.as_str(),
                to = CacheHealth::Fallback.as_str(),
                error = %error,
                "cache health changed"
            );
        }
    }

    /// One reconnect attempt: ping, replay invalidations recorded while
    /// degraded, drop the fallback copies, then resume external reads.
    pub async fn reconnect_once(&self) -> CacheHealth {
        let Some(external) = self.external.as_ref() else {
            return CacheHealth::Local;
        };
        if !self.degraded.load(Ordering::SeqCst) {
            return CacheHealth::External;
        }
        match tokio::time::timeout(self.op_timeout, external.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "external cache still unreachable");
                return CacheHealth::Fallback;
            }
            Err(_) => {
                debug!("external cache ping timed out");
                return CacheHealth::Fallback;
            }
        }

        // Writes that land in the fallback while replaying add more keys, so
        // drain until the set is empty and flip back under the same lock.
        let mut replayed = 0usize;
        loop {
            let keys: Vec<String> = {
                let pending = self.pending_invalidations.lock();
                if pending.is_empty() {
                    self.fallback.lock().clear();
                    self.degraded.store(false, Ordering::SeqCst);
                    break;
                }
                pending.iter().cloned().collect()
            };
            for key in &keys {
                match tokio::time::timeout(self.op_timeout, external.del(key)).await {
                    Ok(Ok(())) => {
                        self.pending_invalidations.lock().remove(key);
                        replayed += 1;
                    }
                    Ok(Err(e)) => {
                        debug!(error = %e, key = %key, "invalidation replay failed");
                        return CacheHealth::Fallback;
                    }
                    Err(_) => {
                        debug!(key = %key, "invalidation replay timed out");
                        return CacheHealth::Fallback;
                    }
                }
            }
        }

        info!(
            from = CacheHealth::Fallback.as_str(),
            to = CacheHealth::External.as_str(),
            replayed_invalidations = replayed,
            "cache health changed"
        );
        CacheHealth::External
    }

    /// Drops expired fallback entries; returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut fallback = self.fallback.lock();
        let before = fallback.len();
        fallback.retain(|_, entry| entry.expires_at > now);
        before - fallback.len()
    }

    pub fn fallback_len(&self) -> usize {
        self.fallback.lock().len()
    }

    /// Starts the reconnect loop and the fallback sweeper. Both stop when
    /// `shutdown` is cancelled.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        reconnect_interval: Duration,
        sweep_interval: Duration,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if self.external.is_some() {
            let cache = Arc::clone(self);
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(reconnect_interval);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if cache.health() == CacheHealth::Fallback {
                                cache.reconnect_once().await;
                            }
                        }
                    }
                }
            }));
        }

        let cache = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.sweep_expired();
                        if removed > 0 {
                            debug!(removed, "swept expired fallback cache entries");
                        }
                    }
                }
            }
        }));
        handles
    }
}
