//! Shared-cache backends.
//!
//! [`RedisCache`] is the production backend. [`MemoryCache`] is a single-process stand-in for
//! tests and local development; its `set_if_absent` is only atomic within one process, so the
//! distributed lock degrades to a per-instance lock when it is used.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use log::*;
use redis::{aio::ConnectionManager, AsyncCommands};

use crate::traits::{CacheError, SharedCache};

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Backend(e.to_string())
    }
}

#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    /// Connects to redis at `url`. The connection manager reconnects on its own, so this is the
    /// only place a redis outage is a hard error.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(|e| CacheError::Backend(e.to_string()))?;
        let manager = client.get_tokio_connection_manager().await?;
        debug!("🗄️️ Connected to redis cache");
        Ok(Self { manager })
    }
}

#[async_trait]
impl SharedCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let ttl_secs = usize::try_from(ttl.as_secs()).unwrap_or(usize::MAX).max(1);
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.manager.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        // SET NX PX returns Okay when the key was set and Nil when it already existed.
        let reply: redis::Value = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        match reply {
            redis::Value::Okay => Ok(true),
            redis::Value::Nil => Ok(false),
            other => Err(CacheError::Backend(format!("Unexpected SET NX reply: {other:?}"))),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>>, CacheError> {
        self.entries.lock().map_err(|e| CacheError::Backend(format!("Cache mutex poisoned: {e}")))
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.lock()?;
        match entries.get(key) {
            Some((_, deadline)) if *deadline <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            },
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.lock()?;
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut entries = self.lock()?;
        let live = matches!(entries.get(key), Some((_, deadline)) if *deadline > Instant::now());
        if live {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut entries = self.lock()?;
        entries.remove(key);
        Ok(())
    }
}

/// Runtime-selected cache backend, so the server binary can run with or without redis.
#[derive(Clone)]
pub enum CacheDriver {
    Redis(RedisCache),
    Memory(MemoryCache),
}

impl CacheDriver {
    /// Connects to redis when `url` is given, otherwise falls back to the in-process cache.
    pub async fn from_url(url: Option<&str>) -> Result<Self, CacheError> {
        match url {
            Some(url) => {
                info!("🗄️️ Using redis shared cache");
                Ok(CacheDriver::Redis(RedisCache::connect(url).await?))
            },
            None => {
                warn!(
                    "🗄️️ No redis URL is configured. Falling back to the in-process cache. Cross-instance \
                     locking and session sharing are NOT available in this mode."
                );
                Ok(CacheDriver::Memory(MemoryCache::new()))
            },
        }
    }
}

#[async_trait]
impl SharedCache for CacheDriver {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self {
            CacheDriver::Redis(c) => c.get(key).await,
            CacheDriver::Memory(c) => c.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        match self {
            CacheDriver::Redis(c) => c.set(key, value, ttl).await,
            CacheDriver::Memory(c) => c.set(key, value, ttl).await,
        }
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        match self {
            CacheDriver::Redis(c) => c.set_if_absent(key, value, ttl).await,
            CacheDriver::Memory(c) => c.set_if_absent(key, value, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        match self {
            CacheDriver::Redis(c) => c.delete(key).await,
            CacheDriver::Memory(c) => c.delete(key).await,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn memory_cache_round_trip_and_expiry() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        cache.delete("k").await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
        // An entry with a zero TTL is dead on arrival.
        cache.set("gone", "v", Duration::ZERO).await.unwrap();
        assert!(cache.get("gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_cache_set_if_absent_is_first_wins() {
        let cache = MemoryCache::new();
        assert!(cache.set_if_absent("lock", "a", Duration::from_secs(60)).await.unwrap());
        assert!(!cache.set_if_absent("lock", "b", Duration::from_secs(60)).await.unwrap());
        assert_eq!(cache.get("lock").await.unwrap().as_deref(), Some("a"));
        // An expired entry no longer blocks the key.
        cache.set("lock2", "x", Duration::ZERO).await.unwrap();
        assert!(cache.set_if_absent("lock2", "y", Duration::from_secs(60)).await.unwrap());
    }
}
