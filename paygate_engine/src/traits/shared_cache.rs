use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The shared low-latency key-value store.
///
/// All cross-instance coordination in the engine goes through this interface: the session fast
/// path, the token cache, and (via `set_if_absent`) the distributed lock. Implementations must
/// make `set_if_absent` atomic with respect to concurrent callers on other instances.
#[async_trait]
pub trait SharedCache: Clone + Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Atomically stores `value` under `key` only if the key is currently absent.
    /// Returns `true` if the value was stored, `false` if the key already existed.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}
