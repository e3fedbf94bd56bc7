//! Provider bearer-token caching with stampede protection.
//!
//! Tokens are expensive to mint and rate-limited upstream, so all instances share one cached
//! token. When it goes stale, a single refresher is elected via the cache lock; everyone else
//! waits briefly for the refreshed token to appear. If the election machinery itself is sick,
//! callers fall through to an unguarded refresh: a thundering herd beats an outage.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    lock::try_lock,
    traits::{CacheError, FreshToken, PaymentProvider, ProviderError, SharedCache},
};

const TOKEN_KEY: &str = "paygate:provider:token";
const REFRESH_LOCK: &str = "token_refresh";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// The shared cache representation of a provider token. `expires_at` is always an absolute
/// unix timestamp, regardless of how the provider phrased it on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: i64,
}

impl CachedToken {
    pub fn is_fresh(&self, now: DateTime<Utc>, safety_buffer: Duration) -> bool {
        self.expires_at - now.timestamp() > safety_buffer.as_secs() as i64
    }
}

/// Disambiguates the provider's overloaded expiry field into an absolute unix timestamp.
///
/// Any value beyond 30 days from now cannot plausibly be a seconds-remaining duration for a
/// bearer token, so it is taken as an absolute timestamp; anything else is seconds remaining.
pub fn normalize_expiry(raw: i64, now: DateTime<Utc>) -> i64 {
    let cutoff = now.timestamp() + 30 * 24 * 3600;
    if raw > cutoff {
        raw
    } else {
        now.timestamp() + raw
    }
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// A token expiring within this window is treated as already stale.
    pub safety_buffer: Duration,
    /// TTL on the refresh lock. Bounds how long a crashed refresher blocks its peers.
    pub lock_ttl: Duration,
    /// How many times a losing contender polls the cache for the winner's token.
    pub lock_retries: u32,
    pub lock_retry_delay: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            safety_buffer: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(10),
            lock_retries: 5,
            lock_retry_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Clone)]
pub struct TokenManager<C, P>
where
    C: SharedCache,
    P: PaymentProvider,
{
    cache: C,
    provider: P,
    config: TokenConfig,
}

impl<C, P> TokenManager<C, P>
where
    C: SharedCache,
    P: PaymentProvider,
{
    pub fn new(cache: C, provider: P, config: TokenConfig) -> Self {
        Self { cache, provider, config }
    }

    /// Returns a token that is valid for at least the configured safety buffer.
    pub async fn get_token(&self) -> Result<String, TokenError> {
        if let Some(token) = self.cached_token().await? {
            return Ok(token.access_token);
        }
        match try_lock(&self.cache, REFRESH_LOCK, self.config.lock_ttl).await {
            Ok(Some(guard)) => {
                // Someone may have refreshed between our cache miss and winning the lock.
                if let Some(token) = self.cached_token().await? {
                    guard.release().await;
                    return Ok(token.access_token);
                }
                let result = self.refresh().await;
                guard.release().await;
                result
            },
            Ok(None) => self.await_refresher().await,
            Err(e) => {
                // The cache lock is part of the same backend the token lives in, so a broken
                // lock usually means a broken cache. Refresh unguarded rather than fail.
                warn!("🎫️ Token refresh lock unavailable ({e}). Refreshing without coordination");
                self.refresh().await
            },
        }
    }

    async fn cached_token(&self) -> Result<Option<CachedToken>, TokenError> {
        let raw = match self.cache.get(TOKEN_KEY).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!("🎫️ Token cache read failed: {e}");
                return Ok(None);
            },
        };
        let Some(raw) = raw else { return Ok(None) };
        match serde_json::from_str::<CachedToken>(&raw) {
            Ok(token) if token.is_fresh(Utc::now(), self.config.safety_buffer) => Ok(Some(token)),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!("🎫️ Discarding unparseable cached token: {e}");
                Ok(None)
            },
        }
    }

    /// Polls the cache while another instance refreshes. Falls back to an unguarded refresh if
    /// the winner never delivers; availability wins over refresh economy.
    async fn await_refresher(&self) -> Result<String, TokenError> {
        for _ in 0..self.config.lock_retries {
            tokio::time::sleep(self.config.lock_retry_delay).await;
            if let Some(token) = self.cached_token().await? {
                return Ok(token.access_token);
            }
        }
        debug!("🎫️ Refresh winner did not deliver in time. Refreshing ourselves");
        self.refresh().await
    }

    async fn refresh(&self) -> Result<String, TokenError> {
        let FreshToken { access_token, expires } = self.provider.authenticate().await?;
        let now = Utc::now();
        let expires_at = normalize_expiry(expires, now);
        let token = CachedToken { access_token, expires_at };
        let remaining = (expires_at - now.timestamp()).max(0) as u64;
        // The cache entry dies one safety buffer before the token does, so a cache hit is
        // always usable for at least that long.
        let ttl = remaining.saturating_sub(self.config.safety_buffer.as_secs()).max(1);
        match serde_json::to_string(&token) {
            Ok(serialized) => {
                if let Err(e) = self.cache.set(TOKEN_KEY, &serialized, Duration::from_secs(ttl)).await {
                    warn!("🎫️ Could not cache refreshed token: {e}");
                }
            },
            Err(e) => warn!("🎫️ Could not serialize token for caching: {e}"),
        }
        info!("🎫️ Provider token refreshed. Valid for {remaining}s");
        Ok(token.access_token)
    }
}

/// Turns an authentication failure into `ProviderError::Authentication` so callers can treat
/// "could not get a token" uniformly.
impl From<TokenError> for ProviderError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Provider(p) => p,
            TokenError::Cache(c) => ProviderError::Authentication(c.to_string()),
        }
    }
}
