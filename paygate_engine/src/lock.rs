//! Cache-backed distributed locks for the background workers.
//!
//! The lock is a best-effort mutual-exclusion hint, not a correctness mechanism: it keeps
//! multiple server instances from running the same sweep concurrently and wasting provider
//! calls, but every operation the workers perform is safe to run twice. Correctness comes from
//! the processed-invoice uniqueness constraint, never from this lock.

use std::time::Duration;

use log::*;

use crate::traits::{CacheError, SharedCache};

fn lock_key(name: &str) -> String {
    format!("paygate:lock:{name}")
}

/// Tries to acquire the named lock. Returns `None` if another holder currently has it.
///
/// The TTL bounds how long a crashed holder can block its peers. Holders of long-running work
/// should finish well inside the TTL; there is no lease extension.
pub async fn try_lock<C: SharedCache>(cache: &C, name: &str, ttl: Duration) -> Result<Option<LockGuard<C>>, CacheError> {
    let key = lock_key(name);
    let acquired = cache.set_if_absent(&key, "1", ttl).await?;
    if acquired {
        trace!("🔒️ Lock [{name}] acquired");
        Ok(Some(LockGuard { cache: cache.clone(), key, released: false }))
    } else {
        trace!("🔒️ Lock [{name}] is held elsewhere. Skipping");
        Ok(None)
    }
}

/// Holds the named lock until released or dropped. Prefer explicit [`LockGuard::release`]; the
/// drop path can only issue a fire-and-forget delete.
pub struct LockGuard<C: SharedCache> {
    cache: C,
    key: String,
    released: bool,
}

impl<C: SharedCache> LockGuard<C> {
    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.cache.delete(&self.key).await {
            // The TTL will reap it. The next tick on this instance may be skipped.
            warn!("🔒️ Could not release lock [{}]: {e}", self.key);
        }
    }
}

impl<C: SharedCache> Drop for LockGuard<C> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let cache = self.cache.clone();
        let key = std::mem::take(&mut self.key);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = cache.delete(&key).await {
                    warn!("🔒️ Could not release dropped lock [{key}]: {e}");
                }
            });
        }
    }
}
