//! Cache-first session access.
//!
//! Session reads are served from the shared cache when possible and fall back to the durable
//! store on a miss, re-priming the cache on the way out. Cache failures degrade to
//! database-only operation; they never fail a request.

use std::time::Duration;

use log::*;

use crate::{
    db_types::{PaymentSession, SessionId},
    traits::{PaymentStore, PaymentStoreError, SharedCache},
};

pub(crate) fn session_key(id: &SessionId) -> String {
    format!("paygate:session:{id}")
}

#[derive(Clone)]
pub struct SessionStore<C, B>
where
    C: SharedCache,
    B: PaymentStore,
{
    cache: C,
    db: B,
    session_ttl: Duration,
}

impl<C, B> SessionStore<C, B>
where
    C: SharedCache,
    B: PaymentStore,
{
    pub fn new(cache: C, db: B, session_ttl: Duration) -> Self {
        Self { cache, db, session_ttl }
    }

    pub fn db(&self) -> &B {
        &self.db
    }

    /// Stores a brand-new session: cache first for the fast path, then the durable row. If the
    /// durable write fails the cache entry is removed again, so no session ever exists only in
    /// the cache.
    pub async fn create(&self, session: &PaymentSession) -> Result<(), PaymentStoreError> {
        self.prime(session).await;
        if let Err(e) = self.db.insert_session(session).await {
            if let Err(ce) = self.cache.delete(&session_key(&session.session_id)).await {
                warn!("🗄️️ Could not roll back cache entry for session [{}]: {ce}", session.session_id);
            }
            return Err(e);
        }
        Ok(())
    }

    pub async fn fetch(&self, id: &SessionId) -> Result<Option<PaymentSession>, PaymentStoreError> {
        match self.cache.get(&session_key(id)).await {
            Ok(Some(raw)) => match serde_json::from_str::<PaymentSession>(&raw) {
                Ok(session) => return Ok(Some(session)),
                Err(e) => warn!("🗄️️ Discarding unparseable cached session [{id}]: {e}"),
            },
            Ok(None) => {},
            Err(e) => debug!("🗄️️ Session cache read failed for [{id}]. Falling back to the database. {e}"),
        }
        let session = self.db.fetch_session(id).await?;
        if let Some(session) = &session {
            self.prime(session).await;
        }
        Ok(session)
    }

    /// Re-primes the cache with the given (freshly updated) durable row.
    pub async fn refresh(&self, session: &PaymentSession) {
        self.prime(session).await;
    }

    /// Drops the cached copy so the next read sees the durable row. The durable row itself is
    /// left alone.
    pub async fn evict(&self, id: &SessionId) {
        if let Err(e) = self.cache.delete(&session_key(id)).await {
            warn!("🗄️️ Could not evict session [{id}] from the cache: {e}");
        }
    }

    async fn prime(&self, session: &PaymentSession) {
        match serde_json::to_string(session) {
            Ok(serialized) => {
                if let Err(e) = self.cache.set(&session_key(&session.session_id), &serialized, self.session_ttl).await {
                    debug!("🗄️️ Could not cache session [{}]: {e}", session.session_id);
                }
            },
            Err(e) => warn!("🗄️️ Could not serialize session [{}] for caching: {e}", session.session_id),
        }
    }
}
