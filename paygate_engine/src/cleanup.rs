//! The cleanup worker.
//!
//! On each tick (again under a cache lock, so one instance sweeps at a time) it expires stale
//! pending sessions and then applies the retention windows: aged-out terminal sessions, old
//! webhook audit rows and, optionally, old complete markers.
//!
//! Expiry runs before deletion on every tick, so a session always spends at least one full
//! retention window in `Expired` before its row disappears.

use chrono::Duration;
use log::*;
use tokio::task::JoinHandle;

use crate::{
    lock::try_lock,
    session_store::session_key,
    traits::{CleanupTotals, PaymentStore, PaymentStoreError, SharedCache},
};

const LOCK_NAME: &str = "cleanup";

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval: std::time::Duration,
    pub lock_ttl: std::time::Duration,
    /// Pending sessions idle for longer than this are marked `Expired`.
    pub pending_expiry: Duration,
    /// How long `Processed` sessions are kept.
    pub processed_retention: Duration,
    /// How long `Cancelled` and `Expired` sessions are kept.
    pub terminal_retention: Duration,
    /// How long webhook audit rows are kept.
    pub events_retention: Duration,
    /// How long complete markers are kept. `None` keeps them forever, trading disk for the
    /// strongest possible dedup guarantee against very late duplicate deliveries.
    pub markers_retention: Option<Duration>,
}

/// One cleanup sweep. Exposed separately from the worker loop so tests can drive it directly.
pub async fn run_cleanup_tick<C, B>(cache: &C, db: &B, config: &CleanupConfig) -> Result<CleanupTotals, PaymentStoreError>
where
    C: SharedCache,
    B: PaymentStore,
{
    let mut totals = CleanupTotals::default();
    let expired = db.expire_stale_pending(config.pending_expiry).await?;
    totals.sessions_expired = expired.len() as u64;
    for session in &expired {
        // Drop the cached copy so status polls see Expired immediately.
        if let Err(e) = cache.delete(&session_key(&session.session_id)).await {
            debug!("🧹️ Could not evict expired session [{}] from the cache: {e}", session.session_id);
        }
    }
    totals.sessions_deleted = db.delete_terminal_sessions(config.processed_retention, config.terminal_retention).await?;
    totals.events_deleted = db.delete_old_webhook_events(config.events_retention).await?;
    if let Some(retention) = config.markers_retention {
        totals.markers_deleted = db.delete_old_markers(retention).await?;
    }
    Ok(totals)
}

/// Starts the cleanup worker. Do not await the returned JoinHandle, as it will run indefinitely.
pub fn start_cleanup_worker<C, B>(cache: C, db: B, config: CleanupConfig) -> JoinHandle<()>
where
    C: SharedCache,
    B: PaymentStore,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(config.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("🧹️ Cleanup worker started");
        loop {
            timer.tick().await;
            let guard = match try_lock(&cache, LOCK_NAME, config.lock_ttl).await {
                Ok(Some(guard)) => guard,
                Ok(None) => {
                    debug!("🧹️ Another instance is cleaning up. Skipping this tick");
                    continue;
                },
                Err(e) => {
                    error!("🧹️ Could not acquire the cleanup lock: {e}");
                    continue;
                },
            };
            match run_cleanup_tick(&cache, &db, &config).await {
                Ok(totals) => {
                    let touched = totals.sessions_expired
                        + totals.sessions_deleted
                        + totals.events_deleted
                        + totals.markers_deleted;
                    if touched > 0 {
                        info!(
                            "🧹️ Cleanup tick complete. {} sessions expired, {} sessions deleted, {} events deleted, \
                             {} markers deleted",
                            totals.sessions_expired,
                            totals.sessions_deleted,
                            totals.events_deleted,
                            totals.markers_deleted
                        );
                    }
                },
                Err(e) => error!("🧹️ Error running cleanup tick: {e}"),
            }
            guard.release().await;
        }
    })
}
