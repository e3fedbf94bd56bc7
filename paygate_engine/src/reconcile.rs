//! The reconciliation worker.
//!
//! Webhooks get lost, providers flap and order creation crashes mid-flight. This worker is the
//! safety net that makes every paid invoice eventually produce its orders: on each tick it
//! re-checks the open sessions the webhook path has not settled, under a cache lock so only one
//! instance sweeps at a time.

use log::*;
use tokio::task::JoinHandle;

use crate::{
    confirmation::ConfirmationApi,
    lock::try_lock,
    traits::{OrderCreator, PaymentProvider, PaymentStore, ReconciliationFilter, SharedCache},
};

const LOCK_NAME: &str = "reconcile";

#[derive(Debug, Clone)]
pub struct ReconcileWorkerConfig {
    pub interval: std::time::Duration,
    pub lock_ttl: std::time::Duration,
    pub filter: ReconciliationFilter,
}

/// Starts the reconciliation worker. Do not await the returned JoinHandle, as it will run
/// indefinitely.
pub fn start_reconciliation_worker<C, B, P, O>(
    api: ConfirmationApi<C, B, P, O>,
    cache: C,
    config: ReconcileWorkerConfig,
) -> JoinHandle<()>
where
    C: SharedCache,
    B: PaymentStore,
    P: PaymentProvider,
    O: OrderCreator,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(config.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("🕰️ Reconciliation worker started");
        loop {
            timer.tick().await;
            let guard = match try_lock(&cache, LOCK_NAME, config.lock_ttl).await {
                Ok(Some(guard)) => guard,
                Ok(None) => {
                    debug!("🕰️ Another instance is reconciling. Skipping this tick");
                    continue;
                },
                Err(e) => {
                    error!("🕰️ Could not acquire the reconciliation lock: {e}");
                    continue;
                },
            };
            debug!("🕰️ Running reconciliation pass");
            let stats = api.run_reconciliation_pass(config.filter).await;
            if stats.examined > 0 || stats.failures > 0 {
                info!(
                    "🕰️ Reconciliation pass complete. {} examined, {} confirmed, {} recovered, {} still pending, {} \
                     amount mismatches, {} failures",
                    stats.examined,
                    stats.confirmed,
                    stats.recovered,
                    stats.still_pending,
                    stats.amount_mismatches,
                    stats.failures
                );
            }
            guard.release().await;
        }
    })
}
