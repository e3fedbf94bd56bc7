use std::{net::IpAddr, str::FromStr, time::Duration};

use actix_web::{
    dev::{Server, Service},
    http::KeepAlive,
    middleware::Logger,
    web,
    App,
    HttpServer,
};
use futures::{future::ok, FutureExt};
use log::{info, warn};
use paygate_engine::{
    cache::CacheDriver,
    cleanup::{start_cleanup_worker, CleanupConfig},
    reconcile::{start_reconciliation_worker, ReconcileWorkerConfig},
    token::TokenConfig,
    traits::ReconciliationFilter,
    ConfirmationApiConfig,
    SqliteDatabase,
};
use provider_client::{ProviderApi, ProviderConfig};

use crate::{
    config::ServerConfig,
    errors::ServerError,
    integrations::orders::{OrderServiceClient, OrderServiceConfig},
    routes::{cancel_session, checkout, health, internal_notification, payment_callback, session_status, PaymentsApi},
};

pub async fn run_server(config: ServerConfig) -> Result<(), ServerError> {
    let db = SqliteDatabase::new_with_url(&config.database_url, 25)
        .await
        .map_err(|e| ServerError::InitializeError(e.to_string()))?;
    db.run_migrations().await.map_err(|e| ServerError::InitializeError(e.to_string()))?;
    let cache = CacheDriver::from_url(config.redis_url.as_deref())
        .await
        .map_err(|e| ServerError::InitializeError(e.to_string()))?;
    let provider = ProviderApi::new(ProviderConfig::new_from_env_or_default())
        .map_err(|e| ServerError::InitializeError(e.to_string()))?;
    let orders = OrderServiceClient::new(OrderServiceConfig::new_from_env_or_default())
        .map_err(|e| ServerError::InitializeError(e.to_string()))?;
    let api_config = ConfirmationApiConfig {
        session_ttl: config.session_ttl,
        callback_base: config.public_base_url.clone(),
        token: TokenConfig::default(),
    };
    let api = PaymentsApi::new(cache.clone(), db.clone(), provider, orders, api_config);

    let reconcile_config = ReconcileWorkerConfig {
        interval: config.reconcile_interval,
        lock_ttl: config.reconcile_interval,
        filter: ReconciliationFilter {
            min_age: config.reconcile_min_age,
            recheck_interval: config.recheck_interval,
            batch_size: config.reconcile_batch_size,
        },
    };
    let _reconciler = start_reconciliation_worker(api.clone(), cache.clone(), reconcile_config);
    let cleanup_config = CleanupConfig {
        interval: config.cleanup_interval,
        lock_ttl: config.cleanup_interval,
        pending_expiry: config.pending_expiry,
        processed_retention: config.processed_retention,
        terminal_retention: config.terminal_retention,
        events_retention: config.events_retention,
        markers_retention: config.markers_retention,
    };
    let _cleaner = start_cleanup_worker(cache, db, cleanup_config);

    let srv = create_server_instance(config, api)?;
    srv.await.map_err(|e| ServerError::Unspecified(e.to_string()))
}

pub fn create_server_instance(config: ServerConfig, api: PaymentsApi) -> Result<Server, ServerError> {
    let srv = HttpServer::new(move || {
        let app = App::new()
            .wrap(Logger::new("%t (%D ms) %s %a %{Host}i %U").log_target("paygate::access_log"))
            .app_data(web::Data::new(api.clone()));
        let use_x_forwarded_for = config.use_x_forwarded_for;
        let use_forwarded = config.use_forwarded;
        let whitelist = config.internal_whitelist.clone();
        // The internal notification channel skips callback-token auth, so access is gated on the
        // peer address instead.
        let internal_scope = web::scope("/incoming")
            .wrap_fn(move |req, srv| {
                // Collect peer IP from x-forwarded-for, or forwarded headers _if_ `use_nnn` has been set to true
                // in the configuration. Otherwise, use the peer address from the connection info.
                let peer_addr = req.connection_info().peer_addr().map(|a| a.to_string());

                let peer_ip = req
                    .headers()
                    .get("X-Forwarded-For")
                    .and_then(|v| use_x_forwarded_for.then(|| v.to_str().ok()).flatten())
                    .or_else(|| {
                        req.headers().get("Forwarded").and_then(|v| use_forwarded.then(|| v.to_str().ok()).flatten())
                    })
                    .or_else(|| peer_addr.as_ref().map(|s| s.as_str()))
                    .and_then(parse_peer_ip);
                let whitelisted = match (peer_ip, &whitelist) {
                    (Some(ip), Some(whitelist)) => {
                        info!("💻️ Internal payment notification from {ip}");
                        whitelist.contains(&ip)
                    },
                    (_, None) => true,
                    (None, Some(_)) => {
                        warn!("💻️ No IP address found in internal notification request, denying access.");
                        false
                    },
                };
                if whitelisted {
                    srv.call(req)
                } else {
                    ok(req.error_response(ServerError::ForbiddenPeer)).boxed_local()
                }
            })
            .service(internal_notification);
        app.service(health)
            .service(checkout)
            .service(payment_callback)
            .service(session_status)
            .service(cancel_session)
            .service(internal_scope)
    })
    .keep_alive(KeepAlive::Timeout(Duration::from_secs(600)))
    .bind((config.host.as_str(), config.port))?
    .run();
    Ok(srv)
}

/// Peer addresses arrive either bare ("10.0.0.5") or with a port ("10.0.0.5:44123") depending on
/// which header or connection field supplied them.
fn parse_peer_ip(s: &str) -> Option<IpAddr> {
    let s = s.trim();
    IpAddr::from_str(s).ok().or_else(|| std::net::SocketAddr::from_str(s).ok().map(|a| a.ip()))
}
