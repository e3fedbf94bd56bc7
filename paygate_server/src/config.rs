use std::{env, net::IpAddr};

use chrono::Duration;
use log::*;
use paygate_common::parse_boolean_flag;

const DEFAULT_PAYGATE_HOST: &str = "127.0.0.1";
const DEFAULT_PAYGATE_PORT: u16 = 8420;
const DEFAULT_SESSION_TTL_SECS: u64 = 1800;
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;
const DEFAULT_RECONCILE_MIN_AGE_MINS: i64 = 10;
const DEFAULT_RECHECK_INTERVAL_MINS: i64 = 15;
const DEFAULT_RECONCILE_BATCH_SIZE: i64 = 50;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3600;
const DEFAULT_PENDING_EXPIRY_HOURS: i64 = 2;
const DEFAULT_PROCESSED_RETENTION_DAYS: i64 = 30;
const DEFAULT_TERMINAL_RETENTION_DAYS: i64 = 7;
const DEFAULT_EVENTS_RETENTION_DAYS: i64 = 90;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// If unset the server runs on the in-process cache and cross-instance coordination is off.
    pub redis_url: Option<String>,
    /// Public base URL of this server, used to build provider callback URLs.
    pub public_base_url: String,
    /// If true, the X-Forwarded-For header will be used to determine the client's IP address, rather than the
    /// connection's remote address.
    pub use_x_forwarded_for: bool,
    /// If true, the Forwarded header will be used to determine the client's IP address.
    pub use_forwarded: bool,
    /// If supplied, requests against the internal notification endpoint are checked against this
    /// IP whitelist. To explicitly disable the whitelist, set it to "false", "none", or "0".
    pub internal_whitelist: Option<Vec<IpAddr>>,
    pub session_ttl: std::time::Duration,
    pub reconcile_interval: std::time::Duration,
    pub reconcile_min_age: Duration,
    pub recheck_interval: Duration,
    pub reconcile_batch_size: i64,
    pub cleanup_interval: std::time::Duration,
    pub pending_expiry: Duration,
    pub processed_retention: Duration,
    pub terminal_retention: Duration,
    pub events_retention: Duration,
    /// Retention for complete idempotency markers. `None` keeps them forever.
    pub markers_retention: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_PAYGATE_HOST.to_string(),
            port: DEFAULT_PAYGATE_PORT,
            database_url: String::default(),
            redis_url: None,
            public_base_url: format!("http://{DEFAULT_PAYGATE_HOST}:{DEFAULT_PAYGATE_PORT}"),
            use_x_forwarded_for: false,
            use_forwarded: false,
            internal_whitelist: None,
            session_ttl: std::time::Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            reconcile_interval: std::time::Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
            reconcile_min_age: Duration::minutes(DEFAULT_RECONCILE_MIN_AGE_MINS),
            recheck_interval: Duration::minutes(DEFAULT_RECHECK_INTERVAL_MINS),
            reconcile_batch_size: DEFAULT_RECONCILE_BATCH_SIZE,
            cleanup_interval: std::time::Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
            pending_expiry: Duration::hours(DEFAULT_PENDING_EXPIRY_HOURS),
            processed_retention: Duration::days(DEFAULT_PROCESSED_RETENTION_DAYS),
            terminal_retention: Duration::days(DEFAULT_TERMINAL_RETENTION_DAYS),
            events_retention: Duration::days(DEFAULT_EVENTS_RETENTION_DAYS),
            markers_retention: None,
        }
    }
}

impl ServerConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self { host: host.to_string(), port, ..Default::default() }
    }

    pub fn from_env_or_default() -> Self {
        let defaults = ServerConfig::default();
        let host = env::var("PAYGATE_HOST").ok().unwrap_or_else(|| DEFAULT_PAYGATE_HOST.into());
        let port = env::var("PAYGATE_PORT")
            .map(|s| {
                s.parse::<u16>().unwrap_or_else(|e| {
                    error!(
                        "🪛️ {s} is not a valid port for PAYGATE_PORT. {e} Using the default, {DEFAULT_PAYGATE_PORT}, \
                         instead."
                    );
                    DEFAULT_PAYGATE_PORT
                })
            })
            .ok()
            .unwrap_or(DEFAULT_PAYGATE_PORT);
        let database_url = env::var("PAYGATE_DATABASE_URL").ok().unwrap_or_else(|| {
            error!("🪛️ PAYGATE_DATABASE_URL is not set. Please set it to the URL for the paygate database.");
            String::default()
        });
        let redis_url = env::var("PAYGATE_REDIS_URL").ok();
        let public_base_url = env::var("PAYGATE_PUBLIC_URL").ok().unwrap_or_else(|| {
            warn!("🪛️ PAYGATE_PUBLIC_URL is not set. Provider callbacks will target http://{host}:{port}.");
            format!("http://{host}:{port}")
        });
        let public_base_url = public_base_url.trim_end_matches('/').to_string();
        let use_x_forwarded_for = parse_boolean_flag(env::var("PAYGATE_USE_X_FORWARDED_FOR").ok(), false);
        let use_forwarded = parse_boolean_flag(env::var("PAYGATE_USE_FORWARDED").ok(), false);
        let internal_whitelist = parse_whitelist();
        let session_ttl = secs_var("PAYGATE_SESSION_TTL_SECS", DEFAULT_SESSION_TTL_SECS);
        let reconcile_interval = secs_var("PAYGATE_RECONCILE_INTERVAL_SECS", DEFAULT_RECONCILE_INTERVAL_SECS);
        let reconcile_min_age =
            mins_var("PAYGATE_RECONCILE_MIN_AGE_MINS", DEFAULT_RECONCILE_MIN_AGE_MINS);
        let recheck_interval = mins_var("PAYGATE_RECHECK_INTERVAL_MINS", DEFAULT_RECHECK_INTERVAL_MINS);
        let reconcile_batch_size = env::var("PAYGATE_RECONCILE_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(DEFAULT_RECONCILE_BATCH_SIZE);
        let cleanup_interval = secs_var("PAYGATE_CLEANUP_INTERVAL_SECS", DEFAULT_CLEANUP_INTERVAL_SECS);
        let pending_expiry = hours_var("PAYGATE_PENDING_EXPIRY_HOURS", DEFAULT_PENDING_EXPIRY_HOURS);
        let processed_retention = days_var("PAYGATE_PROCESSED_RETENTION_DAYS", DEFAULT_PROCESSED_RETENTION_DAYS);
        let terminal_retention = days_var("PAYGATE_TERMINAL_RETENTION_DAYS", DEFAULT_TERMINAL_RETENTION_DAYS);
        let events_retention = days_var("PAYGATE_EVENTS_RETENTION_DAYS", DEFAULT_EVENTS_RETENTION_DAYS);
        let markers_retention = env::var("PAYGATE_MARKERS_RETENTION_DAYS")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(Duration::days);
        if markers_retention.is_none() {
            info!("🪛️ PAYGATE_MARKERS_RETENTION_DAYS is not set. Idempotency markers are kept indefinitely.");
        }
        Self {
            host,
            port,
            database_url,
            redis_url,
            public_base_url,
            use_x_forwarded_for,
            use_forwarded,
            internal_whitelist,
            session_ttl,
            reconcile_interval,
            reconcile_min_age,
            recheck_interval,
            reconcile_batch_size,
            cleanup_interval,
            pending_expiry,
            processed_retention,
            terminal_retention,
            events_retention,
            markers_retention: markers_retention.or(defaults.markers_retention),
        }
    }
}

fn parse_whitelist() -> Option<Vec<IpAddr>> {
    let whitelist = env::var("PAYGATE_INTERNAL_IP_WHITELIST").ok().and_then(|s| {
        if ["none", "false", "0"].contains(&s.to_lowercase().as_str()) {
            info!(
                "🪛️ The internal notification IP whitelist is disabled. If this is not what you want, set \
                 PAYGATE_INTERNAL_IP_WHITELIST to a comma-separated list of IP addresses to enable it."
            );
            return None;
        }
        let ip_addrs = s
            .split(',')
            .filter_map(|s| {
                s.trim()
                    .parse()
                    .map_err(|e| {
                        warn!("🪛️ Ignoring invalid IP address ({s}) in PAYGATE_INTERNAL_IP_WHITELIST: {e}");
                        None::<IpAddr>
                    })
                    .ok()
            })
            .collect::<Vec<IpAddr>>();
        Some(ip_addrs)
    });
    match &whitelist {
        Some(whitelist) if whitelist.is_empty() => {
            warn!(
                "🚨️ The internal IP whitelist was configured, but is empty. The server will run, but won't authorise \
                 any internal payment notifications."
            );
        },
        None => {
            info!("🪛️ No internal IP whitelist is set. The internal notification endpoint trusts the network boundary.");
        },
        Some(v) => {
            let addrs = v.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(", ");
            info!("🪛️ Internal notification IP whitelist: {addrs}");
        },
    }
    whitelist
}

fn secs_var(name: &str, default: u64) -> std::time::Duration {
    let secs = env::var(name)
        .map_err(|_| info!("🪛️ {name} is not set. Using the default value of {default}s."))
        .and_then(|s| s.parse::<u64>().map_err(|e| warn!("🪛️ Invalid configuration value for {name}. {e}")))
        .ok()
        .unwrap_or(default);
    std::time::Duration::from_secs(secs)
}

fn mins_var(name: &str, default: i64) -> Duration {
    env::var(name)
        .map_err(|_| info!("🪛️ {name} is not set. Using the default value of {default} mins."))
        .and_then(|s| {
            s.parse::<i64>()
                .map(Duration::minutes)
                .map_err(|e| warn!("🪛️ Invalid configuration value for {name}. {e}"))
        })
        .ok()
        .unwrap_or_else(|| Duration::minutes(default))
}

fn hours_var(name: &str, default: i64) -> Duration {
    env::var(name)
        .map_err(|_| info!("🪛️ {name} is not set. Using the default value of {default} hrs."))
        .and_then(|s| {
            s.parse::<i64>().map(Duration::hours).map_err(|e| warn!("🪛️ Invalid configuration value for {name}. {e}"))
        })
        .ok()
        .unwrap_or_else(|| Duration::hours(default))
}

fn days_var(name: &str, default: i64) -> Duration {
    env::var(name)
        .map_err(|_| info!("🪛️ {name} is not set. Using the default value of {default} days."))
        .and_then(|s| {
            s.parse::<i64>().map(Duration::days).map_err(|e| warn!("🪛️ Invalid configuration value for {name}. {e}"))
        })
        .ok()
        .unwrap_or_else(|| Duration::days(default))
}
