use log::*;
use paygate_common::Secret;

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL of the provider API, without a trailing slash.
    pub base_url: String,
    pub api_key: Secret<String>,
    pub api_secret: Secret<String>,
    /// Per-call timeout. Webhook handlers block on these calls, so keep it tight.
    pub timeout: std::time::Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://provider.example.com".to_string(),
            api_key: Secret::default(),
            api_secret: Secret::default(),
            timeout: std::time::Duration::from_secs(10),
        }
    }
}

impl ProviderConfig {
    pub fn new_from_env_or_default() -> Self {
        let base_url = std::env::var("PAYGATE_PROVIDER_URL").unwrap_or_else(|_| {
            warn!("🪛️ PAYGATE_PROVIDER_URL not set, using (probably useless) default");
            "https://provider.example.com".to_string()
        });
        let base_url = base_url.trim_end_matches('/').to_string();
        let api_key = Secret::new(std::env::var("PAYGATE_PROVIDER_API_KEY").unwrap_or_else(|_| {
            warn!("🪛️ PAYGATE_PROVIDER_API_KEY not set, using (probably useless) default");
            "pk_00000000".to_string()
        }));
        let api_secret = Secret::new(std::env::var("PAYGATE_PROVIDER_API_SECRET").unwrap_or_else(|_| {
            warn!("🪛️ PAYGATE_PROVIDER_API_SECRET not set, using (probably useless) default");
            "sk_00000000".to_string()
        }));
        let timeout = std::env::var("PAYGATE_PROVIDER_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(std::time::Duration::from_secs)
            .unwrap_or_else(|| {
                info!("🪛️ PAYGATE_PROVIDER_TIMEOUT_SECS not set, using 10s");
                std::time::Duration::from_secs(10)
            });
        Self { base_url, api_key, api_secret, timeout }
    }
}
