//! Client for the internal order-creation service.

use std::sync::Arc;

use async_trait::async_trait;
use log::*;
use paygate_common::Secret;
use paygate_engine::traits::{OrderCreationError, OrderCreator};
use reqwest::{header::HeaderValue, Client};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone)]
pub struct OrderServiceConfig {
    pub base_url: String,
    pub api_key: Secret<String>,
    pub timeout: std::time::Duration,
}

impl OrderServiceConfig {
    pub fn new_from_env_or_default() -> Self {
        let base_url = std::env::var("PAYGATE_ORDER_SERVICE_URL").unwrap_or_else(|_| {
            warn!("🪛️ PAYGATE_ORDER_SERVICE_URL not set, using (probably useless) default");
            "http://localhost:8500".to_string()
        });
        let base_url = base_url.trim_end_matches('/').to_string();
        let api_key = Secret::new(std::env::var("PAYGATE_ORDER_SERVICE_API_KEY").unwrap_or_else(|_| {
            warn!("🪛️ PAYGATE_ORDER_SERVICE_API_KEY not set, using (probably useless) default");
            String::default()
        }));
        let timeout = std::env::var("PAYGATE_ORDER_SERVICE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(std::time::Duration::from_secs)
            .unwrap_or_else(|| std::time::Duration::from_secs(15));
        Self { base_url, api_key, timeout }
    }
}

#[derive(Debug, Deserialize)]
struct CreateOrdersResponse {
    order_ids: Vec<String>,
}

/// Posts confirmed carts to the order service. The caller holds the idempotency marker, so a
/// duplicate POST from this client cannot happen for the same invoice.
#[derive(Clone)]
pub struct OrderServiceClient {
    config: OrderServiceConfig,
    client: Arc<Client>,
}

impl OrderServiceClient {
    pub fn new(config: OrderServiceConfig) -> Result<Self, OrderCreationError> {
        let mut headers = reqwest::header::HeaderMap::with_capacity(1);
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| OrderCreationError::Failed(format!("Could not initialize order service client: {e}")))?;
        Ok(Self { config, client: Arc::new(client) })
    }
}

#[async_trait]
impl OrderCreator for OrderServiceClient {
    async fn create_orders(&self, cart_payload: &Value, user_id: &str) -> Result<Vec<String>, OrderCreationError> {
        let url = format!("{}/api/orders", self.config.base_url);
        let body = json!({
            "user_id": user_id,
            "cart": cart_payload,
        });
        debug!("🛒️ Posting cart for user {user_id} to the order service");
        let response = self
            .client
            .post(url)
            .bearer_auth(self.config.api_key.reveal())
            .json(&body)
            .send()
            .await
            .map_err(|e| OrderCreationError::Failed(format!("Order service unreachable: {e}")))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(OrderCreationError::Failed(format!("Order service returned {status}. {message}")));
        }
        let result = response
            .json::<CreateOrdersResponse>()
            .await
            .map_err(|e| OrderCreationError::Failed(format!("Invalid order service response: {e}")))?;
        info!("🛒️ Order service created {} order(s) for user {user_id}", result.order_ids.len());
        Ok(result.order_ids)
    }
}
