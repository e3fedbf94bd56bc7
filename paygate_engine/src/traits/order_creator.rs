use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum OrderCreationError {
    #[error("Order creation failed: {0}")]
    Failed(String),
}

/// External order-materialization collaborator.
///
/// Callers must hold the processed-invoice exclusivity guarantee before invoking this; the
/// collaborator itself makes no idempotency promises.
#[async_trait]
pub trait OrderCreator: Clone + Send + Sync + 'static {
    /// Materializes orders from the opaque cart payload. Returns the created order identifiers.
    async fn create_orders(&self, cart_payload: &Value, user_id: &str) -> Result<Vec<String>, OrderCreationError>;
}
