use async_trait::async_trait;
use paygate_common::MinorUnits;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db_types::InvoiceId;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Could not initialize client: {0}")]
    Initialization(String),
    #[error("Provider authentication failed: {0}")]
    Authentication(String),
    #[error("Invalid provider request: {0}")]
    RequestError(String),
    #[error("Invalid provider response: {0}")]
    ResponseError(String),
    #[error("Could not deserialize JSON: {0}")]
    JsonError(String),
    #[error("Provider call failed. Error {status}. {message}")]
    QueryError { status: u16, message: String },
}

/// A freshly issued provider bearer token, exactly as the provider returned it.
///
/// `expires` is ambiguous at the wire level: some provider versions return seconds-remaining,
/// others an absolute epoch timestamp. The token manager disambiguates; this type does not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreshToken {
    pub access_token: String,
    pub expires: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceRequest {
    pub amount: MinorUnits,
    pub currency: String,
    /// Where the provider should deliver payment notifications for this invoice. Carries the
    /// session id and callback token as query parameters.
    pub callback_url: String,
    /// Merchant-side reference (the session id).
    pub reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInvoice {
    pub invoice_id: InvoiceId,
    /// The renderable payment artifact the end user is redirected to.
    pub payment_url: String,
}

/// The provider's authoritative answer for one invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentCheck {
    pub paid: bool,
    pub paid_amount: MinorUnits,
    pub payment_id: Option<String>,
    /// Raw provider status strings, for the audit trail only. Never used for decisions.
    pub raw_statuses: Vec<String>,
}

/// Upstream payment-provider API. The bearer token is passed explicitly so that token caching
/// stays in the token manager and implementations remain stateless.
#[async_trait]
pub trait PaymentProvider: Clone + Send + Sync + 'static {
    /// Exchanges the configured credentials for a fresh bearer token. No caching here.
    async fn authenticate(&self) -> Result<FreshToken, ProviderError>;

    async fn create_invoice(&self, token: &str, request: &InvoiceRequest) -> Result<NewInvoice, ProviderError>;

    /// The payment-status check. The source of truth for pay/no-pay and the paid amount.
    async fn check_payment(&self, token: &str, invoice_id: &InvoiceId) -> Result<PaymentCheck, ProviderError>;
}
