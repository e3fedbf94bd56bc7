//! Wire representations of the provider's request and response bodies.

use paygate_common::MinorUnits;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct AuthRequest<'a> {
    pub api_key: &'a str,
    pub api_secret: &'a str,
}

/// The token endpoint's response. `expires` is either seconds-remaining or an absolute epoch
/// timestamp depending on the provider version; the engine's token manager disambiguates.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub expires: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateInvoiceRequest {
    pub amount: MinorUnits,
    pub currency: String,
    pub callback_url: String,
    pub reference: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceResponse {
    pub invoice_id: String,
    pub payment_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentStatusResponse {
    pub paid: bool,
    #[serde(default)]
    pub paid_amount: i64,
    #[serde(default)]
    pub payment_id: Option<String>,
    /// Raw provider status strings, passed through verbatim for auditing.
    #[serde(default)]
    pub statuses: Vec<String>,
}
