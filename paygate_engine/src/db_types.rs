use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use log::error;
use paygate_common::MinorUnits;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{types::Json, FromRow, Type};
use thiserror::Error;

//--------------------------------------       SessionId       -------------------------------------------------------
/// A lightweight wrapper around the opaque, externally shareable payment session key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
#[sqlx(transparent)]
pub struct SessionId(pub String);

impl FromStr for SessionId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

//--------------------------------------       InvoiceId       -------------------------------------------------------
/// The provider-assigned invoice identifier. This is the dedup key for order materialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
#[sqlx(transparent)]
pub struct InvoiceId(pub String);

impl FromStr for InvoiceId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<String> for InvoiceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Display for InvoiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl InvoiceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

//--------------------------------------     SessionStatus     -------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
pub enum SessionStatus {
    /// The session has been created and no verified payment has been observed yet.
    Pending,
    /// The provider has confirmed the payment, but orders have not been materialized yet.
    Paid,
    /// Orders have been materialized for this session. Terminal for order creation.
    Processed,
    /// The session was cancelled by the owning user. Terminal for reconciliation.
    Cancelled,
    /// The session went stale without payment and was expired by the cleanup sweep.
    Expired,
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "Pending"),
            SessionStatus::Paid => write!(f, "Paid"),
            SessionStatus::Processed => write!(f, "Processed"),
            SessionStatus::Cancelled => write!(f, "Cancelled"),
            SessionStatus::Expired => write!(f, "Expired"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("Invalid session status: {0}")]
pub struct ConversionError(String);

impl FromStr for SessionStatus {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Paid" => Ok(Self::Paid),
            "Processed" => Ok(Self::Processed),
            "Cancelled" => Ok(Self::Cancelled),
            "Expired" => Ok(Self::Expired),
            s => Err(ConversionError(format!("Invalid session status: {s}"))),
        }
    }
}

impl From<String> for SessionStatus {
    fn from(value: String) -> Self {
        value.parse().unwrap_or_else(|_| {
            error!("Invalid session status: {value}. But this conversion cannot fail. Defaulting to Pending");
            SessionStatus::Pending
        })
    }
}

impl SessionStatus {
    /// Terminal states no longer eligible for new order creation via the normal flow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Processed | SessionStatus::Cancelled | SessionStatus::Expired)
    }
}

//--------------------------------------    PaymentSession     -------------------------------------------------------
/// One checkout attempt. The unit the end user polls for status.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PaymentSession {
    pub session_id: SessionId,
    pub user_id: String,
    /// Expected settlement amount in minor units.
    pub amount: MinorUnits,
    pub currency: String,
    /// Opaque checkout blob: cart, seller routing, shipping, coupon, receipt-request fields.
    pub cart_payload: Json<Value>,
    /// Provider-assigned invoice, set once the invoice has been created upstream.
    pub invoice_id: Option<InvoiceId>,
    /// Provider payment reference, set once a verified payment has been seen.
    pub payment_id: Option<String>,
    /// Random secret bound to this session; authorizes externally-sourced notifications.
    pub callback_token: String,
    pub status: SessionStatus,
    pub last_check_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentSession {
    /// Builds the session record for a brand-new checkout. Timestamps are set to now; the
    /// database keeps its own `updated_at` from there on.
    pub fn new(
        session_id: SessionId,
        user_id: String,
        amount: MinorUnits,
        currency: String,
        cart_payload: Value,
        invoice_id: InvoiceId,
        callback_token: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            user_id,
            amount,
            currency,
            cart_payload: Json(cart_payload),
            invoice_id: Some(invoice_id),
            payment_id: None,
            callback_token,
            status: SessionStatus::Pending,
            last_check_at: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

//--------------------------------------      NewCheckout      -------------------------------------------------------
/// The caller-supplied half of a new payment session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCheckout {
    pub user_id: String,
    pub amount: MinorUnits,
    pub currency: String,
    pub cart_payload: Value,
}

//--------------------------------------     MarkerStatus      -------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
pub enum MarkerStatus {
    /// The marker has been created (exclusivity granted) but order creation has not finished.
    Processing,
    /// Order creation succeeded and `order_ids` is authoritative.
    Complete,
}

impl Display for MarkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarkerStatus::Processing => write!(f, "Processing"),
            MarkerStatus::Complete => write!(f, "Complete"),
        }
    }
}

//--------------------------------------   ProcessedInvoice    -------------------------------------------------------
/// The idempotency marker. At most one row ever exists per invoice; creating it is the atomic
/// action that grants exclusive rights to materialize orders for that invoice.
#[derive(Debug, Clone, FromRow)]
pub struct ProcessedInvoice {
    pub invoice_id: InvoiceId,
    pub session_id: SessionId,
    pub status: MarkerStatus,
    pub order_ids: Json<Vec<String>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ProcessedInvoice {
    /// A marker whose holder crashed (or is still mid-flight) before attaching order ids.
    pub fn is_incomplete(&self) -> bool {
        self.order_ids.0.is_empty()
    }
}

//--------------------------------------     WebhookEvent      -------------------------------------------------------
/// Audit record for a single raw inbound notification. `outcome` and `last_error` are filled in
/// once the notification has been dispositioned.
#[derive(Debug, Clone, FromRow)]
pub struct WebhookEvent {
    pub id: i64,
    pub invoice_id: Option<String>,
    pub status: Option<String>,
    pub payload: Json<Value>,
    pub outcome: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub invoice_id: Option<String>,
    pub status: Option<String>,
    pub payload: Value,
}
