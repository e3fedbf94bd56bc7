use std::fmt::Display;

use paygate_common::MinorUnits;
use paygate_engine::db_types::{SessionId, SessionStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonResponse {
    pub success: bool,
    pub message: String,
}

impl JsonResponse {
    pub fn success<S: Display>(message: S) -> Self {
        Self { success: true, message: message.to_string() }
    }

    pub fn failure<S: Display>(message: S) -> Self {
        Self { success: false, message: message.to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub amount: MinorUnits,
    pub currency: String,
    /// Opaque cart blob, stored as-is and forwarded to the order service on confirmation.
    pub cart: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutResponse {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub payment_url: String,
}

/// Query parameters the provider echoes back on the public callback channel.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackParams {
    pub session_id: SessionId,
    pub token: String,
}
