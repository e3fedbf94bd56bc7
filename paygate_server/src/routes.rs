//! Request handler definitions
//!
//! Define each route and its handler here.
//! Handlers that are more than a line or two MUST go into a separate module. Keep this module neat and tidy 🙏
//!
//! Any long, non-cpu-bound operation (I/O, database access, provider calls) must be awaited, never
//! blocked on, since each worker thread processes its requests sequentially.

use actix_web::{get, post, web, HttpRequest, HttpResponse, Responder};
use log::*;
use paygate_engine::{
    cache::CacheDriver,
    db_types::{NewCheckout, SessionId},
    ConfirmationApi,
    ConfirmationError,
    NotificationAuth,
    PaymentNotification,
    SqliteDatabase,
    WebhookOutcome,
};
use provider_client::ProviderApi;
use serde_json::Value;

use crate::{
    data_objects::{CallbackParams, CheckoutRequest, CheckoutResponse, JsonResponse},
    errors::ServerError,
    integrations::orders::OrderServiceClient,
};

/// The concrete engine assembly this server hosts.
pub type PaymentsApi = ConfirmationApi<CacheDriver, SqliteDatabase, ProviderApi, OrderServiceClient>;

/// The authenticated user, as asserted by the gateway in front of this server. This server sits
/// behind the deployment's auth boundary and trusts the header.
fn authenticated_user(req: &HttpRequest) -> Result<String, ServerError> {
    req.headers()
        .get("X-User-Id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| ServerError::InsufficientPermissions("X-User-Id header not set".to_string()))
}

// ----------------------------------------------   Health  ----------------------------------------------------

#[get("/health")]
pub async fn health() -> impl Responder {
    trace!("💻️ Received health check request");
    HttpResponse::Ok().body("👍️\n")
}

// ---------------------------------------------   Checkout  ---------------------------------------------------

#[post("/checkout")]
pub async fn checkout(
    req: HttpRequest,
    body: web::Json<CheckoutRequest>,
    api: web::Data<PaymentsApi>,
) -> Result<HttpResponse, ServerError> {
    let user_id = authenticated_user(&req)?;
    let request = body.into_inner();
    debug!("💻️ Checkout request from user {user_id} for {} {}", request.amount, request.currency);
    let checkout = NewCheckout {
        user_id,
        amount: request.amount,
        currency: request.currency,
        cart_payload: request.cart,
    };
    let result = api.create_session(checkout).await?;
    let response = CheckoutResponse {
        session_id: result.session.session_id,
        status: result.session.status,
        payment_url: result.payment_url,
    };
    Ok(HttpResponse::Ok().json(response))
}

// ---------------------------------------------   Webhooks  ---------------------------------------------------

/// Public payment callback channel. The provider calls this with the session id and callback
/// token it was handed at invoice creation.
#[post("/callback/payment")]
pub async fn payment_callback(
    params: web::Query<CallbackParams>,
    body: web::Json<Value>,
    api: web::Data<PaymentsApi>,
) -> Result<HttpResponse, ServerError> {
    let params = params.into_inner();
    let note = notification_from_payload(params.session_id.clone(), body.into_inner());
    let auth = NotificationAuth::CallbackToken { session_id: params.session_id, token: params.token };
    respond_to_notification(api.process_notification(auth, note).await)
}

/// Trusted internal notification channel. Protected by the IP whitelist at the scope level.
#[post("/payment-notification")]
pub async fn internal_notification(
    body: web::Json<PaymentNotification>,
    api: web::Data<PaymentsApi>,
) -> Result<HttpResponse, ServerError> {
    respond_to_notification(api.process_notification(NotificationAuth::Internal, body.into_inner()).await)
}

fn notification_from_payload(session_id: SessionId, payload: Value) -> PaymentNotification {
    let invoice_id = payload.get("invoice_id").and_then(|v| v.as_str()).map(|s| s.to_string().into());
    let status = payload.get("status").and_then(|v| v.as_str()).map(|s| s.to_string());
    PaymentNotification { session_id, invoice_id, status, payload }
}

/// Notifications are acknowledged with 200 and the outcome taxonomy in the body, so the
/// provider does not retry deliveries we have dispositioned. The exceptions: a bad token is
/// 403, and an order-creation failure is acknowledged with a failure body (reconciliation owns
/// the retry, not the provider).
fn respond_to_notification(result: Result<WebhookOutcome, ConfirmationError>) -> Result<HttpResponse, ServerError> {
    match result {
        Ok(WebhookOutcome::InvalidToken) => Ok(HttpResponse::Forbidden().json(WebhookOutcome::InvalidToken)),
        Ok(outcome) => Ok(HttpResponse::Ok().json(outcome)),
        Err(ConfirmationError::OrderCreation(e)) => {
            warn!("💻️ Order creation failed while processing a notification. {e}");
            Ok(HttpResponse::Ok().json(JsonResponse::failure("Order creation failed. The payment is recorded.")))
        },
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------   Sessions  ---------------------------------------------------

#[get("/status/{session_id}")]
pub async fn session_status(
    req: HttpRequest,
    path: web::Path<String>,
    api: web::Data<PaymentsApi>,
) -> Result<HttpResponse, ServerError> {
    let user_id = authenticated_user(&req)?;
    let session_id = SessionId(path.into_inner());
    let status = api.session_status(&session_id, &user_id).await?;
    Ok(HttpResponse::Ok().json(status))
}

#[post("/cancel/{session_id}")]
pub async fn cancel_session(
    req: HttpRequest,
    path: web::Path<String>,
    api: web::Data<PaymentsApi>,
) -> Result<HttpResponse, ServerError> {
    let user_id = authenticated_user(&req)?;
    let session_id = SessionId(path.into_inner());
    let session = api.cancel_session(&session_id, &user_id).await?;
    info!("💻️ Session [{session_id}] cancelled");
    Ok(HttpResponse::Ok().json(JsonResponse::success(format!("Session {} cancelled", session.session_id))))
}
