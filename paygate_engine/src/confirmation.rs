//! The payment confirmation flow.
//!
//! [`ConfirmationApi`] ties the four collaborator seams together and owns every state
//! transition a payment session can make: checkout, webhook confirmation, reconciliation
//! recovery and cancellation.
//!
//! The invariant everything here leans on: orders are materialized for an invoice exactly once,
//! enforced by the unique-create of the processed-invoice marker. Webhooks, retries and the
//! reconciliation worker can all race freely; at most one of them ever gets `Created` back.

use std::time::Duration;

use log::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    db_types::{
        InvoiceId,
        NewCheckout,
        NewWebhookEvent,
        PaymentSession,
        SessionId,
        SessionStatus,
    },
    helpers::{new_callback_token, new_session_id},
    session_store::SessionStore,
    token::{TokenConfig, TokenError, TokenManager},
    traits::{
        InsertMarkerResult,
        InvoiceRequest,
        OrderCreationError,
        OrderCreator,
        PaymentProvider,
        PaymentStore,
        PaymentStoreError,
        ProviderError,
        SharedCache,
    },
};

/// Paid amounts within this many minor units of the expected amount are accepted. Absorbs
/// provider-side rounding of currency conversions.
pub const AMOUNT_TOLERANCE: i64 = 1;

#[derive(Debug, Error)]
pub enum ConfirmationError {
    #[error("Storage error: {0}")]
    StorageError(#[from] PaymentStoreError),
    #[error("Provider error: {0}")]
    ProviderError(#[from] ProviderError),
    #[error("Order creation failed: {0}")]
    OrderCreation(#[from] OrderCreationError),
    #[error("Session {0} does not exist")]
    SessionNotFound(SessionId),
    #[error("Session {0} does not belong to the requesting user")]
    NotOwner(SessionId),
    #[error("Session {session_id} cannot be cancelled from status {status}")]
    CancelForbidden { session_id: SessionId, status: SessionStatus },
}

impl From<TokenError> for ConfirmationError {
    fn from(e: TokenError) -> Self {
        ConfirmationError::ProviderError(e.into())
    }
}

/// How an inbound payment notification authenticated itself.
#[derive(Debug, Clone)]
pub enum NotificationAuth {
    /// Originated inside our own trust boundary (the reconciliation worker).
    Internal,
    /// Externally sourced, carrying the per-session callback secret.
    CallbackToken { session_id: SessionId, token: String },
}

/// A parsed inbound payment notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentNotification {
    pub session_id: SessionId,
    #[serde(default)]
    pub invoice_id: Option<InvoiceId>,
    #[serde(default)]
    pub status: Option<String>,
    /// The raw notification body, kept verbatim for the audit trail.
    #[serde(default)]
    pub payload: Value,
}

/// The terminal disposition of one notification. Serialized into the webhook response body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// This notification won the marker race and orders were created.
    OrderCreated { order_ids: Vec<String> },
    /// Orders for this invoice were already created (possibly by a concurrent delivery).
    Duplicate { order_ids: Vec<String> },
    InvalidToken,
    SessionMissing,
    InvoiceMismatch,
    /// The provider says the invoice is not paid (yet).
    NotPaid,
    /// The provider reports a settled amount outside tolerance of what was expected.
    AmountMismatch,
    /// The provider could not be reached or gave an unusable answer. Retryable.
    PaymentCheckFailed,
}

impl WebhookOutcome {
    /// The snake_case tag of this outcome, as recorded in the audit trail.
    pub fn label(&self) -> &'static str {
        match self {
            Self::OrderCreated { .. } => "order_created",
            Self::Duplicate { .. } => "duplicate",
            Self::InvalidToken => "invalid_token",
            Self::SessionMissing => "session_missing",
            Self::InvoiceMismatch => "invoice_mismatch",
            Self::NotPaid => "not_paid",
            Self::AmountMismatch => "amount_mismatch",
            Self::PaymentCheckFailed => "payment_check_failed",
        }
    }
}

/// What a reconciliation visit did for one session.
#[derive(Debug, Clone)]
pub enum ReconcileAction {
    /// Payment verified and orders created.
    Confirmed { order_ids: Vec<String> },
    /// An abandoned incomplete marker was finished off.
    Recovered { order_ids: Vec<String> },
    /// The session's durable status was behind its complete marker and has been corrected.
    StatusHealed,
    /// Nothing to do yet.
    StillPending,
    /// Paid, but at the wrong amount. Left for operator attention.
    AmountMismatch,
}

#[derive(Debug, Clone)]
pub struct ConfirmationApiConfig {
    /// TTL for cached session entries.
    pub session_ttl: Duration,
    /// Base URL (scheme + host) the provider should deliver callbacks to.
    pub callback_base: String,
    pub token: TokenConfig,
}

/// The result of a successful checkout: the stored session plus where to send the user to pay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutResult {
    pub session: PaymentSession,
    pub payment_url: String,
}

/// A session's current state as reported to its owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatusResult {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub order_ids: Vec<String>,
}

#[derive(Clone)]
pub struct ConfirmationApi<C, B, P, O>
where
    C: SharedCache,
    B: PaymentStore,
    P: PaymentProvider,
    O: OrderCreator,
{
    sessions: SessionStore<C, B>,
    tokens: TokenManager<C, P>,
    provider: P,
    orders: O,
    callback_base: String,
}

impl<C, B, P, O> ConfirmationApi<C, B, P, O>
where
    C: SharedCache,
    B: PaymentStore,
    P: PaymentProvider,
    O: OrderCreator,
{
    pub fn new(cache: C, db: B, provider: P, orders: O, config: ConfirmationApiConfig) -> Self {
        let sessions = SessionStore::new(cache.clone(), db, config.session_ttl);
        let tokens = TokenManager::new(cache, provider.clone(), config.token);
        Self { sessions, tokens, provider, orders, callback_base: config.callback_base }
    }

    pub fn db(&self) -> &B {
        self.sessions.db()
    }

    //----------------------------------------   Checkout   ----------------------------------------------------------

    /// Creates a new payment session: mints the provider invoice, then stores the session
    /// (cache first, then durably). Returns the session and the provider's payment URL.
    pub async fn create_session(&self, checkout: NewCheckout) -> Result<CheckoutResult, ConfirmationError> {
        let session_id = new_session_id();
        let callback_token = new_callback_token();
        let token = self.tokens.get_token().await?;
        let callback_url =
            format!("{}/callback/payment?session_id={session_id}&token={callback_token}", self.callback_base);
        let request = InvoiceRequest {
            amount: checkout.amount,
            currency: checkout.currency.clone(),
            callback_url,
            reference: session_id.to_string(),
        };
        let invoice = self.provider.create_invoice(&token, &request).await?;
        info!("🔄️ Invoice [{}] created for new session [{session_id}]", invoice.invoice_id);
        let session = PaymentSession::new(
            session_id,
            checkout.user_id,
            checkout.amount,
            checkout.currency,
            checkout.cart_payload,
            invoice.invoice_id,
            callback_token,
        );
        self.sessions.create(&session).await?;
        Ok(CheckoutResult { session, payment_url: invoice.payment_url })
    }

    //----------------------------------------   Webhooks   ----------------------------------------------------------

    /// Processes one inbound payment notification end to end.
    ///
    /// Every notification is recorded in the audit trail, authenticated, matched against its
    /// session's invoice, deduplicated against the processed-invoice ledger and only then
    /// verified with the provider. The returned outcome is final for this delivery; the caller
    /// should acknowledge receipt regardless of which outcome it is.
    pub async fn process_notification(
        &self,
        auth: NotificationAuth,
        note: PaymentNotification,
    ) -> Result<WebhookOutcome, ConfirmationError> {
        let event_id = self.record_event(&note).await;
        let result = self.dispatch_notification(auth, note).await;
        if let Some(id) = event_id {
            let (outcome, error) = match &result {
                Ok(outcome) => (outcome.label(), None),
                Err(e) => ("error", Some(e.to_string())),
            };
            if let Err(e) = self.db().record_event_outcome(id, outcome, error.as_deref()).await {
                warn!("🛎️ Could not record the outcome of webhook event #{id}: {e}");
            }
        }
        result
    }

    async fn dispatch_notification(
        &self,
        auth: NotificationAuth,
        note: PaymentNotification,
    ) -> Result<WebhookOutcome, ConfirmationError> {
        let session = match self.authenticate(&auth, &note.session_id).await? {
            Ok(session) => Some(session),
            Err(WebhookOutcome::SessionMissing) => None,
            Err(outcome) => return Ok(outcome),
        };
        let Some(session) = session else {
            // Trusted caller, but the session row is gone. The dedup ledger outlives sessions,
            // so a very late duplicate is still answered from the marker.
            return Ok(match &note.invoice_id {
                Some(claimed) => match self.db().fetch_marker(claimed).await? {
                    Some(marker) if marker.is_incomplete() => WebhookOutcome::Duplicate { order_ids: vec![] },
                    Some(marker) => WebhookOutcome::Duplicate { order_ids: marker.order_ids.0.clone() },
                    None => WebhookOutcome::SessionMissing,
                },
                None => WebhookOutcome::SessionMissing,
            });
        };
        // Dedup fast path, keyed on the invoice the notification names (falling back to the
        // session's binding). A repeat delivery is answered from the ledger before any binding
        // or provider checks.
        if let Some(invoice) = note.invoice_id.as_ref().or(session.invoice_id.as_ref()) {
            if let Some(marker) = self.db().fetch_marker(invoice).await? {
                return if marker.is_incomplete() {
                    warn!(
                        "🛎️ Invoice [{invoice}] has an incomplete marker (holder crashed or still in flight). \
                         Reconciliation will finish it"
                    );
                    Ok(WebhookOutcome::Duplicate { order_ids: vec![] })
                } else {
                    debug!("🛎️ Invoice [{invoice}] already processed. Duplicate delivery");
                    Ok(WebhookOutcome::Duplicate { order_ids: marker.order_ids.0.clone() })
                };
            }
        }
        let Some(invoice_id) = session.invoice_id.clone() else {
            warn!("🛎️ Session [{}] has no invoice yet but received a notification", session.session_id);
            return Ok(WebhookOutcome::InvoiceMismatch);
        };
        if let Some(claimed) = &note.invoice_id {
            if *claimed != invoice_id {
                warn!(
                    "🛎️ Notification for session [{}] names invoice [{claimed}] but the session is bound to \
                     [{invoice_id}]",
                    session.session_id
                );
                return Ok(WebhookOutcome::InvoiceMismatch);
            }
        }
        self.verify_and_materialize(session, &invoice_id).await
    }

    /// Verifies payment with the provider and, if it checks out, materializes orders under the
    /// marker's exclusivity guarantee.
    async fn verify_and_materialize(
        &self,
        session: PaymentSession,
        invoice_id: &InvoiceId,
    ) -> Result<WebhookOutcome, ConfirmationError> {
        let check = match self.check_payment(invoice_id).await {
            Ok(check) => check,
            Err(e) => {
                warn!("🔄️ Payment check for invoice [{invoice_id}] failed: {e}");
                return Ok(WebhookOutcome::PaymentCheckFailed);
            },
        };
        self.db().touch_last_check(&session.session_id).await?;
        if !check.paid {
            debug!("🔄️ Invoice [{invoice_id}] is not paid yet");
            return Ok(WebhookOutcome::NotPaid);
        }
        if check.paid_amount.abs_diff(session.amount).value() > AMOUNT_TOLERANCE {
            error!(
                "🔄️ Invoice [{invoice_id}] settled at {} but session [{}] expected {}. Holding for operator review",
                check.paid_amount, session.session_id, session.amount
            );
            if session.status == SessionStatus::Paid {
                // A previously accepted amount no longer verifies. Pull the session back so it
                // cannot silently proceed to order creation.
                let updated = self.db().update_session_status(&session.session_id, SessionStatus::Pending).await?;
                self.sessions.refresh(&updated).await;
            }
            return Ok(WebhookOutcome::AmountMismatch);
        }
        let mut session = session;
        if session.status == SessionStatus::Pending {
            let payment_id = check.payment_id.clone().unwrap_or_default();
            session = self.db().mark_session_paid(&session.session_id, &payment_id).await?;
            self.sessions.refresh(&session).await;
            info!("🔄️ Session [{}] confirmed paid via invoice [{invoice_id}]", session.session_id);
        }
        match self.db().try_insert_marker(invoice_id, &session.session_id).await? {
            InsertMarkerResult::AlreadyExists(marker) => {
                if marker.is_incomplete() {
                    warn!("🔄️ Lost the marker race for invoice [{invoice_id}] to an in-flight processor");
                    Ok(WebhookOutcome::Duplicate { order_ids: vec![] })
                } else {
                    Ok(WebhookOutcome::Duplicate { order_ids: marker.order_ids.0.clone() })
                }
            },
            InsertMarkerResult::Created(_) => {
                let order_ids = self.materialize_orders(&session, invoice_id).await?;
                Ok(WebhookOutcome::OrderCreated { order_ids })
            },
        }
    }

    /// Creates the orders for a session that holds the marker for `invoice_id`, then completes
    /// the marker and flips the session to `Processed`.
    ///
    /// If order creation fails the marker is deliberately left incomplete: the payment is real,
    /// so the invoice must stay claimed, and reconciliation will retry the order half.
    async fn materialize_orders(
        &self,
        session: &PaymentSession,
        invoice_id: &InvoiceId,
    ) -> Result<Vec<String>, ConfirmationError> {
        let order_ids = match self.orders.create_orders(&session.cart_payload.0, &session.user_id).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(
                    "🔄️ Order creation failed for session [{}] / invoice [{invoice_id}]. The marker stays \
                     incomplete and reconciliation will retry. {e}",
                    session.session_id
                );
                return Err(e.into());
            },
        };
        self.db().complete_marker(invoice_id, &order_ids).await?;
        self.db().update_session_status(&session.session_id, SessionStatus::Processed).await?;
        // The session's work is done. Drop the cached copy; the durable row is the history.
        self.sessions.evict(&session.session_id).await;
        info!(
            "🔄️ Session [{}] processed. {} order(s) created for invoice [{invoice_id}]",
            session.session_id,
            order_ids.len()
        );
        Ok(order_ids)
    }

    async fn check_payment(&self, invoice_id: &InvoiceId) -> Result<crate::traits::PaymentCheck, ConfirmationError> {
        let token = self.tokens.get_token().await?;
        let check = self.provider.check_payment(&token, invoice_id).await?;
        Ok(check)
    }

    async fn authenticate(
        &self,
        auth: &NotificationAuth,
        session_id: &SessionId,
    ) -> Result<Result<PaymentSession, WebhookOutcome>, ConfirmationError> {
        let session = self.sessions.fetch(session_id).await?;
        match (auth, session) {
            (NotificationAuth::Internal, Some(session)) => Ok(Ok(session)),
            (NotificationAuth::Internal, None) => Ok(Err(WebhookOutcome::SessionMissing)),
            // An absent session and a bad token are indistinguishable to an outside caller.
            (NotificationAuth::CallbackToken { .. }, None) => Ok(Err(WebhookOutcome::InvalidToken)),
            (NotificationAuth::CallbackToken { token, .. }, Some(session)) => {
                if token == &session.callback_token {
                    Ok(Ok(session))
                } else {
                    warn!("🛎️ Invalid callback token presented for session [{session_id}]");
                    Ok(Err(WebhookOutcome::InvalidToken))
                }
            },
        }
    }

    async fn record_event(&self, note: &PaymentNotification) -> Option<i64> {
        let event = NewWebhookEvent {
            invoice_id: note.invoice_id.as_ref().map(|i| i.to_string()),
            status: note.status.clone(),
            payload: note.payload.clone(),
        };
        match self.db().insert_webhook_event(event).await {
            Ok(id) => Some(id),
            Err(e) => {
                // Auditing is best-effort; a full disk must not block payment confirmation.
                warn!("🛎️ Could not record webhook event: {e}");
                None
            },
        }
    }

    //--------------------------------------   Reconciliation   ------------------------------------------------------

    /// Re-checks one open session against the provider and repairs any partial state.
    pub async fn reconcile_session(&self, session: &PaymentSession) -> Result<ReconcileAction, ConfirmationError> {
        let Some(invoice_id) = session.invoice_id.clone() else {
            return Ok(ReconcileAction::StillPending);
        };
        if let Some(marker) = self.db().fetch_marker(&invoice_id).await? {
            if marker.is_incomplete() {
                // The previous holder claimed the invoice and then died before attaching
                // orders. We own the recovery: the payment was already verified back then.
                info!("🕰️ Recovering abandoned marker for invoice [{invoice_id}]");
                let order_ids = self.materialize_orders(session, &invoice_id).await?;
                return Ok(ReconcileAction::Recovered { order_ids });
            }
            if session.status != SessionStatus::Processed {
                self.db().update_session_status(&session.session_id, SessionStatus::Processed).await?;
                self.sessions.evict(&session.session_id).await;
                info!("🕰️ Session [{}] status healed to Processed from its complete marker", session.session_id);
                return Ok(ReconcileAction::StatusHealed);
            }
            return Ok(ReconcileAction::StillPending);
        }
        match self.verify_and_materialize(session.clone(), &invoice_id).await? {
            WebhookOutcome::OrderCreated { order_ids } => Ok(ReconcileAction::Confirmed { order_ids }),
            WebhookOutcome::Duplicate { order_ids } => Ok(ReconcileAction::Confirmed { order_ids }),
            WebhookOutcome::AmountMismatch => Ok(ReconcileAction::AmountMismatch),
            _ => Ok(ReconcileAction::StillPending),
        }
    }

    /// One sweep over every session due for reconciliation. Failures on individual sessions are
    /// logged and skipped; one broken session must not starve the rest of the batch.
    pub async fn run_reconciliation_pass(&self, filter: crate::traits::ReconciliationFilter) -> ReconcileStats {
        let mut stats = ReconcileStats::default();
        let candidates = match self.db().fetch_reconciliation_candidates(filter).await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("🕰️ Could not fetch reconciliation candidates: {e}");
                stats.failures += 1;
                return stats;
            },
        };
        stats.examined = candidates.len();
        for session in &candidates {
            match self.reconcile_session(session).await {
                Ok(ReconcileAction::Confirmed { .. }) => stats.confirmed += 1,
                Ok(ReconcileAction::Recovered { .. }) => stats.recovered += 1,
                Ok(ReconcileAction::StatusHealed) => stats.recovered += 1,
                Ok(ReconcileAction::StillPending) => stats.still_pending += 1,
                Ok(ReconcileAction::AmountMismatch) => stats.amount_mismatches += 1,
                Err(e) => {
                    warn!("🕰️ Reconciliation failed for session [{}]: {e}", session.session_id);
                    stats.failures += 1;
                },
            }
        }
        stats
    }

    //----------------------------------------   Sessions   ----------------------------------------------------------

    /// Cancels a session on behalf of its owner. Only open sessions can be cancelled; a session
    /// whose orders exist (or that is already closed) is out of reach.
    pub async fn cancel_session(&self, id: &SessionId, user_id: &str) -> Result<PaymentSession, ConfirmationError> {
        let session =
            self.sessions.fetch(id).await?.ok_or_else(|| ConfirmationError::SessionNotFound(id.clone()))?;
        if session.user_id != user_id {
            return Err(ConfirmationError::NotOwner(id.clone()));
        }
        match session.status {
            SessionStatus::Pending | SessionStatus::Paid => {
                let updated = self.db().update_session_status(id, SessionStatus::Cancelled).await?;
                self.sessions.refresh(&updated).await;
                info!("🔄️ Session [{id}] cancelled by its owner");
                Ok(updated)
            },
            status => Err(ConfirmationError::CancelForbidden { session_id: id.clone(), status }),
        }
    }

    /// The owner-facing status report for one session.
    pub async fn session_status(&self, id: &SessionId, user_id: &str) -> Result<SessionStatusResult, ConfirmationError> {
        let session =
            self.sessions.fetch(id).await?.ok_or_else(|| ConfirmationError::SessionNotFound(id.clone()))?;
        if session.user_id != user_id {
            return Err(ConfirmationError::NotOwner(id.clone()));
        }
        let order_ids = match (&session.status, &session.invoice_id) {
            (SessionStatus::Processed, Some(invoice_id)) => self
                .db()
                .fetch_marker(invoice_id)
                .await?
                .map(|m| m.order_ids.0.clone())
                .unwrap_or_default(),
            _ => vec![],
        };
        Ok(SessionStatusResult { session_id: session.session_id, status: session.status, order_ids })
    }
}

/// Tally of one reconciliation sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileStats {
    pub examined: usize,
    pub confirmed: usize,
    pub recovered: usize,
    pub still_pending: usize,
    pub amount_mismatches: usize,
    pub failures: usize,
}
