use async_trait::async_trait;
use chrono::Duration;
use thiserror::Error;

use crate::db_types::{
    InvoiceId,
    NewWebhookEvent,
    PaymentSession,
    ProcessedInvoice,
    SessionId,
    SessionStatus,
    WebhookEvent,
};

#[derive(Debug, Clone, Error)]
pub enum PaymentStoreError {
    #[error("We have an internal database engine error (configuration/uptime etc.): {0}")]
    DatabaseError(String),
    #[error("The requested session {0} does not exist")]
    SessionNotFound(SessionId),
    #[error("The processed-invoice marker for {0} does not exist")]
    MarkerNotFound(InvoiceId),
}

impl From<sqlx::Error> for PaymentStoreError {
    fn from(e: sqlx::Error) -> Self {
        PaymentStoreError::DatabaseError(e.to_string())
    }
}

/// The result of attempting to create the idempotency marker for an invoice.
#[derive(Debug, Clone)]
pub enum InsertMarkerResult {
    /// This caller won the race and holds exclusive materialization rights.
    Created(ProcessedInvoice),
    /// Another caller created the marker first; its current state is returned.
    AlreadyExists(ProcessedInvoice),
}

/// Candidate selection parameters for a reconciliation pass.
#[derive(Debug, Clone, Copy)]
pub struct ReconciliationFilter {
    /// Skip sessions updated more recently than this (avoids racing an in-flight notification).
    pub min_age: Duration,
    /// Skip sessions whose last provider check is more recent than this (provider rate limiting).
    pub recheck_interval: Duration,
    pub batch_size: i64,
}

/// Row counts from one cleanup tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupTotals {
    pub sessions_expired: u64,
    pub sessions_deleted: u64,
    pub events_deleted: u64,
    pub markers_deleted: u64,
}

/// The durable system-of-record behind the shared cache.
///
/// The one hard requirement on implementations is that `try_insert_marker` is backed by a
/// storage-level uniqueness constraint on the invoice id: that constraint, not any application
/// lock, is the global serialization point for order materialization.
#[async_trait]
pub trait PaymentStore: Clone + Send + Sync + 'static {
    /// The URL of the database.
    fn url(&self) -> &str;

    async fn insert_session(&self, session: &PaymentSession) -> Result<(), PaymentStoreError>;

    async fn fetch_session(&self, id: &SessionId) -> Result<Option<PaymentSession>, PaymentStoreError>;

    /// Updates the session status. `cancelled_at` is stamped when the new status is `Cancelled`.
    async fn update_session_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
    ) -> Result<PaymentSession, PaymentStoreError>;

    /// Transitions the session to `Paid` and records the provider payment reference.
    async fn mark_session_paid(&self, id: &SessionId, payment_id: &str)
        -> Result<PaymentSession, PaymentStoreError>;

    /// Stamps `last_check_at` without touching `updated_at`, so the reconciliation min-age
    /// window is not reset by the checks themselves.
    async fn touch_last_check(&self, id: &SessionId) -> Result<(), PaymentStoreError>;

    /// Attempts the unique-create of the idempotency marker for `invoice_id`.
    async fn try_insert_marker(
        &self,
        invoice_id: &InvoiceId,
        session_id: &SessionId,
    ) -> Result<InsertMarkerResult, PaymentStoreError>;

    async fn fetch_marker(&self, invoice_id: &InvoiceId) -> Result<Option<ProcessedInvoice>, PaymentStoreError>;

    /// Attaches the materialized order ids to the marker and stamps `processed_at`.
    async fn complete_marker(
        &self,
        invoice_id: &InvoiceId,
        order_ids: &[String],
    ) -> Result<ProcessedInvoice, PaymentStoreError>;

    /// Sessions in `{Pending, Paid}` with an invoice, old enough and not recently re-checked,
    /// oldest first, bounded by the filter's batch size. `Cancelled` and `Expired` sessions are
    /// never returned.
    async fn fetch_reconciliation_candidates(
        &self,
        filter: ReconciliationFilter,
    ) -> Result<Vec<PaymentSession>, PaymentStoreError>;

    /// Appends an audit record for one raw inbound notification and returns its id.
    async fn insert_webhook_event(&self, event: NewWebhookEvent) -> Result<i64, PaymentStoreError>;

    /// Stamps the audit record with the notification's final disposition.
    async fn record_event_outcome(
        &self,
        event_id: i64,
        outcome: &str,
        last_error: Option<&str>,
    ) -> Result<(), PaymentStoreError>;

    /// The audit records naming `invoice_id`, oldest first.
    async fn fetch_webhook_events(&self, invoice_id: &str) -> Result<Vec<WebhookEvent>, PaymentStoreError>;

    /// Marks `Pending` sessions idle for longer than `older_than` as `Expired` and returns them.
    async fn expire_stale_pending(&self, older_than: Duration) -> Result<Vec<PaymentSession>, PaymentStoreError>;

    /// Deletes `Processed` sessions older than `processed_retention` and `Cancelled`/`Expired`
    /// sessions older than `terminal_retention`. `Pending` and `Paid` rows are never touched.
    async fn delete_terminal_sessions(
        &self,
        processed_retention: Duration,
        terminal_retention: Duration,
    ) -> Result<u64, PaymentStoreError>;

    async fn delete_old_webhook_events(&self, retention: Duration) -> Result<u64, PaymentStoreError>;

    /// Deletes `Complete` markers older than `retention`. Incomplete markers are kept: they are
    /// evidence of a payment whose materialization never finished.
    async fn delete_old_markers(&self, retention: Duration) -> Result<u64, PaymentStoreError>;

    /// Closes the database connection.
    async fn close(&mut self) -> Result<(), PaymentStoreError> {
        Ok(())
    }
}
