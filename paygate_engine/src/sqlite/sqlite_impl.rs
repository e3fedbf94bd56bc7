//! `SqliteDatabase` is a concrete implementation of the engine's durable store.
//!
//! Unsurprisingly, it uses SQLite as the backend and implements the [`PaymentStore`] trait.
use std::fmt::Debug;

use async_trait::async_trait;
use chrono::Duration;
use log::*;
use sqlx::SqlitePool;

use super::db::{db_url, new_pool, processed_invoices, sessions, webhook_events};
use crate::{
    db_types::{InvoiceId, NewWebhookEvent, PaymentSession, ProcessedInvoice, SessionId, SessionStatus, WebhookEvent},
    traits::{InsertMarkerResult, PaymentStore, PaymentStoreError, ReconciliationFilter},
};

#[derive(Clone)]
pub struct SqliteDatabase {
    url: String,
    pool: SqlitePool,
}

impl Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "SqliteDatabase ({:?})", self.pool)
    }
}

impl SqliteDatabase {
    /// Creates a new database API handle with a connection pool of size `max_connections`, using
    /// the URL from the `PAYGATE_DATABASE_URL` environment variable.
    pub async fn new(max_connections: u32) -> Result<Self, PaymentStoreError> {
        let url = db_url();
        Self::new_with_url(&url, max_connections).await
    }

    pub async fn new_with_url(url: &str, max_connections: u32) -> Result<Self, PaymentStoreError> {
        let pool = new_pool(url, max_connections).await?;
        debug!("🗃️ Connected to database at {url}");
        Ok(Self { url: url.to_string(), pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Applies the embedded schema migrations.
    pub async fn run_migrations(&self) -> Result<(), PaymentStoreError> {
        sqlx::migrate!("./src/sqlite/migrations")
            .run(&self.pool)
            .await
            .map_err(|e| PaymentStoreError::DatabaseError(e.to_string()))?;
        info!("🗃️ Migrations complete");
        Ok(())
    }
}

#[async_trait]
impl PaymentStore for SqliteDatabase {
    fn url(&self) -> &str {
        self.url.as_str()
    }

    async fn insert_session(&self, session: &PaymentSession) -> Result<(), PaymentStoreError> {
        let mut conn = self.pool.acquire().await.map_err(PaymentStoreError::from)?;
        sessions::insert_session(session, &mut conn).await
    }

    async fn fetch_session(&self, id: &SessionId) -> Result<Option<PaymentSession>, PaymentStoreError> {
        let mut conn = self.pool.acquire().await.map_err(PaymentStoreError::from)?;
        let session = sessions::fetch_session(id, &mut conn).await?;
        Ok(session)
    }

    async fn update_session_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
    ) -> Result<PaymentSession, PaymentStoreError> {
        let mut conn = self.pool.acquire().await.map_err(PaymentStoreError::from)?;
        sessions::update_status(id, status, &mut conn).await
    }

    async fn mark_session_paid(
        &self,
        id: &SessionId,
        payment_id: &str,
    ) -> Result<PaymentSession, PaymentStoreError> {
        let mut conn = self.pool.acquire().await.map_err(PaymentStoreError::from)?;
        sessions::mark_paid(id, payment_id, &mut conn).await
    }

    async fn touch_last_check(&self, id: &SessionId) -> Result<(), PaymentStoreError> {
        let mut conn = self.pool.acquire().await.map_err(PaymentStoreError::from)?;
        sessions::touch_last_check(id, &mut conn).await
    }

    async fn try_insert_marker(
        &self,
        invoice_id: &InvoiceId,
        session_id: &SessionId,
    ) -> Result<InsertMarkerResult, PaymentStoreError> {
        let mut conn = self.pool.acquire().await.map_err(PaymentStoreError::from)?;
        processed_invoices::try_insert_marker(invoice_id, session_id, &mut conn).await
    }

    async fn fetch_marker(&self, invoice_id: &InvoiceId) -> Result<Option<ProcessedInvoice>, PaymentStoreError> {
        let mut conn = self.pool.acquire().await.map_err(PaymentStoreError::from)?;
        let marker = processed_invoices::fetch_marker(invoice_id, &mut conn).await?;
        Ok(marker)
    }

    async fn complete_marker(
        &self,
        invoice_id: &InvoiceId,
        order_ids: &[String],
    ) -> Result<ProcessedInvoice, PaymentStoreError> {
        let mut conn = self.pool.acquire().await.map_err(PaymentStoreError::from)?;
        processed_invoices::complete_marker(invoice_id, order_ids, &mut conn).await
    }

    async fn fetch_reconciliation_candidates(
        &self,
        filter: ReconciliationFilter,
    ) -> Result<Vec<PaymentSession>, PaymentStoreError> {
        let mut conn = self.pool.acquire().await.map_err(PaymentStoreError::from)?;
        let candidates = sessions::reconciliation_candidates(filter, &mut conn).await?;
        trace!("🗃️ {} session(s) due for reconciliation", candidates.len());
        Ok(candidates)
    }

    async fn insert_webhook_event(&self, event: NewWebhookEvent) -> Result<i64, PaymentStoreError> {
        let mut conn = self.pool.acquire().await.map_err(PaymentStoreError::from)?;
        let id = webhook_events::insert_event(event, &mut conn).await?;
        Ok(id)
    }

    async fn record_event_outcome(
        &self,
        event_id: i64,
        outcome: &str,
        last_error: Option<&str>,
    ) -> Result<(), PaymentStoreError> {
        let mut conn = self.pool.acquire().await.map_err(PaymentStoreError::from)?;
        webhook_events::record_outcome(event_id, outcome, last_error, &mut conn).await?;
        Ok(())
    }

    async fn fetch_webhook_events(&self, invoice_id: &str) -> Result<Vec<WebhookEvent>, PaymentStoreError> {
        let mut conn = self.pool.acquire().await.map_err(PaymentStoreError::from)?;
        let events = webhook_events::fetch_events_for_invoice(invoice_id, &mut conn).await?;
        Ok(events)
    }

    async fn expire_stale_pending(&self, older_than: Duration) -> Result<Vec<PaymentSession>, PaymentStoreError> {
        let mut conn = self.pool.acquire().await.map_err(PaymentStoreError::from)?;
        let expired = sessions::expire_stale_pending(older_than, &mut conn).await?;
        if !expired.is_empty() {
            info!("🗃️ {} stale pending session(s) expired", expired.len());
        }
        Ok(expired)
    }

    async fn delete_terminal_sessions(
        &self,
        processed_retention: Duration,
        terminal_retention: Duration,
    ) -> Result<u64, PaymentStoreError> {
        let mut conn = self.pool.acquire().await.map_err(PaymentStoreError::from)?;
        let deleted = sessions::delete_terminal(processed_retention, terminal_retention, &mut conn).await?;
        Ok(deleted)
    }

    async fn delete_old_webhook_events(&self, retention: Duration) -> Result<u64, PaymentStoreError> {
        let mut conn = self.pool.acquire().await.map_err(PaymentStoreError::from)?;
        let deleted = webhook_events::delete_old_events(retention, &mut conn).await?;
        Ok(deleted)
    }

    async fn delete_old_markers(&self, retention: Duration) -> Result<u64, PaymentStoreError> {
        let mut conn = self.pool.acquire().await.map_err(PaymentStoreError::from)?;
        let deleted = processed_invoices::delete_old_complete(retention, &mut conn).await?;
        Ok(deleted)
    }

    async fn close(&mut self) -> Result<(), PaymentStoreError> {
        self.pool.close().await;
        Ok(())
    }
}
