use chrono::Duration;
use log::debug;
use sqlx::SqliteConnection;

use crate::{
    db_types::{InvoiceId, ProcessedInvoice, SessionId},
    traits::{InsertMarkerResult, PaymentStoreError},
};

/// Attempts to create the idempotency marker for `invoice_id`.
///
/// The primary key on `invoice_id` is the serialization point for the whole engine: exactly one
/// caller, across all server instances and workers, gets `Created` back for a given invoice.
/// Everyone else trips the uniqueness constraint and receives the existing row instead.
pub async fn try_insert_marker(
    invoice_id: &InvoiceId,
    session_id: &SessionId,
    conn: &mut SqliteConnection,
) -> Result<InsertMarkerResult, PaymentStoreError> {
    let result = sqlx::query_as::<_, ProcessedInvoice>(
        r#"
            INSERT INTO processed_invoices (invoice_id, session_id)
            VALUES ($1, $2)
            RETURNING *;
        "#,
    )
    .bind(invoice_id.as_str())
    .bind(session_id.as_str())
    .fetch_all(&mut *conn)
    .await;
    match result {
        Ok(mut rows) => {
            let marker =
                rows.pop().ok_or_else(|| PaymentStoreError::MarkerNotFound(invoice_id.clone()))?;
            debug!("📝️ Marker for invoice [{invoice_id}] created by session [{session_id}]");
            Ok(InsertMarkerResult::Created(marker))
        },
        Err(sqlx::Error::Database(de)) if de.is_unique_violation() => {
            let existing = fetch_marker(invoice_id, conn)
                .await?
                .ok_or_else(|| PaymentStoreError::MarkerNotFound(invoice_id.clone()))?;
            debug!("📝️ Marker for invoice [{invoice_id}] already exists. Created by session [{}]", existing.session_id);
            Ok(InsertMarkerResult::AlreadyExists(existing))
        },
        Err(e) => Err(e.into()),
    }
}

pub async fn fetch_marker(
    invoice_id: &InvoiceId,
    conn: &mut SqliteConnection,
) -> Result<Option<ProcessedInvoice>, sqlx::Error> {
    let marker = sqlx::query_as("SELECT * FROM processed_invoices WHERE invoice_id = $1")
        .bind(invoice_id.as_str())
        .fetch_optional(conn)
        .await?;
    Ok(marker)
}

/// Attaches the materialized order ids and flips the marker to `Complete`.
pub async fn complete_marker(
    invoice_id: &InvoiceId,
    order_ids: &[String],
    conn: &mut SqliteConnection,
) -> Result<ProcessedInvoice, PaymentStoreError> {
    let ids = serde_json::to_string(order_ids).map_err(|e| PaymentStoreError::DatabaseError(e.to_string()))?;
    let marker = sqlx::query_as(
        r#"
            UPDATE processed_invoices
            SET status = 'Complete', order_ids = $1, processed_at = CURRENT_TIMESTAMP
            WHERE invoice_id = $2
            RETURNING *;
        "#,
    )
    .bind(ids)
    .bind(invoice_id.as_str())
    // Step the statement to completion so the write is committed before this returns.
    .fetch_all(&mut *conn)
    .await?
    .pop()
    .ok_or_else(|| PaymentStoreError::MarkerNotFound(invoice_id.clone()))?;
    debug!("📝️ Marker for invoice [{invoice_id}] completed with {} order(s)", order_ids.len());
    Ok(marker)
}

/// Deletes `Complete` markers older than `retention`. Incomplete markers survive every sweep;
/// they record a paid invoice whose orders were never attached.
pub async fn delete_old_complete(retention: Duration, conn: &mut SqliteConnection) -> Result<u64, sqlx::Error> {
    let deleted = sqlx::query(
        r#"
            DELETE FROM processed_invoices
            WHERE status = 'Complete'
              AND unixepoch(CURRENT_TIMESTAMP) - unixepoch(created_at) > $1;
        "#,
    )
    .bind(retention.num_seconds())
    .execute(conn)
    .await?
    .rows_affected();
    Ok(deleted)
}
