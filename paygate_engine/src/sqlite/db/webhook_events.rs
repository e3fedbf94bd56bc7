use chrono::Duration;
use log::trace;
use sqlx::SqliteConnection;

use crate::db_types::{NewWebhookEvent, WebhookEvent};

/// Records one raw inbound notification in the audit trail.
pub async fn insert_event(event: NewWebhookEvent, conn: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
    let id = sqlx::query_scalar(
        r#"
            INSERT INTO webhook_events (invoice_id, status, payload)
            VALUES ($1, $2, $3)
            RETURNING id;
        "#,
    )
    .bind(&event.invoice_id)
    .bind(&event.status)
    .bind(event.payload.to_string())
    .fetch_all(conn)
    .await?
    .pop()
    .ok_or(sqlx::Error::RowNotFound)?;
    trace!("🛎️ Webhook event #{id} recorded for invoice {:?}", event.invoice_id);
    Ok(id)
}

/// Stamps the audit row with how the notification was dispositioned.
pub async fn record_outcome(
    id: i64,
    outcome: &str,
    last_error: Option<&str>,
    conn: &mut SqliteConnection,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE webhook_events SET outcome = $1, last_error = $2 WHERE id = $3")
        .bind(outcome)
        .bind(last_error)
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn fetch_events_for_invoice(
    invoice_id: &str,
    conn: &mut SqliteConnection,
) -> Result<Vec<WebhookEvent>, sqlx::Error> {
    let events = sqlx::query_as("SELECT * FROM webhook_events WHERE invoice_id = $1 ORDER BY id ASC")
        .bind(invoice_id)
        .fetch_all(conn)
        .await?;
    Ok(events)
}

pub async fn delete_old_events(retention: Duration, conn: &mut SqliteConnection) -> Result<u64, sqlx::Error> {
    let deleted = sqlx::query(
        r#"
            DELETE FROM webhook_events
            WHERE unixepoch(CURRENT_TIMESTAMP) - unixepoch(created_at) > $1;
        "#,
    )
    .bind(retention.num_seconds())
    .execute(conn)
    .await?
    .rows_affected();
    Ok(deleted)
}
