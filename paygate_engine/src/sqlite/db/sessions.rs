use chrono::Duration;
use log::debug;
use sqlx::SqliteConnection;

use crate::{
    db_types::{PaymentSession, SessionId, SessionStatus},
    traits::{PaymentStoreError, ReconciliationFilter},
};

pub async fn insert_session(session: &PaymentSession, conn: &mut SqliteConnection) -> Result<(), PaymentStoreError> {
    sqlx::query(
        r#"
            INSERT INTO payment_sessions (
                session_id,
                user_id,
                amount,
                currency,
                cart_payload,
                invoice_id,
                payment_id,
                callback_token,
                status,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11);
        "#,
    )
    .bind(session.session_id.as_str())
    .bind(&session.user_id)
    .bind(session.amount.value())
    .bind(&session.currency)
    .bind(&session.cart_payload)
    .bind(session.invoice_id.as_ref().map(|i| i.as_str()))
    .bind(&session.payment_id)
    .bind(&session.callback_token)
    .bind(session.status.to_string())
    .bind(session.created_at)
    .bind(session.updated_at)
    .execute(conn)
    .await?;
    debug!("🗃️ Session [{}] saved in the DB", session.session_id);
    Ok(())
}

pub async fn fetch_session(id: &SessionId, conn: &mut SqliteConnection) -> Result<Option<PaymentSession>, sqlx::Error> {
    let session = sqlx::query_as("SELECT * FROM payment_sessions WHERE session_id = $1")
        .bind(id.as_str())
        .fetch_optional(conn)
        .await?;
    Ok(session)
}

/// Sets the session status. The `cancelled_at` timestamp is stamped iff the new status is `Cancelled`.
pub async fn update_status(
    id: &SessionId,
    status: SessionStatus,
    conn: &mut SqliteConnection,
) -> Result<PaymentSession, PaymentStoreError> {
    let session = sqlx::query_as(
        r#"
            UPDATE payment_sessions
            SET status = $1,
                cancelled_at = CASE WHEN $1 = 'Cancelled' THEN CURRENT_TIMESTAMP ELSE cancelled_at END,
                updated_at = CURRENT_TIMESTAMP
            WHERE session_id = $2
            RETURNING *;
        "#,
    )
    .bind(status.to_string())
    .bind(id.as_str())
    // fetch_all steps the statement to completion, so the write has committed by the time this
    // returns and an immediate read on another pool connection sees the new row.
    .fetch_all(&mut *conn)
    .await?
    .pop()
    .ok_or_else(|| PaymentStoreError::SessionNotFound(id.clone()))?;
    debug!("🗃️ Session [{id}] status updated to {status}");
    Ok(session)
}

pub async fn mark_paid(
    id: &SessionId,
    payment_id: &str,
    conn: &mut SqliteConnection,
) -> Result<PaymentSession, PaymentStoreError> {
    let session = sqlx::query_as(
        r#"
            UPDATE payment_sessions
            SET status = 'Paid', payment_id = $1, updated_at = CURRENT_TIMESTAMP
            WHERE session_id = $2
            RETURNING *;
        "#,
    )
    .bind(payment_id)
    .bind(id.as_str())
    .fetch_all(&mut *conn)
    .await?
    .pop()
    .ok_or_else(|| PaymentStoreError::SessionNotFound(id.clone()))?;
    debug!("🗃️ Session [{id}] marked as Paid (payment {payment_id})");
    Ok(session)
}

/// Stamps `last_check_at` only. `updated_at` is deliberately left alone so that provider checks
/// do not keep resetting the reconciliation age window.
pub async fn touch_last_check(id: &SessionId, conn: &mut SqliteConnection) -> Result<(), PaymentStoreError> {
    let result = sqlx::query("UPDATE payment_sessions SET last_check_at = CURRENT_TIMESTAMP WHERE session_id = $1")
        .bind(id.as_str())
        .execute(conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(PaymentStoreError::SessionNotFound(id.clone()));
    }
    Ok(())
}

/// Open sessions with an invoice that are due for a provider re-check. Oldest first.
pub async fn reconciliation_candidates(
    filter: ReconciliationFilter,
    conn: &mut SqliteConnection,
) -> Result<Vec<PaymentSession>, sqlx::Error> {
    let min_age_secs = filter.min_age.num_seconds();
    let recheck_secs = filter.recheck_interval.num_seconds();
    let sessions = sqlx::query_as(
        r#"
            SELECT * FROM payment_sessions
            WHERE status IN ('Pending', 'Paid')
              AND invoice_id IS NOT NULL
              AND unixepoch(CURRENT_TIMESTAMP) - unixepoch(updated_at) > $1
              AND (last_check_at IS NULL OR unixepoch(CURRENT_TIMESTAMP) - unixepoch(last_check_at) > $2)
            ORDER BY updated_at ASC
            LIMIT $3;
        "#,
    )
    .bind(min_age_secs)
    .bind(recheck_secs)
    .bind(filter.batch_size)
    .fetch_all(conn)
    .await?;
    Ok(sessions)
}

/// Expires `Pending` sessions that have been idle longer than `older_than` and returns them.
pub async fn expire_stale_pending(
    older_than: Duration,
    conn: &mut SqliteConnection,
) -> Result<Vec<PaymentSession>, sqlx::Error> {
    let secs = older_than.num_seconds();
    let expired = sqlx::query_as(
        r#"
            UPDATE payment_sessions
            SET status = 'Expired', updated_at = CURRENT_TIMESTAMP
            WHERE status = 'Pending'
              AND unixepoch(CURRENT_TIMESTAMP) - unixepoch(updated_at) > $1
            RETURNING *;
        "#,
    )
    .bind(secs)
    .fetch_all(conn)
    .await?;
    Ok(expired)
}

/// Deletes aged-out terminal sessions. `Processed` sessions get their own retention window;
/// `Cancelled` and `Expired` share a (typically shorter) one. Open sessions are never deleted.
pub async fn delete_terminal(
    processed_retention: Duration,
    terminal_retention: Duration,
    conn: &mut SqliteConnection,
) -> Result<u64, sqlx::Error> {
    let processed = sqlx::query(
        r#"
            DELETE FROM payment_sessions
            WHERE status = 'Processed'
              AND unixepoch(CURRENT_TIMESTAMP) - unixepoch(updated_at) > $1;
        "#,
    )
    .bind(processed_retention.num_seconds())
    .execute(&mut *conn)
    .await?
    .rows_affected();
    let terminal = sqlx::query(
        r#"
            DELETE FROM payment_sessions
            WHERE status IN ('Cancelled', 'Expired')
              AND unixepoch(CURRENT_TIMESTAMP) - unixepoch(updated_at) > $1;
        "#,
    )
    .bind(terminal_retention.num_seconds())
    .execute(conn)
    .await?
    .rows_affected();
    Ok(processed + terminal)
}
