//! Tests for the reconciliation and cleanup passes: lost webhooks, crashed processors and the
//! retention sweeps.

use chrono::Duration;
use paygate_common::MinorUnits;
use paygate_engine::{
    cache::MemoryCache,
    cleanup::{run_cleanup_tick, CleanupConfig},
    db_types::{NewCheckout, SessionId, SessionStatus},
    test_utils::{
        mocks::{MockOrderCreator, MockProvider},
        prepare_test_env,
        random_db_path,
    },
    traits::{PaymentStore, ReconciliationFilter},
    ConfirmationApi,
    ConfirmationApiConfig,
    ConfirmationError,
    NotificationAuth,
    PaymentNotification,
    ReconcileAction,
    SqliteDatabase,
    TokenConfig,
    WebhookOutcome,
};
use serde_json::json;

type TestApi = ConfirmationApi<MemoryCache, SqliteDatabase, MockProvider, MockOrderCreator>;

struct Harness {
    api: TestApi,
    cache: MemoryCache,
    provider: MockProvider,
    orders: MockOrderCreator,
}

async fn setup() -> Harness {
    let url = random_db_path();
    prepare_test_env(&url).await;
    let db = SqliteDatabase::new_with_url(&url, 5).await.expect("Error creating database");
    let provider = MockProvider::new();
    let orders = MockOrderCreator::new();
    let cache = MemoryCache::new();
    let config = ConfirmationApiConfig {
        session_ttl: std::time::Duration::from_secs(300),
        callback_base: "https://api.test".to_string(),
        token: TokenConfig::default(),
    };
    let api = ConfirmationApi::new(cache.clone(), db, provider.clone(), orders.clone(), config);
    Harness { api, cache, provider, orders }
}

fn checkout(user_id: &str, amount: i64) -> NewCheckout {
    NewCheckout {
        user_id: user_id.to_string(),
        amount: MinorUnits::from(amount),
        currency: "EUR".to_string(),
        cart_payload: json!({"items": []}),
    }
}

/// A filter that treats every open session as due, regardless of age.
fn eager_filter() -> ReconciliationFilter {
    ReconciliationFilter {
        min_age: Duration::seconds(-1),
        recheck_interval: Duration::seconds(-1),
        batch_size: 50,
    }
}

fn cleanup_config() -> CleanupConfig {
    CleanupConfig {
        interval: std::time::Duration::from_secs(3600),
        lock_ttl: std::time::Duration::from_secs(10),
        pending_expiry: Duration::hours(2),
        processed_retention: Duration::days(30),
        terminal_retention: Duration::days(7),
        events_retention: Duration::days(90),
        markers_retention: None,
    }
}

/// Backdates a session's `updated_at` so age-based queries see it as old.
async fn backdate(db: &SqliteDatabase, id: &SessionId, hours: i64) {
    sqlx::query("UPDATE payment_sessions SET updated_at = datetime('now', ?) WHERE session_id = ?")
        .bind(format!("-{hours} hours"))
        .bind(id.as_str())
        .execute(db.pool())
        .await
        .unwrap();
}

#[tokio::test]
async fn reconciliation_confirms_a_session_whose_webhook_was_lost() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 4200)).await.unwrap().session;
    let invoice = session.invoice_id.clone().unwrap();
    // The user paid, but no webhook ever arrived.
    h.provider.set_paid(&invoice, MinorUnits::from(4200));

    let stats = h.api.run_reconciliation_pass(eager_filter()).await;
    assert_eq!(stats.examined, 1);
    assert_eq!(stats.confirmed, 1);
    assert_eq!(h.orders.calls(), 1);

    let stored = h.api.db().fetch_session(&session.session_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Processed);
}

#[tokio::test]
async fn reconciliation_recovers_an_abandoned_marker() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 800)).await.unwrap().session;
    let invoice = session.invoice_id.clone().unwrap();
    h.provider.set_paid(&invoice, MinorUnits::from(800));
    h.orders.fail_next(true);
    let auth = NotificationAuth::CallbackToken {
        session_id: session.session_id.clone(),
        token: session.callback_token.clone(),
    };
    let note = PaymentNotification {
        session_id: session.session_id.clone(),
        invoice_id: Some(invoice.clone()),
        status: Some("PAID".to_string()),
        payload: json!({}),
    };
    // The webhook claims the invoice, then dies in order creation.
    let result = h.api.process_notification(auth, note).await;
    assert!(matches!(result, Err(ConfirmationError::OrderCreation(_))));
    assert!(h.api.db().fetch_marker(&invoice).await.unwrap().unwrap().is_incomplete());

    // The order service comes back. Reconciliation finishes the job.
    h.orders.fail_next(false);
    let action = h.api.reconcile_session(&session).await.unwrap();
    let ReconcileAction::Recovered { order_ids } = action else {
        panic!("Expected Recovered, got {action:?}");
    };
    assert_eq!(order_ids.len(), 1);

    let marker = h.api.db().fetch_marker(&invoice).await.unwrap().unwrap();
    assert!(!marker.is_incomplete());
    let stored = h.api.db().fetch_session(&session.session_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Processed);
}

#[tokio::test]
async fn reconciliation_skips_unpaid_sessions_without_side_effects() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 100)).await.unwrap().session;
    let stats = h.api.run_reconciliation_pass(eager_filter()).await;
    assert_eq!(stats.examined, 1);
    assert_eq!(stats.still_pending, 1);
    assert_eq!(h.orders.calls(), 0);
    let stored = h.api.db().fetch_session(&session.session_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Pending);
    assert!(stored.last_check_at.is_some());
}

#[tokio::test]
async fn cancelled_and_processed_sessions_are_not_reconciliation_candidates() {
    let h = setup().await;
    let cancelled = h.api.create_session(checkout("alice", 100)).await.unwrap().session;
    h.api.cancel_session(&cancelled.session_id, "alice").await.unwrap();
    let candidates = h.api.db().fetch_reconciliation_candidates(eager_filter()).await.unwrap();
    assert!(candidates.is_empty());
}

#[tokio::test]
async fn recheck_interval_rate_limits_provider_calls() {
    let h = setup().await;
    h.api.create_session(checkout("alice", 100)).await.unwrap();
    // First pass stamps last_check_at.
    h.api.run_reconciliation_pass(eager_filter()).await;
    assert_eq!(h.provider.check_calls(), 1);
    // With a long recheck interval, the session is no longer due.
    let filter = ReconciliationFilter {
        min_age: Duration::seconds(-1),
        recheck_interval: Duration::minutes(15),
        batch_size: 50,
    };
    let stats = h.api.run_reconciliation_pass(filter).await;
    assert_eq!(stats.examined, 0);
    assert_eq!(h.provider.check_calls(), 1);
}

#[tokio::test]
async fn one_bad_session_does_not_starve_the_batch() {
    let h = setup().await;
    let broken = h.api.create_session(checkout("alice", 100)).await.unwrap().session;
    let healthy = h.api.create_session(checkout("bob", 200)).await.unwrap().session;
    let broken_invoice = broken.invoice_id.clone().unwrap();
    let healthy_invoice = healthy.invoice_id.clone().unwrap();
    h.provider.set_paid(&broken_invoice, MinorUnits::from(100));
    h.provider.set_paid(&healthy_invoice, MinorUnits::from(200));
    // Candidates come back oldest first; backdating pins the broken session to the front.
    backdate(h.api.db(), &broken.session_id, 2).await;
    backdate(h.api.db(), &healthy.session_id, 1).await;
    // Order creation fails for the first candidate only (the flag is one-shot).
    h.orders.fail_next(true);
    let stats = h.api.run_reconciliation_pass(eager_filter()).await;
    assert_eq!(stats.examined, 2);
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.confirmed, 1);
    let stored = h.api.db().fetch_session(&healthy.session_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Processed);
}

#[tokio::test]
async fn stale_pending_sessions_are_expired_before_anything_is_deleted() {
    let h = setup().await;
    let stale = h.api.create_session(checkout("alice", 100)).await.unwrap().session;
    let fresh = h.api.create_session(checkout("bob", 200)).await.unwrap().session;
    backdate(h.api.db(), &stale.session_id, 3).await;

    let totals = run_cleanup_tick(&h.cache, h.api.db(), &cleanup_config()).await.unwrap();
    assert_eq!(totals.sessions_expired, 1);
    assert_eq!(totals.sessions_deleted, 0);

    let stale_row = h.api.db().fetch_session(&stale.session_id).await.unwrap().unwrap();
    assert_eq!(stale_row.status, SessionStatus::Expired);
    let fresh_row = h.api.db().fetch_session(&fresh.session_id).await.unwrap().unwrap();
    assert_eq!(fresh_row.status, SessionStatus::Pending);

    // The cached copy was evicted, so a status poll sees Expired, not a stale Pending.
    let status = h.api.session_status(&stale.session_id, "alice").await.unwrap();
    assert_eq!(status.status, SessionStatus::Expired);
}

#[tokio::test]
async fn retention_deletes_only_aged_out_terminal_sessions() {
    let h = setup().await;
    let cancelled = h.api.create_session(checkout("alice", 100)).await.unwrap().session;
    h.api.cancel_session(&cancelled.session_id, "alice").await.unwrap();
    let open = h.api.create_session(checkout("bob", 200)).await.unwrap().session;

    // Both rows are 10 days old; only the cancelled one is past its 7 day retention, and the
    // open one is protected regardless of age by the status constraint.
    backdate(h.api.db(), &cancelled.session_id, 10 * 24).await;
    backdate(h.api.db(), &open.session_id, 10 * 24).await;

    let mut config = cleanup_config();
    // A pending session 10 days old would also be expired by this tick; push the expiry window
    // out of the way so the test isolates deletion.
    config.pending_expiry = Duration::days(30);
    let totals = run_cleanup_tick(&h.cache, h.api.db(), &config).await.unwrap();
    assert_eq!(totals.sessions_deleted, 1);

    assert!(h.api.db().fetch_session(&cancelled.session_id).await.unwrap().is_none());
    assert!(h.api.db().fetch_session(&open.session_id).await.unwrap().is_some());
}

#[tokio::test]
async fn markers_outlive_their_sessions() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 500)).await.unwrap().session;
    let invoice = session.invoice_id.clone().unwrap();
    h.provider.set_paid(&invoice, MinorUnits::from(500));
    let auth = NotificationAuth::CallbackToken {
        session_id: session.session_id.clone(),
        token: session.callback_token.clone(),
    };
    let note = PaymentNotification {
        session_id: session.session_id.clone(),
        invoice_id: Some(invoice.clone()),
        status: Some("PAID".to_string()),
        payload: json!({}),
    };
    let outcome = h.api.process_notification(auth.clone(), note.clone()).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::OrderCreated { .. }));

    // Age the processed session past its retention and sweep it away.
    backdate(h.api.db(), &session.session_id, 40 * 24).await;
    let totals = run_cleanup_tick(&h.cache, h.api.db(), &cleanup_config()).await.unwrap();
    assert_eq!(totals.sessions_deleted, 1);
    assert_eq!(totals.markers_deleted, 0);

    // With markers_retention = None the dedup ledger is forever. An external duplicate can no
    // longer authenticate, but a trusted one is still answered from the marker.
    assert!(h.api.db().fetch_marker(&invoice).await.unwrap().is_some());
    let late = h.api.process_notification(auth, note.clone()).await.unwrap();
    assert_eq!(late, WebhookOutcome::InvalidToken);
    let trusted = h.api.process_notification(NotificationAuth::Internal, note).await.unwrap();
    let WebhookOutcome::Duplicate { order_ids } = trusted else {
        panic!("Expected Duplicate, got {trusted:?}");
    };
    assert_eq!(order_ids.len(), 1);
}

#[tokio::test]
async fn old_webhook_events_are_purged() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 100)).await.unwrap().session;
    let auth = NotificationAuth::CallbackToken {
        session_id: session.session_id.clone(),
        token: session.callback_token.clone(),
    };
    let note = PaymentNotification {
        session_id: session.session_id.clone(),
        invoice_id: session.invoice_id.clone(),
        status: None,
        payload: json!({}),
    };
    h.api.process_notification(auth, note).await.unwrap();
    sqlx::query("UPDATE webhook_events SET created_at = datetime('now', '-100 days')")
        .execute(h.api.db().pool())
        .await
        .unwrap();
    let totals = run_cleanup_tick(&h.cache, h.api.db(), &cleanup_config()).await.unwrap();
    assert_eq!(totals.events_deleted, 1);
}

#[tokio::test]
async fn complete_markers_are_purged_when_a_retention_is_set() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 500)).await.unwrap().session;
    let invoice = session.invoice_id.clone().unwrap();
    h.provider.set_paid(&invoice, MinorUnits::from(500));
    let auth = NotificationAuth::CallbackToken {
        session_id: session.session_id.clone(),
        token: session.callback_token.clone(),
    };
    let note = PaymentNotification {
        session_id: session.session_id.clone(),
        invoice_id: Some(invoice.clone()),
        status: Some("PAID".to_string()),
        payload: json!({}),
    };
    h.api.process_notification(auth, note).await.unwrap();
    sqlx::query("UPDATE processed_invoices SET created_at = datetime('now', '-200 days')")
        .execute(h.api.db().pool())
        .await
        .unwrap();
    let mut config = cleanup_config();
    config.markers_retention = Some(Duration::days(180));
    let totals = run_cleanup_tick(&h.cache, h.api.db(), &config).await.unwrap();
    assert_eq!(totals.markers_deleted, 1);
    assert!(h.api.db().fetch_marker(&invoice).await.unwrap().is_none());
}
