//! End-to-end tests for the confirmation flow: checkout, webhook processing, idempotency and
//! cancellation, running against a real SQLite store and the in-process cache.

use paygate_common::MinorUnits;
use paygate_engine::{
    cache::MemoryCache,
    db_types::{NewCheckout, PaymentSession, SessionStatus},
    test_utils::{
        mocks::{MockOrderCreator, MockProvider},
        prepare_test_env,
        random_db_path,
    },
    traits::PaymentStore,
    ConfirmationApi,
    ConfirmationApiConfig,
    ConfirmationError,
    NotificationAuth,
    PaymentNotification,
    SqliteDatabase,
    TokenConfig,
    WebhookOutcome,
};
use serde_json::json;

type TestApi = ConfirmationApi<MemoryCache, SqliteDatabase, MockProvider, MockOrderCreator>;

struct Harness {
    api: TestApi,
    provider: MockProvider,
    orders: MockOrderCreator,
}

async fn setup() -> Harness {
    let url = random_db_path();
    prepare_test_env(&url).await;
    let db = SqliteDatabase::new_with_url(&url, 5).await.expect("Error creating database");
    let provider = MockProvider::new();
    let orders = MockOrderCreator::new();
    let config = ConfirmationApiConfig {
        session_ttl: std::time::Duration::from_secs(300),
        callback_base: "https://api.test".to_string(),
        token: TokenConfig::default(),
    };
    let api = ConfirmationApi::new(MemoryCache::new(), db, provider.clone(), orders.clone(), config);
    Harness { api, provider, orders }
}

fn checkout(user_id: &str, amount: i64) -> NewCheckout {
    NewCheckout {
        user_id: user_id.to_string(),
        amount: MinorUnits::from(amount),
        currency: "EUR".to_string(),
        cart_payload: json!({"items": [{"sku": "sku-1", "qty": 2}]}),
    }
}

fn note_for(session: &PaymentSession) -> PaymentNotification {
    PaymentNotification {
        session_id: session.session_id.clone(),
        invoice_id: session.invoice_id.clone(),
        status: Some("PAID".to_string()),
        payload: json!({"source": "test"}),
    }
}

fn external_auth(session: &PaymentSession) -> NotificationAuth {
    NotificationAuth::CallbackToken {
        session_id: session.session_id.clone(),
        token: session.callback_token.clone(),
    }
}

#[tokio::test]
async fn checkout_creates_invoice_and_pending_session() {
    let h = setup().await;
    let result = h.api.create_session(checkout("alice", 2500)).await.unwrap();
    assert_eq!(result.session.status, SessionStatus::Pending);
    assert!(result.session.invoice_id.is_some());
    assert!(result.payment_url.starts_with("https://pay.test/"));
    // The durable row exists and matches.
    let stored = h.api.db().fetch_session(&result.session.session_id).await.unwrap().unwrap();
    assert_eq!(stored.amount, MinorUnits::from(2500));
    assert_eq!(stored.user_id, "alice");
}

#[tokio::test]
async fn paid_webhook_creates_orders_exactly_once() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 2500)).await.unwrap().session;
    let invoice = session.invoice_id.clone().unwrap();
    h.provider.set_paid(&invoice, MinorUnits::from(2500));

    let first = h.api.process_notification(external_auth(&session), note_for(&session)).await.unwrap();
    let WebhookOutcome::OrderCreated { order_ids } = first else {
        panic!("Expected OrderCreated, got {first:?}");
    };
    assert_eq!(order_ids.len(), 1);

    // The same delivery again is answered from the marker without re-creating anything.
    let second = h.api.process_notification(external_auth(&session), note_for(&session)).await.unwrap();
    assert_eq!(second, WebhookOutcome::Duplicate { order_ids: order_ids.clone() });
    assert_eq!(h.orders.calls(), 1);

    let stored = h.api.db().fetch_session(&session.session_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Processed);
}

#[tokio::test]
async fn concurrent_deliveries_race_to_a_single_order() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 9900)).await.unwrap().session;
    let invoice = session.invoice_id.clone().unwrap();
    h.provider.set_paid(&invoice, MinorUnits::from(9900));

    let tasks = (0..8).map(|_| {
        let api = h.api.clone();
        let auth = external_auth(&session);
        let note = note_for(&session);
        tokio::spawn(async move { api.process_notification(auth, note).await.unwrap() })
    });
    let outcomes = futures_util::future::try_join_all(tasks).await.unwrap();

    let created = outcomes.iter().filter(|o| matches!(o, WebhookOutcome::OrderCreated { .. })).count();
    let duplicates = outcomes.iter().filter(|o| matches!(o, WebhookOutcome::Duplicate { .. })).count();
    assert_eq!(created, 1, "exactly one delivery may win the marker race");
    assert_eq!(created + duplicates, 8);
    assert_eq!(h.orders.calls(), 1);
}

#[tokio::test]
async fn bad_callback_token_is_rejected_without_a_provider_call() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 100)).await.unwrap().session;
    let auth = NotificationAuth::CallbackToken {
        session_id: session.session_id.clone(),
        token: "wrong-token".to_string(),
    };
    let outcome = h.api.process_notification(auth, note_for(&session)).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::InvalidToken);
    assert_eq!(h.provider.check_calls(), 0);
    assert_eq!(h.orders.calls(), 0);
}

#[tokio::test]
async fn unknown_session_looks_like_a_bad_token_externally() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 100)).await.unwrap().session;
    let auth = NotificationAuth::CallbackToken {
        session_id: "ps_does_not_exist".parse().unwrap(),
        token: session.callback_token.clone(),
    };
    let mut note = note_for(&session);
    note.session_id = "ps_does_not_exist".parse().unwrap();
    let outcome = h.api.process_notification(auth, note).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::InvalidToken);
}

#[tokio::test]
async fn unpaid_invoice_leaves_the_session_pending() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 5000)).await.unwrap().session;
    // Provider not scripted: the invoice reads as unpaid.
    let outcome = h.api.process_notification(external_auth(&session), note_for(&session)).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::NotPaid);
    let stored = h.api.db().fetch_session(&session.session_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Pending);
    assert!(stored.last_check_at.is_some(), "the check must be stamped even when unpaid");
    assert_eq!(h.orders.calls(), 0);
}

#[tokio::test]
async fn amount_mismatch_is_held_and_never_creates_orders() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 5000)).await.unwrap().session;
    let invoice = session.invoice_id.clone().unwrap();
    // Paid, but 10 minor units short. Well outside tolerance.
    h.provider.set_paid(&invoice, MinorUnits::from(4990));
    let outcome = h.api.process_notification(external_auth(&session), note_for(&session)).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::AmountMismatch);
    assert_eq!(h.orders.calls(), 0);
    let stored = h.api.db().fetch_session(&session.session_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Pending);
    assert!(h.api.db().fetch_marker(&invoice).await.unwrap().is_none(), "no marker may exist for a held invoice");
}

#[tokio::test]
async fn amount_within_tolerance_is_accepted() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 5000)).await.unwrap().session;
    let invoice = session.invoice_id.clone().unwrap();
    // One minor unit of rounding slack is allowed.
    h.provider.set_paid(&invoice, MinorUnits::from(4999));
    let outcome = h.api.process_notification(external_auth(&session), note_for(&session)).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::OrderCreated { .. }));
}

#[tokio::test]
async fn amount_off_by_just_over_tolerance_is_held() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 5000)).await.unwrap().session;
    let invoice = session.invoice_id.clone().unwrap();
    // Two minor units is one past the allowed slack.
    h.provider.set_paid(&invoice, MinorUnits::from(4998));
    let outcome = h.api.process_notification(external_auth(&session), note_for(&session)).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::AmountMismatch);
    assert_eq!(h.orders.calls(), 0);
}

#[tokio::test]
async fn out_of_tolerance_recheck_downgrades_a_paid_session() {
    // Zero cache TTL, so every read sees the durable row.
    let url = random_db_path();
    prepare_test_env(&url).await;
    let db = SqliteDatabase::new_with_url(&url, 5).await.expect("Error creating database");
    let provider = MockProvider::new();
    let orders = MockOrderCreator::new();
    let config = ConfirmationApiConfig {
        session_ttl: std::time::Duration::ZERO,
        callback_base: "https://api.test".to_string(),
        token: TokenConfig::default(),
    };
    let api: TestApi = ConfirmationApi::new(MemoryCache::new(), db, provider.clone(), orders.clone(), config);

    let session = api.create_session(checkout("alice", 5000)).await.unwrap().session;
    let invoice = session.invoice_id.clone().unwrap();
    // An earlier check accepted the payment, but the provider now reports a settlement two
    // minor units off.
    api.db().mark_session_paid(&session.session_id, "pay_1").await.unwrap();
    provider.set_paid(&invoice, MinorUnits::from(4998));

    let outcome = api.process_notification(external_auth(&session), note_for(&session)).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::AmountMismatch);
    assert_eq!(orders.calls(), 0);
    // The session is pulled back to Pending so it cannot slide into order creation, and so
    // reconciliation keeps re-examining it.
    let stored = api.db().fetch_session(&session.session_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Pending);
}

#[tokio::test]
async fn provider_outage_is_reported_as_retryable() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 100)).await.unwrap().session;
    h.provider.fail_checks(true);
    let outcome = h.api.process_notification(external_auth(&session), note_for(&session)).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::PaymentCheckFailed);
    assert_eq!(h.orders.calls(), 0);
}

#[tokio::test]
async fn order_creation_failure_leaves_an_incomplete_marker() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 700)).await.unwrap().session;
    let invoice = session.invoice_id.clone().unwrap();
    h.provider.set_paid(&invoice, MinorUnits::from(700));
    h.orders.fail_next(true);

    let result = h.api.process_notification(external_auth(&session), note_for(&session)).await;
    assert!(matches!(result, Err(ConfirmationError::OrderCreation(_))));

    // The invoice stays claimed so nobody else can double-create, and the marker is incomplete
    // so reconciliation knows there is work left.
    let marker = h.api.db().fetch_marker(&invoice).await.unwrap().unwrap();
    assert!(marker.is_incomplete());

    // A retry delivery does not get a second shot at order creation.
    let retry = h.api.process_notification(external_auth(&session), note_for(&session)).await.unwrap();
    assert_eq!(retry, WebhookOutcome::Duplicate { order_ids: vec![] });
    assert_eq!(h.orders.calls(), 1);
}

#[tokio::test]
async fn duplicate_for_a_processed_invoice_wins_over_binding_checks() {
    let h = setup().await;
    let processed = h.api.create_session(checkout("alice", 400)).await.unwrap().session;
    let invoice = processed.invoice_id.clone().unwrap();
    h.provider.set_paid(&invoice, MinorUnits::from(400));
    let first = h.api.process_notification(external_auth(&processed), note_for(&processed)).await.unwrap();
    let WebhookOutcome::OrderCreated { order_ids } = first else {
        panic!("Expected OrderCreated, got {first:?}");
    };

    // A re-delivery that arrives addressed to a different session is still answered from the
    // ledger, ahead of any invoice-binding complaint.
    let other = h.api.create_session(checkout("alice", 900)).await.unwrap().session;
    let mut note = note_for(&other);
    note.invoice_id = Some(invoice.clone());
    let outcome = h.api.process_notification(external_auth(&other), note).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Duplicate { order_ids });
    assert_eq!(h.orders.calls(), 1);
}

#[tokio::test]
async fn mismatched_invoice_id_is_refused() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 100)).await.unwrap().session;
    let mut note = note_for(&session);
    note.invoice_id = Some("inv-someone-elses".parse().unwrap());
    let outcome = h.api.process_notification(external_auth(&session), note).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::InvoiceMismatch);
    assert_eq!(h.provider.check_calls(), 0);
}

#[tokio::test]
async fn owner_can_cancel_an_open_session() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 100)).await.unwrap().session;
    let cancelled = h.api.cancel_session(&session.session_id, "alice").await.unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());
}

#[tokio::test]
async fn cancellation_is_owner_only_and_open_only() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 100)).await.unwrap().session;
    let err = h.api.cancel_session(&session.session_id, "mallory").await.unwrap_err();
    assert!(matches!(err, ConfirmationError::NotOwner(_)));

    // Process the session, then try to cancel it.
    let invoice = session.invoice_id.clone().unwrap();
    h.provider.set_paid(&invoice, MinorUnits::from(100));
    h.api.process_notification(external_auth(&session), note_for(&session)).await.unwrap();
    let err = h.api.cancel_session(&session.session_id, "alice").await.unwrap_err();
    assert!(matches!(err, ConfirmationError::CancelForbidden { .. }));
}

#[tokio::test]
async fn verified_payment_on_a_cancelled_session_still_creates_orders() {
    // The user pressed "cancel" after paying. The money is real, so the orders are too.
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 300)).await.unwrap().session;
    h.api.cancel_session(&session.session_id, "alice").await.unwrap();
    let invoice = session.invoice_id.clone().unwrap();
    h.provider.set_paid(&invoice, MinorUnits::from(300));
    let outcome = h.api.process_notification(external_auth(&session), note_for(&session)).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::OrderCreated { .. }));
}

#[tokio::test]
async fn status_report_includes_order_ids_once_processed() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 100)).await.unwrap().session;
    let status = h.api.session_status(&session.session_id, "alice").await.unwrap();
    assert_eq!(status.status, SessionStatus::Pending);
    assert!(status.order_ids.is_empty());

    let invoice = session.invoice_id.clone().unwrap();
    h.provider.set_paid(&invoice, MinorUnits::from(100));
    h.api.process_notification(external_auth(&session), note_for(&session)).await.unwrap();

    let status = h.api.session_status(&session.session_id, "alice").await.unwrap();
    assert_eq!(status.status, SessionStatus::Processed);
    assert_eq!(status.order_ids, h.orders.created());

    let err = h.api.session_status(&session.session_id, "mallory").await.unwrap_err();
    assert!(matches!(err, ConfirmationError::NotOwner(_)));
}

#[tokio::test]
async fn every_notification_lands_in_the_audit_trail() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 100)).await.unwrap().session;
    let invoice_id = session.invoice_id.clone().unwrap();
    h.provider.set_paid(&invoice_id, MinorUnits::from(100));
    h.api.process_notification(external_auth(&session), note_for(&session)).await.unwrap();
    let auth = NotificationAuth::CallbackToken {
        session_id: session.session_id.clone(),
        token: "garbage".to_string(),
    };
    h.api.process_notification(auth, note_for(&session)).await.unwrap();

    let events = h.api.db().fetch_webhook_events(invoice_id.as_str()).await.unwrap();
    // Rejected notifications are audited too, with the disposition on each row.
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].outcome.as_deref(), Some("order_created"));
    assert_eq!(events[1].outcome.as_deref(), Some("invalid_token"));
}

#[tokio::test]
async fn status_updates_are_visible_to_immediate_reads() {
    let h = setup().await;
    let session = h.api.create_session(checkout("alice", 100)).await.unwrap().session;
    // The write goes out on one pool connection and the read-back may land on another; the
    // updated row must be visible as soon as the update call returns.
    for status in [SessionStatus::Paid, SessionStatus::Pending, SessionStatus::Cancelled] {
        let updated = h.api.db().update_session_status(&session.session_id, status).await.unwrap();
        assert_eq!(updated.status, status);
        let read_back = h.api.db().fetch_session(&session.session_id).await.unwrap().unwrap();
        assert_eq!(read_back.status, status);
    }
}
