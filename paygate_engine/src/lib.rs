//! Paygate Engine
//!
//! The core logic of the payment confirmation service: idempotent webhook processing, the
//! reconciliation safety net, provider token caching and the background cleanup sweep. The
//! engine is transport-agnostic; the HTTP surface lives in the `paygate_server` crate.
//!
//! The library is divided into three main sections:
//! 1. The collaborator seams ([`mod@traits`]): the shared cache, the durable store, the payment
//!    provider and the order service. Concrete backends live in [`mod@cache`] (redis and
//!    in-process) and the SQLite module; the provider lives in the `provider_client` crate.
//! 2. The confirmation flow ([`mod@confirmation`]): checkout, webhook processing,
//!    reconciliation and cancellation, all built around the processed-invoice marker that
//!    guarantees at-most-once order materialization per invoice.
//! 3. The background workers ([`mod@reconcile`] and [`mod@cleanup`]), which run under
//!    cache-backed locks so that one instance sweeps at a time.
mod sqlite;

pub mod cache;
pub mod cleanup;
pub mod confirmation;
pub mod db_types;
pub mod helpers;
pub mod lock;
pub mod reconcile;
mod session_store;
pub mod token;
pub mod traits;

#[cfg(any(feature = "test_utils", test))]
pub mod test_utils;

pub use confirmation::{
    CheckoutResult,
    ConfirmationApi,
    ConfirmationApiConfig,
    ConfirmationError,
    NotificationAuth,
    PaymentNotification,
    ReconcileAction,
    ReconcileStats,
    SessionStatusResult,
    WebhookOutcome,
    AMOUNT_TOLERANCE,
};
pub use session_store::SessionStore;
pub use sqlite::SqliteDatabase;
pub use token::{CachedToken, TokenConfig, TokenError, TokenManager};
