//! # Engine interface contracts.
//!
//! This module defines the seams between the confirmation engine and its collaborators:
//!
//! * [`SharedCache`] is the low-latency key-value store used for the session fast path, the
//!   distributed lock primitive and the provider token cache. It must offer an atomic
//!   "set-if-absent with expiry".
//! * [`PaymentStore`] is the durable system-of-record that survives cache eviction: payment
//!   sessions, the processed-invoice dedup ledger and the webhook audit trail.
//! * [`PaymentProvider`] wraps the upstream provider's authentication, invoice-creation and
//!   payment-check calls. It is the source of truth for "is this invoice actually paid".
//! * [`OrderCreator`] is the external order-materialization collaborator. It is only invoked
//!   while the caller holds the processed-invoice exclusivity guarantee.
mod order_creator;
mod payment_store;
mod provider;
mod shared_cache;

pub use order_creator::{OrderCreationError, OrderCreator};
pub use payment_store::{
    CleanupTotals,
    InsertMarkerResult,
    PaymentStore,
    PaymentStoreError,
    ReconciliationFilter,
};
pub use provider::{FreshToken, InvoiceRequest, NewInvoice, PaymentCheck, PaymentProvider, ProviderError};
pub use shared_cache::{CacheError, SharedCache};
