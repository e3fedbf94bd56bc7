//! HTTP client for the upstream payment provider.
//!
//! [`ProviderApi`] implements the engine's `PaymentProvider` seam over the provider's REST API:
//! a client-credentials token endpoint, invoice creation and the payment-status check. Errors
//! are reported through the engine's `ProviderError` taxonomy.
mod api;
mod config;
mod data_objects;

pub use api::ProviderApi;
pub use config::ProviderConfig;
pub use data_objects::{AuthResponse, CreateInvoiceRequest, InvoiceResponse, PaymentStatusResponse};
