//! # Paygate server
//! This crate hosts the HTTP surface of the payment gateway. It is responsible for:
//! Accepting checkout requests and minting provider invoices for them.
//! Listening for incoming payment notifications, on the public callback channel and on the
//! whitelisted internal channel.
//! Answering session status and cancellation requests.
//! Running the background reconciliation and cleanup workers.
//!
//! ## Configuration
//! The server is configured via environment variables. See [config](config/index.html) for more information.
//!
//! ## Routes
//! The server exposes the following routes:
//! * `/health`: A health check route that returns a 200 OK response.
//! * `/checkout`: Creates a payment session and returns the provider's payment URL.
//! * `/callback/payment`: The provider-facing payment notification channel, authenticated with
//!   the per-session callback token.
//! * `/incoming/payment-notification`: The internal notification channel, gated on the IP whitelist.
//! * `/status/{session_id}` and `/cancel/{session_id}`: Session queries for the owning user.

pub mod config;
pub mod data_objects;
pub mod errors;
pub mod integrations;
pub mod routes;
pub mod server;
