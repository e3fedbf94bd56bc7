//! Utility functions for use in tests.

pub mod mocks;
mod prepare_env;

pub use prepare_env::*;
