//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `edge_broker` crate.
//!
//! It centralizes the crate-wide error type and the logging bootstrap so every
//! protocol and the broker façade report failures and events the same way.

pub mod error;
pub mod logging;

pub use error::{BrokerError, Result};
