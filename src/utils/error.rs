//! The `error` module defines the error taxonomy shared by the broker façade,
//! the protocol factories and the protocol clients.
//!
//! Configuration errors are raised while validating JSON, before any network
//! resource is touched. Transport errors and timeouts come from the clients.
//! Interface mismatches and unsupported operations are kept as their own
//! variants so callers never confuse them with a failed send.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed or incomplete configuration / message options.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connect, publish, subscribe or unsubscribe failed on the transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// An acknowledgement did not arrive in time. The remote side may still
    /// have applied the operation.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// A protocol client was handed a message built for another protocol.
    #[error("no matching interface: expected {expected} message, got {actual}")]
    NoMatchingInterface {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("{operation} is not implemented for protocol {protocol}")]
    NotImplemented {
        protocol: String,
        operation: &'static str,
    },

    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("broker is not initialized")]
    NotInitialized,

    /// Broker-level publish where at least one destination failed.
    #[error("publish failed for destinations: {}", .0.join(", "))]
    PublishFailed(Vec<String>),

    #[error("job queue {0} is stopped")]
    QueueStopped(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Settings(#[from] config::ConfigError),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Gpio(#[from] rppal::gpio::Error),
}

impl BrokerError {
    pub fn config(msg: impl Into<String>) -> Self {
        BrokerError::Config(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        BrokerError::Transport(msg.into())
    }

    pub fn not_implemented(protocol: &str, operation: &'static str) -> Self {
        BrokerError::NotImplemented {
            protocol: protocol.to_string(),
            operation,
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
