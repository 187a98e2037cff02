//! # edge-broker
//!
//! `edge-broker` is an embeddable message broker for edge devices. An
//! application publishes payloads under logical message ids; a JSON routing
//! configuration decides which targets (MQTT brokers, object-storage buckets,
//! GPIO pins, local files) receive them. Inbound MQTT data is delivered back to
//! the application through subscriptions keyed by logical subscription ids.
//!
//! ## Core Modules
//!
//! - `broker`: The façade that owns one protocol client per target and routes payloads.
//! - `config`: Broker settings and the routing configuration model.
//! - `payload`: The raw-or-batch payload, its wire form and `${...}` macro expansion.
//! - `protocol`: Protocol clients, their factories and the transport seams.
//! - `queue`: The single-worker job queue behind every asynchronous publish.
//! - `utils`: Shared utilities, such as error handling and logging setup.

pub mod broker;
pub mod config;
pub mod payload;
pub mod protocol;
pub mod queue;
pub mod utils;

pub use broker::{Broker, PublishCallback, SubscriptionToken};
pub use payload::Payload;
pub use utils::{BrokerError, Result};

#[cfg(test)]
mod tests;
