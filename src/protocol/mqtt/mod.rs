//! MQTT protocol: options, message and subscription types, and the factory.
//!
//! The connection state machine lives in [`client`]; the library binding in
//! [`transport`].

mod backoff;
mod client;
pub mod transport;

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use super::credentials::CredentialProvider;
use super::factory::{ProtocolFactory, parse_options};
use super::{ProtocolClient, ProtocolMessage, ProtocolSubscription};
use crate::config::MqttSettings;
use crate::payload::Payload;
use crate::utils::{BrokerError, Result};

pub use backoff::Backoff;
pub use client::{ConnectionState, MqttClient};
pub use transport::{MqttSession, MqttTransport, RumqttTransport};

pub const PROTOCOL: &str = "mqtt";

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

/// `mqtt_options` of a target.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttTargetOptions {
    pub endpoint: String,
    pub region: String,
    #[serde(default, rename = "client-id")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub keep_alive_secs: Option<u64>,
}

/// `mqtt_message_options` of a destination.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttMessageOptions {
    pub topic: String,
    #[serde(default)]
    pub retain: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct MqttSubscriptionOptions {
    topic: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttMessage {
    /// Topic after macro expansion.
    pub topic: String,
    pub retain: bool,
    pub payload: Payload,
}

/// Subscriptions are equal, and share one transport subscription, when their
/// topics are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MqttSubscription {
    pub topic: String,
}

impl MqttSubscription {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Endpoint {
    /// Accepts `host`, `host:port`, `mqtt://host[:port]` and
    /// `mqtts://host[:port]`. A bare endpoint on port 8883 uses TLS.
    pub fn parse(endpoint: &str) -> Result<Self> {
        let endpoint = endpoint.trim();
        let (scheme_tls, rest) = if let Some(rest) = endpoint.strip_prefix("mqtts://") {
            (Some(true), rest)
        } else if let Some(rest) = endpoint.strip_prefix("mqtt://") {
            (Some(false), rest)
        } else if endpoint.contains("://") {
            return Err(BrokerError::config(format!(
                "unsupported mqtt endpoint scheme: {endpoint}"
            )));
        } else {
            (None, endpoint)
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| BrokerError::config(format!("invalid mqtt endpoint port: {endpoint}")))?;
                (host, Some(port))
            }
            None => (rest, None),
        };
        if host.is_empty() {
            return Err(BrokerError::config("mqtt endpoint has no host"));
        }

        let (tls, port) = match (scheme_tls, port) {
            (Some(true), port) => (true, port.unwrap_or(DEFAULT_TLS_PORT)),
            (Some(false), port) => (false, port.unwrap_or(DEFAULT_PORT)),
            (None, Some(port)) => (port == DEFAULT_TLS_PORT, port),
            (None, None) => (false, DEFAULT_PORT),
        };
        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "mqtts" } else { "mqtt" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

fn parse_target_options(options: &Value) -> Result<(MqttTargetOptions, Endpoint)> {
    let options: MqttTargetOptions = parse_options(PROTOCOL, "options", options)?;
    if options.region.trim().is_empty() {
        return Err(BrokerError::config("mqtt options: region must not be empty"));
    }
    if matches!(&options.client_id, Some(id) if id.trim().is_empty()) {
        return Err(BrokerError::config("mqtt options: client-id must not be empty"));
    }
    let endpoint = Endpoint::parse(&options.endpoint)?;
    Ok((options, endpoint))
}

fn parse_message_options(options: &Value) -> Result<MqttMessageOptions> {
    let options: MqttMessageOptions = parse_options(PROTOCOL, "message options", options)?;
    if options.topic.is_empty() {
        return Err(BrokerError::config("mqtt message options: topic must not be empty"));
    }
    Ok(options)
}

fn parse_subscription_options(options: &Value) -> Result<MqttSubscriptionOptions> {
    let options: MqttSubscriptionOptions = parse_options(PROTOCOL, "subscription", options)?;
    if options.topic.is_empty() {
        return Err(BrokerError::config("mqtt subscription: topic must not be empty"));
    }
    Ok(options)
}

pub struct MqttFactory {
    settings: MqttSettings,
    transport: Arc<dyn MqttTransport>,
}

impl MqttFactory {
    pub fn new(settings: MqttSettings) -> Self {
        Self::with_transport(settings, Arc::new(RumqttTransport))
    }

    pub fn with_transport(settings: MqttSettings, transport: Arc<dyn MqttTransport>) -> Self {
        Self {
            settings,
            transport,
        }
    }
}

impl ProtocolFactory for MqttFactory {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn validate_options(&self, options: &Value) -> Result<()> {
        parse_target_options(options).map(|_| ())
    }

    fn validate_message_options(&self, options: &Value) -> Result<()> {
        parse_message_options(options).map(|_| ())
    }

    fn validate_subscription_options(&self, options: &Value) -> Result<()> {
        parse_subscription_options(options).map(|_| ())
    }

    fn create_client(
        &self,
        options: &Value,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Arc<dyn ProtocolClient>> {
        let (options, endpoint) = parse_target_options(options)?;
        let client = MqttClient::connect(
            &options,
            endpoint,
            self.settings.clone(),
            credentials,
            Arc::clone(&self.transport),
        )?;
        Ok(Arc::new(client))
    }

    fn create_message(&self, payload: &Payload, options: &Value) -> Result<ProtocolMessage> {
        let options = parse_message_options(options)?;
        Ok(ProtocolMessage::Mqtt(MqttMessage {
            topic: payload.expand(&options.topic),
            retain: options.retain,
            payload: payload.clone(),
        }))
    }

    fn create_subscription(&self, options: &Value) -> Result<ProtocolSubscription> {
        let options = parse_subscription_options(options)?;
        Ok(ProtocolSubscription::Mqtt(MqttSubscription::new(options.topic)))
    }
}

#[cfg(test)]
mod tests;
