//! Protocol factories and the static name → factory registry.
//!
//! A factory validates the JSON option objects of its protocol and builds
//! clients, messages and subscriptions from them. Validation never touches the
//! network, so a broker can reject a bad configuration before any connection
//! is attempted.

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::credentials::CredentialProvider;
use super::{ProtocolClient, ProtocolMessage, ProtocolSubscription};
use super::{file, gpio, mqtt, s3};
use crate::config::{Settings, settings};
use crate::payload::Payload;
use crate::utils::{BrokerError, Result};

pub trait ProtocolFactory: Send + Sync {
    /// Protocol name as it appears in the routing configuration.
    fn protocol(&self) -> &'static str;

    /// Checks `<protocol>_options` of a target.
    fn validate_options(&self, options: &Value) -> Result<()>;

    /// Checks `<protocol>_message_options` of a destination.
    fn validate_message_options(&self, options: &Value) -> Result<()>;

    /// Checks one `<protocol>_subscriptions` entry.
    fn validate_subscription_options(&self, _options: &Value) -> Result<()> {
        Err(BrokerError::not_implemented(self.protocol(), "subscribe"))
    }

    fn create_client(
        &self,
        options: &Value,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Arc<dyn ProtocolClient>>;

    fn create_message(&self, payload: &Payload, options: &Value) -> Result<ProtocolMessage>;

    fn create_subscription(&self, _options: &Value) -> Result<ProtocolSubscription> {
        Err(BrokerError::not_implemented(self.protocol(), "subscribe"))
    }
}

/// Deserializes a protocol option object, mapping failures to configuration
/// errors that name the protocol and option kind.
pub(crate) fn parse_options<T: DeserializeOwned>(
    protocol: &str,
    kind: &str,
    options: &Value,
) -> Result<T> {
    serde_json::from_value(options.clone())
        .map_err(|e| BrokerError::config(format!("invalid {protocol} {kind}: {e}")))
}

/// Protocol name → factory map, queried by the broker.
#[derive(Clone, Default)]
pub struct FactoryRegistry {
    factories: HashMap<String, Arc<dyn ProtocolFactory>>,
}

impl FactoryRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in `mqtt`, `s3`, `gpio` and `file` factories.
    pub fn with_defaults(settings: &Settings) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(mqtt::MqttFactory::new(settings.mqtt.clone())));
        registry.register(Arc::new(s3::S3Factory::new()));
        registry.register(Arc::new(gpio::GpioFactory::new()));
        registry.register(Arc::new(file::FileFactory::new()));
        registry
    }

    /// Adds or replaces the factory for its protocol name.
    pub fn register(&mut self, factory: Arc<dyn ProtocolFactory>) {
        self.factories
            .insert(factory.protocol().to_string(), factory);
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn ProtocolFactory>> {
        self.factories.get(protocol).cloned()
    }

    pub fn require(&self, protocol: &str) -> Result<Arc<dyn ProtocolFactory>> {
        self.get(protocol)
            .ok_or_else(|| BrokerError::UnknownProtocol(protocol.to_string()))
    }

    pub fn protocols(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

lazy_static! {
    static ref DEFAULT_REGISTRY: Arc<FactoryRegistry> =
        Arc::new(FactoryRegistry::with_defaults(settings()));
}

/// The process-wide registry used by brokers created without an explicit one.
pub fn default_registry() -> Arc<FactoryRegistry> {
    Arc::clone(&DEFAULT_REGISTRY)
}
