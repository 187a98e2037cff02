//! Protocol clients and the value objects they exchange with the broker.
//!
//! Every target in the routing configuration is served by one
//! [`ProtocolClient`]. Clients publish [`ProtocolMessage`]s built by their
//! protocol's [`factory::ProtocolFactory`]; clients whose transport can
//! deliver inbound data also expose [`Subscribable`] and accept
//! [`ProtocolSubscription`]s.
//!
//! | protocol | client | subscribe |
//! |---|---|---|
//! | `mqtt` | [`mqtt::MqttClient`] | yes |
//! | `s3` | [`s3::S3Client`] | no |
//! | `gpio` | [`gpio::GpioClient`] | no |
//! | `file` | [`file::FileClient`] | no |

pub mod credentials;
pub mod factory;
pub mod file;
pub mod gpio;
pub mod mqtt;
pub mod s3;
pub mod subscriptions;

use std::sync::Arc;

use tracing::warn;

use crate::payload::Payload;
use crate::queue::JobQueue;
use crate::utils::{BrokerError, Result};

pub use subscriptions::{HandlerId, SubscriptionTable, Transition};

/// Protocol-specific publish request built from a payload and a
/// destination's message options.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    Mqtt(mqtt::MqttMessage),
    S3(s3::S3Message),
    Gpio(gpio::GpioMessage),
    File(file::FileMessage),
}

impl ProtocolMessage {
    pub fn protocol(&self) -> &'static str {
        match self {
            ProtocolMessage::Mqtt(_) => mqtt::PROTOCOL,
            ProtocolMessage::S3(_) => s3::PROTOCOL,
            ProtocolMessage::Gpio(_) => gpio::PROTOCOL,
            ProtocolMessage::File(_) => file::PROTOCOL,
        }
    }

    pub fn payload(&self) -> &Payload {
        match self {
            ProtocolMessage::Mqtt(m) => &m.payload,
            ProtocolMessage::S3(m) => &m.payload,
            ProtocolMessage::Gpio(m) => &m.payload,
            ProtocolMessage::File(m) => &m.payload,
        }
    }

    pub(crate) fn mismatch(&self, expected: &'static str) -> BrokerError {
        BrokerError::NoMatchingInterface {
            expected,
            actual: self.protocol(),
        }
    }
}

/// Protocol-specific subscription request.
///
/// Two subscriptions share one transport subscription when their
/// [`key`](Self::key)s are equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolSubscription {
    Mqtt(mqtt::MqttSubscription),
}

impl ProtocolSubscription {
    pub fn protocol(&self) -> &'static str {
        match self {
            ProtocolSubscription::Mqtt(_) => mqtt::PROTOCOL,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            ProtocolSubscription::Mqtt(s) => &s.topic,
        }
    }
}

/// Receives inbound payloads. `source` is the subscription key the data
/// arrived on (the MQTT topic at client level, the target name at broker
/// level).
pub trait SubscriptionHandler: Send + Sync {
    fn on_message(&self, source: &str, payload: &Payload);
}

impl<F> SubscriptionHandler for F
where
    F: Fn(&str, &Payload) + Send + Sync,
{
    fn on_message(&self, source: &str, payload: &Payload) {
        self(source, payload)
    }
}

/// Completion callback of [`ProtocolClient::publish_async`], fired from the
/// client's queue worker.
pub trait PublishHandler: Send + Sync {
    fn on_message_published(&self, protocol: &str, message: &ProtocolMessage, success: bool);
}

impl<F> PublishHandler for F
where
    F: Fn(&str, &ProtocolMessage, bool) + Send + Sync,
{
    fn on_message_published(&self, protocol: &str, message: &ProtocolMessage, success: bool) {
        self(protocol, message, success)
    }
}

/// Subscription capability, implemented only by clients whose transport can
/// deliver inbound data.
pub trait Subscribable: Send + Sync {
    /// Registers `handler` for `subscription`. The transport subscribes only
    /// when this is the first local subscriber for the subscription key.
    fn subscribe(
        &self,
        subscription: &ProtocolSubscription,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<HandlerId>;

    /// Removes a registration. The transport unsubscribes when the last local
    /// subscriber for the key goes away. Unknown ids are ignored.
    fn unsubscribe(&self, id: HandlerId) -> Result<()>;
}

/// A live client owning one target's transport.
pub trait ProtocolClient: Send + Sync {
    fn protocol(&self) -> &'static str;

    /// Sends `message` and blocks until the transport acknowledges or fails.
    fn publish(&self, message: &ProtocolMessage) -> Result<()>;

    /// Queues `message` on the client's worker; `handler` fires once with the
    /// outcome.
    fn publish_async(&self, message: ProtocolMessage, handler: Arc<dyn PublishHandler>);

    /// Rebuilds the transport connection. Connectionless protocols do nothing.
    fn reconnect(&self) -> Result<()> {
        Ok(())
    }

    fn subscriber(&self) -> Option<&dyn Subscribable> {
        None
    }

    fn subscribe(
        &self,
        subscription: &ProtocolSubscription,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<HandlerId> {
        self.subscriber()
            .ok_or_else(|| BrokerError::not_implemented(self.protocol(), "subscribe"))?
            .subscribe(subscription, handler)
    }

    fn unsubscribe(&self, id: HandlerId) -> Result<()> {
        self.subscriber()
            .ok_or_else(|| BrokerError::not_implemented(self.protocol(), "unsubscribe"))?
            .unsubscribe(id)
    }
}

/// Job queue item shared by the clients' asynchronous publish paths.
pub(crate) type PublishJob = (ProtocolMessage, Arc<dyn PublishHandler>);

/// Builds the (not yet started) job queue for a client whose synchronous
/// publish is reachable through `publish`.
pub(crate) fn publish_queue<F>(name: &str, publish: F) -> JobQueue<PublishJob, bool>
where
    F: Fn(&ProtocolMessage) -> Result<()> + Send + Sync + 'static,
{
    let queue_name = name.to_string();
    JobQueue::new(name, move |(message, _): &PublishJob| {
        match publish(message) {
            Ok(()) => true,
            Err(e) => {
                warn!("Async publish on {queue_name} failed: {e}");
                false
            }
        }
    })
    .on_discard(|_| false)
}

/// Enqueues an async publish, reporting failure right away if the queue no
/// longer accepts work.
pub(crate) fn enqueue_publish(
    queue: &JobQueue<PublishJob, bool>,
    protocol: &'static str,
    message: ProtocolMessage,
    handler: Arc<dyn PublishHandler>,
) {
    let completion = move |(message, handler): PublishJob, success: bool| {
        handler.on_message_published(protocol, &message, success);
    };
    if let Err((message, handler)) = queue.enqueue((message, handler), completion) {
        warn!("Async publish on stopped {protocol} queue {}", queue.name());
        handler.on_message_published(protocol, &message, false);
    }
}
