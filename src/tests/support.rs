//! Fakes for the transport seams, shared by the cross-module tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::Settings;
use crate::payload::Payload;
use crate::protocol::credentials::StaticCredentialProvider;
use crate::protocol::factory::FactoryRegistry;
use crate::protocol::file::FileFactory;
use crate::protocol::mqtt::transport::{Ack, ConnectSettings, EventSink, SessionEvent};
use crate::protocol::mqtt::{MqttFactory, MqttSession, MqttTransport};
use crate::protocol::s3::{ObjectStore, S3Factory};
use crate::broker::Broker;
use crate::utils::{BrokerError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum MqttOp {
    Connect(String),
    Publish(String, Vec<u8>),
    Subscribe(String),
    Unsubscribe(String),
    Disconnect,
}

/// Accepts every connection and acknowledges every request at once.
#[derive(Default)]
pub struct FakeMqtt {
    pub ops: Mutex<Vec<MqttOp>>,
    /// Topics whose subscribe requests are rejected by the broker.
    pub refused_topics: Mutex<Vec<String>>,
    sinks: Mutex<Vec<EventSink>>,
}

impl FakeMqtt {
    pub fn count(&self, op: &MqttOp) -> usize {
        self.ops.lock().iter().filter(|o| *o == op).count()
    }

    pub fn publishes(&self) -> Vec<(String, Payload)> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                MqttOp::Publish(topic, bytes) => {
                    Some((topic.clone(), Payload::from_wire(bytes).ok()?))
                }
                _ => None,
            })
            .collect()
    }

    /// Delivers an inbound message on every session opened so far.
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        let sinks = self.sinks.lock().clone();
        for sink in sinks {
            sink(SessionEvent::Message {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            });
        }
    }
}

pub struct FakeMqttTransport(pub Arc<FakeMqtt>);

impl MqttTransport for FakeMqttTransport {
    fn connect(&self, settings: &ConnectSettings, events: EventSink) -> Result<Box<dyn MqttSession>> {
        self.0.ops.lock().push(MqttOp::Connect(settings.client_id.clone()));
        self.0.sinks.lock().push(Arc::clone(&events));
        events(SessionEvent::Connected);
        Ok(Box::new(FakeMqttSession(Arc::clone(&self.0))))
    }
}

struct FakeMqttSession(Arc<FakeMqtt>);

impl MqttSession for FakeMqttSession {
    fn publish(&self, topic: &str, payload: Vec<u8>, _retain: bool) -> Result<Ack> {
        self.0.ops.lock().push(MqttOp::Publish(topic.to_string(), payload));
        Ok(Ack::completed(Ok(())))
    }

    fn subscribe(&self, topic: &str) -> Result<Ack> {
        self.0.ops.lock().push(MqttOp::Subscribe(topic.to_string()));
        if self.0.refused_topics.lock().iter().any(|t| t == topic) {
            return Ok(Ack::completed(Err(BrokerError::transport(format!(
                "subscription to {topic} rejected"
            )))));
        }
        Ok(Ack::completed(Ok(())))
    }

    fn unsubscribe(&self, topic: &str) -> Result<Ack> {
        self.0.ops.lock().push(MqttOp::Unsubscribe(topic.to_string()));
        Ok(Ack::completed(Ok(())))
    }

    fn disconnect(&self, _timeout: Duration) {
        self.0.ops.lock().push(MqttOp::Disconnect);
    }
}

/// In-memory object store keeping every upload in order.
#[derive(Default)]
pub struct MemoryStore {
    pub uploads: Mutex<Vec<(String, String, Vec<u8>)>>,
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl ObjectStore for MemoryStore {
    fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self
            .objects
            .lock()
            .contains_key(&(bucket.to_string(), key.to_string())))
    }

    fn put(&self, bucket: &str, key: &str, body: &[u8], _content_type: &str) -> Result<()> {
        self.objects
            .lock()
            .insert((bucket.to_string(), key.to_string()), body.to_vec());
        self.uploads
            .lock()
            .push((bucket.to_string(), key.to_string(), body.to_vec()));
        Ok(())
    }
}

pub struct Harness {
    pub mqtt: Arc<FakeMqtt>,
    pub store: Arc<MemoryStore>,
    pub registry: Arc<FactoryRegistry>,
}

impl Harness {
    /// Registry whose `mqtt` and `s3` factories talk to fakes; `file` is real.
    pub fn new() -> Self {
        let mqtt = Arc::new(FakeMqtt::default());
        let store = Arc::new(MemoryStore::default());
        let mut registry = FactoryRegistry::empty();
        registry.register(Arc::new(MqttFactory::with_transport(
            Settings::default().mqtt,
            Arc::new(FakeMqttTransport(Arc::clone(&mqtt))),
        )));
        registry.register(Arc::new(S3Factory::with_store(
            Arc::clone(&store) as Arc<dyn ObjectStore>
        )));
        registry.register(Arc::new(FileFactory::new()));
        Self {
            mqtt,
            store,
            registry: Arc::new(registry),
        }
    }

    pub fn broker(&self, json: &str) -> Result<Broker> {
        Broker::from_config(
            json,
            Arc::clone(&self.registry),
            Arc::new(StaticCredentialProvider::anonymous()),
        )
    }

    pub fn uploads(&self) -> Vec<(String, String, Vec<u8>)> {
        self.store.uploads.lock().clone()
    }
}

pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Handler that records `(source, payload)` pairs.
pub fn recorder() -> (
    Arc<Mutex<Vec<(String, Payload)>>>,
    Arc<dyn crate::protocol::SubscriptionHandler>,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler: Arc<dyn crate::protocol::SubscriptionHandler> =
        Arc::new(move |source: &str, payload: &Payload| {
            sink.lock().push((source.to_string(), payload.clone()));
        });
    (seen, handler)
}
