use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Value, json};

use super::transport::{Ack, AckBook, AckKind, AckSender, ConnectSettings, EventSink, SessionEvent};
use super::*;
use crate::config::Settings;
use crate::protocol::credentials::{Credentials, StaticCredentialProvider};
use crate::protocol::file::FileMessage;
use crate::protocol::{HandlerId, PublishHandler, SubscriptionHandler};

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Connect(String),
    Publish(String, Vec<u8>),
    Subscribe(String),
    Unsubscribe(String),
    Disconnect,
}

#[derive(Default)]
struct FakeBroker {
    ops: Mutex<Vec<Op>>,
    sinks: Mutex<Vec<EventSink>>,
    refuse_connects: AtomicUsize,
    hold_unsubscribe_acks: AtomicBool,
    held: Mutex<Vec<AckSender>>,
    /// Sessions the broker has hung up on; publishing on them fails.
    dead: Mutex<HashSet<usize>>,
}

impl FakeBroker {
    fn ops(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }

    fn count(&self, pred: impl Fn(&Op) -> bool) -> usize {
        self.ops.lock().iter().filter(|op| pred(op)).count()
    }

    fn connects(&self) -> usize {
        self.count(|op| matches!(op, Op::Connect(_)))
    }

    fn subscribes(&self, topic: &str) -> usize {
        self.count(|op| *op == Op::Subscribe(topic.to_string()))
    }

    fn unsubscribes(&self, topic: &str) -> usize {
        self.count(|op| *op == Op::Unsubscribe(topic.to_string()))
    }

    fn session_sink(&self, index: usize) -> EventSink {
        Arc::clone(&self.sinks.lock()[index])
    }

    fn latest_sink(&self) -> EventSink {
        let sinks = self.sinks.lock();
        Arc::clone(sinks.last().expect("connected at least once"))
    }

    /// Hangs up on session `index` and reports it the way the I/O thread does.
    fn interrupt(&self, index: usize, reason: &str) {
        self.dead.lock().insert(index);
        (self.session_sink(index))(SessionEvent::Interrupted(reason.into()));
    }

    fn release_held_acks(&self) {
        for ack in self.held.lock().drain(..) {
            let _ = ack.send(Ok(()));
        }
    }

    fn deliver(&self, topic: &str, payload: &Payload) {
        (self.latest_sink())(SessionEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_wire().unwrap(),
        });
    }
}

struct FakeTransport(Arc<FakeBroker>);

impl MqttTransport for FakeTransport {
    fn connect(&self, settings: &ConnectSettings, events: EventSink) -> Result<Box<dyn MqttSession>> {
        self.0
            .ops
            .lock()
            .push(Op::Connect(settings.credentials.access_key_id.clone()));
        let index = {
            let mut sinks = self.0.sinks.lock();
            sinks.push(Arc::clone(&events));
            sinks.len() - 1
        };
        let refused = self
            .0
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            events(SessionEvent::ConnectFailed("connection refused".into()));
        } else {
            events(SessionEvent::Connected);
        }
        Ok(Box::new(FakeSession(Arc::clone(&self.0), index)))
    }
}

struct FakeSession(Arc<FakeBroker>, usize);

impl MqttSession for FakeSession {
    fn publish(&self, topic: &str, payload: Vec<u8>, _retain: bool) -> Result<Ack> {
        if self.0.dead.lock().contains(&self.1) {
            return Err(BrokerError::transport(format!("session {} is closed", self.1)));
        }
        self.0.ops.lock().push(Op::Publish(topic.to_string(), payload));
        Ok(Ack::completed(Ok(())))
    }

    fn subscribe(&self, topic: &str) -> Result<Ack> {
        self.0.ops.lock().push(Op::Subscribe(topic.to_string()));
        Ok(Ack::completed(Ok(())))
    }

    fn unsubscribe(&self, topic: &str) -> Result<Ack> {
        self.0.ops.lock().push(Op::Unsubscribe(topic.to_string()));
        if self.0.hold_unsubscribe_acks.load(Ordering::SeqCst) {
            let (tx, ack) = Ack::channel();
            self.0.held.lock().push(tx);
            return Ok(ack);
        }
        Ok(Ack::completed(Ok(())))
    }

    fn disconnect(&self, _timeout: Duration) {
        self.0.ops.lock().push(Op::Disconnect);
    }
}

/// Hands out `key-1`, `key-2`, ... on successive calls.
#[derive(Default)]
struct RotatingCredentials(AtomicUsize);

impl CredentialProvider for RotatingCredentials {
    fn credentials(&self) -> Result<Credentials> {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Credentials {
            access_key_id: format!("key-{n}"),
            secret_access_key: "secret".into(),
            ..Credentials::default()
        })
    }
}

fn test_settings() -> MqttSettings {
    MqttSettings {
        connect_timeout_ms: 500,
        operation_timeout_ms: 500,
        unsubscribe_timeout_ms: 100,
        keep_alive_secs: 30,
        backoff_initial_ms: 10,
        backoff_max_ms: 40,
        refresh_interval_secs: 3600,
    }
}

fn target_options() -> Value {
    json!({"endpoint": "mqtt://localhost", "region": "us-west-2", "client-id": "test-device"})
}

fn factory(broker: &Arc<FakeBroker>) -> MqttFactory {
    MqttFactory::with_transport(test_settings(), Arc::new(FakeTransport(Arc::clone(broker))))
}

fn connect(broker: &Arc<FakeBroker>) -> Arc<dyn ProtocolClient> {
    factory(broker)
        .create_client(&target_options(), Arc::new(StaticCredentialProvider::anonymous()))
        .unwrap()
}

/// Builds the concrete client so tests can inspect its connection state.
fn connect_client(
    broker: &Arc<FakeBroker>,
    settings: MqttSettings,
    credentials: Arc<dyn CredentialProvider>,
) -> MqttClient {
    let (options, endpoint) = parse_target_options(&target_options()).unwrap();
    MqttClient::connect(
        &options,
        endpoint,
        settings,
        credentials,
        Arc::new(FakeTransport(Arc::clone(broker))),
    )
    .unwrap()
}

fn mqtt_message(topic: &str, text: &str) -> ProtocolMessage {
    ProtocolMessage::Mqtt(MqttMessage {
        topic: topic.into(),
        retain: false,
        payload: Payload::new(text),
    })
}

/// Publish handler recording `(payload text, success)` in completion order.
fn outcomes() -> (Arc<Mutex<Vec<(String, bool)>>>, Arc<dyn PublishHandler>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler: Arc<dyn PublishHandler> =
        Arc::new(move |_: &str, message: &ProtocolMessage, success: bool| {
            let text = String::from_utf8(message.payload().data().unwrap().to_vec()).unwrap();
            sink.lock().push((text, success));
        });
    (seen, handler)
}

fn topic(name: &str) -> ProtocolSubscription {
    ProtocolSubscription::Mqtt(MqttSubscription::new(name))
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn collector() -> (Arc<Mutex<Vec<(String, Payload)>>>, Arc<dyn SubscriptionHandler>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler: Arc<dyn SubscriptionHandler> = Arc::new(move |source: &str, payload: &Payload| {
        sink.lock().push((source.to_string(), payload.clone()));
    });
    (seen, handler)
}

#[test]
fn test_endpoint_forms() {
    let plain = Endpoint::parse("broker.local").unwrap();
    assert_eq!((plain.host.as_str(), plain.port, plain.tls), ("broker.local", 1883, false));

    let tls = Endpoint::parse("mqtts://iot.example.com").unwrap();
    assert_eq!((tls.port, tls.tls), (8883, true));

    let bare_tls = Endpoint::parse("iot.example.com:8883").unwrap();
    assert!(bare_tls.tls);

    let custom = Endpoint::parse("mqtt://10.0.0.5:1884/").unwrap();
    assert_eq!((custom.host.as_str(), custom.port, custom.tls), ("10.0.0.5", 1884, false));
    assert_eq!(custom.to_string(), "mqtt://10.0.0.5:1884");

    assert!(Endpoint::parse("ws://broker").is_err());
    assert!(Endpoint::parse("broker:notaport").is_err());
    assert!(Endpoint::parse("mqtt://:1883").is_err());
}

#[test]
fn test_backoff_doubles_to_ceiling_and_resets() {
    let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(16));
    let delays: Vec<f64> = (0..9).map(|_| backoff.next_delay().as_secs_f64()).collect();
    assert_eq!(delays, vec![0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 16.0, 16.0]);

    backoff.reset();
    assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    assert_eq!(backoff.peek(), Duration::from_millis(500));
}

#[test]
fn test_backoff_uses_configured_defaults() {
    let settings = Settings::default().mqtt;
    let mut backoff = Backoff::new(settings.backoff_initial(), settings.backoff_max());
    assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    for _ in 0..20 {
        assert!(backoff.next_delay() <= Duration::from_secs(16));
    }
}

#[test]
fn test_factory_validates_options() {
    let broker = Arc::new(FakeBroker::default());
    let factory = factory(&broker);

    assert!(factory.validate_options(&target_options()).is_ok());
    let missing_region = factory.validate_options(&json!({"endpoint": "localhost"}));
    assert!(matches!(missing_region, Err(BrokerError::Config(_))));
    let blank_id = factory.validate_options(&json!({
        "endpoint": "localhost", "region": "eu-west-1", "client-id": " "
    }));
    assert!(matches!(blank_id, Err(BrokerError::Config(_))));

    assert!(factory.validate_message_options(&json!({"topic": "a/b"})).is_ok());
    assert!(factory.validate_message_options(&json!({"topic": ""})).is_err());
    assert!(factory.validate_message_options(&json!({})).is_err());

    assert!(
        factory
            .validate_subscription_options(&json!({"subscription_id": "cmd", "topic": "cmd/#"}))
            .is_ok()
    );
    assert!(factory.validate_subscription_options(&json!({"subscription_id": "cmd"})).is_err());
    assert!(broker.ops().is_empty());
}

#[test]
fn test_create_message_expands_topic() {
    let broker = Arc::new(FakeBroker::default());
    let payload = Payload::new("x").with_metadata("device", "cam-7");
    let message = factory(&broker)
        .create_message(&payload, &json!({"topic": "devices/${device}/frames", "retain": true}))
        .unwrap();
    let ProtocolMessage::Mqtt(message) = message else {
        panic!("expected an mqtt message");
    };
    assert_eq!(message.topic, "devices/cam-7/frames");
    assert!(message.retain);
    assert_eq!(message.payload, payload);
}

#[test]
fn test_initial_connect_failure_fails_construction() {
    let broker = Arc::new(FakeBroker::default());
    broker.refuse_connects.store(1, Ordering::SeqCst);
    let result = factory(&broker)
        .create_client(&target_options(), Arc::new(StaticCredentialProvider::anonymous()));
    assert!(matches!(result, Err(BrokerError::Transport(_))));
    assert_eq!(broker.connects(), 1);
}

#[test]
fn test_publish_sends_wire_form() {
    let broker = Arc::new(FakeBroker::default());
    let client = connect(&broker);
    let payload = Payload::new("hello");
    let message = ProtocolMessage::Mqtt(MqttMessage {
        topic: "t/1".into(),
        retain: false,
        payload: payload.clone(),
    });
    client.publish(&message).unwrap();
    assert!(broker.ops().contains(&Op::Publish("t/1".into(), payload.to_wire().unwrap())));
}

#[test]
fn test_publish_rejects_foreign_message() {
    let broker = Arc::new(FakeBroker::default());
    let client = connect(&broker);
    let message = ProtocolMessage::File(FileMessage {
        path: PathBuf::from("out.bin"),
        append: false,
        payload: Payload::new("x"),
    });
    let err = client.publish(&message).unwrap_err();
    assert!(matches!(
        err,
        BrokerError::NoMatchingInterface { expected: "mqtt", actual: "file" }
    ));
}

#[test]
fn test_shared_topic_subscribes_once() {
    let broker = Arc::new(FakeBroker::default());
    let client = connect(&broker);
    let (_, handler) = collector();

    let ids: Vec<HandlerId> = (0..3)
        .map(|_| client.subscribe(&topic("cmd/gate"), Arc::clone(&handler)).unwrap())
        .collect();
    assert_eq!(broker.subscribes("cmd/gate"), 1);

    client.unsubscribe(ids[0]).unwrap();
    client.unsubscribe(ids[1]).unwrap();
    assert_eq!(broker.unsubscribes("cmd/gate"), 0);

    client.unsubscribe(ids[2]).unwrap();
    assert_eq!(broker.unsubscribes("cmd/gate"), 1);

    client.unsubscribe(ids[2]).unwrap();
    assert_eq!(broker.unsubscribes("cmd/gate"), 1);
}

#[test]
fn test_inbound_messages_reach_matching_topic_only() {
    let broker = Arc::new(FakeBroker::default());
    let client = connect(&broker);
    let (gate_seen, gate) = collector();
    let (light_seen, light) = collector();
    client.subscribe(&topic("cmd/gate"), gate).unwrap();
    client.subscribe(&topic("cmd/light"), light).unwrap();

    let command = Payload::new(r#"{"gate":"open"}"#);
    broker.deliver("cmd/gate", &command);

    let gate_seen = gate_seen.lock();
    assert_eq!(gate_seen.len(), 1);
    assert_eq!(gate_seen[0], ("cmd/gate".to_string(), command));
    assert!(light_seen.lock().is_empty());
}

#[test]
fn test_unsubscribe_ack_timeout() {
    let broker = Arc::new(FakeBroker::default());
    let client = connect(&broker);
    let (_, handler) = collector();
    let id = client.subscribe(&topic("slow"), handler).unwrap();

    broker.hold_unsubscribe_acks.store(true, Ordering::SeqCst);
    let err = client.unsubscribe(id).unwrap_err();
    assert!(matches!(err, BrokerError::Timeout { operation: "unsubscribe", .. }));
}

#[test]
fn test_interruption_reconnects_and_resubscribes() {
    let broker = Arc::new(FakeBroker::default());
    let client = connect(&broker);
    let (seen, handler) = collector();
    client.subscribe(&topic("cmd/gate"), handler).unwrap();

    (broker.latest_sink())(SessionEvent::Interrupted("keep-alive timeout".into()));

    wait_until("resubscribe", || broker.subscribes("cmd/gate") == 2);
    assert_eq!(broker.connects(), 2);
    assert!(broker.ops().contains(&Op::Disconnect));

    // Events from the retired session are ignored.
    (broker.session_sink(0))(SessionEvent::Interrupted("late".into()));
    (broker.session_sink(0))(SessionEvent::Message {
        topic: "cmd/gate".into(),
        payload: b"stale".to_vec(),
    });
    thread::sleep(Duration::from_millis(50));
    assert_eq!(broker.connects(), 2);
    assert!(seen.lock().is_empty());

    broker.deliver("cmd/gate", &Payload::new("fresh"));
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn test_reconnect_retries_refused_connects() {
    let broker = Arc::new(FakeBroker::default());
    let client = connect(&broker);

    broker.refuse_connects.store(2, Ordering::SeqCst);
    (broker.latest_sink())(SessionEvent::Interrupted("network down".into()));

    wait_until("third reconnect attempt", || broker.connects() == 4);

    let message = ProtocolMessage::Mqtt(MqttMessage {
        topic: "after".into(),
        retain: false,
        payload: Payload::new("ok"),
    });
    wait_until("connected", || client.publish(&message).is_ok());
}

#[test]
fn test_explicit_reconnect_requeries_credentials() {
    let broker = Arc::new(FakeBroker::default());
    let client = factory(&broker)
        .create_client(&target_options(), Arc::new(RotatingCredentials::default()))
        .unwrap();
    let (_, handler) = collector();
    client.subscribe(&topic("cfg"), handler).unwrap();

    client.reconnect().unwrap();

    let connects: Vec<Op> = broker
        .ops()
        .into_iter()
        .filter(|op| matches!(op, Op::Connect(_)))
        .collect();
    assert_eq!(connects, vec![Op::Connect("key-1".into()), Op::Connect("key-2".into())]);
    assert_eq!(broker.subscribes("cfg"), 2);
}

#[test]
fn test_async_publishes_keep_submission_order() {
    let broker = Arc::new(FakeBroker::default());
    let client = connect(&broker);
    let completed = Arc::new(Mutex::new(Vec::new()));

    for i in 0..20u32 {
        let message = ProtocolMessage::Mqtt(MqttMessage {
            topic: "seq".into(),
            retain: false,
            payload: Payload::new(i.to_string()),
        });
        let completed = Arc::clone(&completed);
        client.publish_async(
            message,
            Arc::new(move |protocol: &str, message: &ProtocolMessage, success: bool| {
                assert_eq!(protocol, "mqtt");
                assert!(success);
                let text = String::from_utf8(message.payload().data().unwrap().to_vec()).unwrap();
                completed.lock().push(text.parse::<u32>().unwrap());
            }),
        );
    }

    wait_until("all completions", || completed.lock().len() == 20);
    assert_eq!(*completed.lock(), (0..20).collect::<Vec<_>>());
}

#[test]
fn test_async_publishes_after_interruption_wait_for_new_session() {
    let broker = Arc::new(FakeBroker::default());
    let settings = MqttSettings {
        backoff_initial_ms: 200,
        ..test_settings()
    };
    let client = connect_client(&broker, settings, Arc::new(StaticCredentialProvider::anonymous()));

    broker.interrupt(0, "keep-alive timeout");
    assert_eq!(client.state(), ConnectionState::Interrupted);

    let (seen, handler) = outcomes();
    for i in 0..5 {
        client.publish_async(mqtt_message("held", &i.to_string()), Arc::clone(&handler));
    }

    // nothing runs while the supervisor waits out the backoff
    thread::sleep(Duration::from_millis(50));
    assert!(seen.lock().is_empty());
    assert_eq!(broker.connects(), 1);

    wait_until("held publishes", || seen.lock().len() == 5);
    let expected: Vec<(String, bool)> = (0..5).map(|i| (i.to_string(), true)).collect();
    assert_eq!(*seen.lock(), expected);
    assert_eq!(client.state(), ConnectionState::Connected);

    let ops = broker.ops();
    let reconnect = ops
        .iter()
        .rposition(|op| matches!(op, Op::Connect(_)))
        .unwrap();
    let first_publish = ops
        .iter()
        .position(|op| matches!(op, Op::Publish(..)))
        .unwrap();
    assert!(reconnect < first_publish);
}

#[test]
fn test_interruption_fails_sync_publish_until_reconnected() {
    let broker = Arc::new(FakeBroker::default());
    let settings = MqttSettings {
        backoff_initial_ms: 200,
        ..test_settings()
    };
    let client = connect_client(&broker, settings, Arc::new(StaticCredentialProvider::anonymous()));

    broker.interrupt(0, "network down");
    let err = client.publish(&mqtt_message("t", "x")).unwrap_err();
    assert!(matches!(err, BrokerError::Transport(_)));

    wait_until("reconnected", || client.state() == ConnectionState::Connected);
    client.publish(&mqtt_message("t", "y")).unwrap();
}

#[test]
fn test_slow_unsubscribe_does_not_block_other_topics() {
    let broker = Arc::new(FakeBroker::default());
    let settings = MqttSettings {
        unsubscribe_timeout_ms: 2000,
        ..test_settings()
    };
    let client = Arc::new(connect_client(
        &broker,
        settings,
        Arc::new(StaticCredentialProvider::anonymous()),
    ));
    let (_, handler) = collector();
    let slow = client.subscribe(&topic("slow"), Arc::clone(&handler)).unwrap();

    broker.hold_unsubscribe_acks.store(true, Ordering::SeqCst);
    let unsubscriber = {
        let client = Arc::clone(&client);
        thread::spawn(move || client.unsubscribe(slow))
    };
    wait_until("unsubscribe sent", || broker.unsubscribes("slow") == 1);

    let started = Instant::now();
    client.subscribe(&topic("fast"), handler).unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(broker.subscribes("fast"), 1);

    broker.release_held_acks();
    unsubscriber.join().unwrap().unwrap();
    assert_eq!(client.subscriber_count("slow"), 0);
}

#[test]
fn test_scheduled_refresh_reconnects_with_fresh_credentials() {
    let broker = Arc::new(FakeBroker::default());
    let settings = MqttSettings {
        refresh_interval_secs: 1,
        ..test_settings()
    };
    let client = connect_client(&broker, settings, Arc::new(RotatingCredentials::default()));
    let (_, handler) = collector();
    client.subscribe(&topic("cfg"), handler).unwrap();

    wait_until("refresh", || broker.subscribes("cfg") == 2);
    let connects: Vec<Op> = broker
        .ops()
        .into_iter()
        .filter(|op| matches!(op, Op::Connect(_)))
        .take(2)
        .collect();
    assert_eq!(connects, vec![Op::Connect("key-1".into()), Op::Connect("key-2".into())]);
    assert!(broker.ops().contains(&Op::Disconnect));
}

#[test]
fn test_successful_reconnect_resets_backoff() {
    let broker = Arc::new(FakeBroker::default());
    let client = connect_client(
        &broker,
        test_settings(),
        Arc::new(StaticCredentialProvider::anonymous()),
    );

    broker.refuse_connects.store(2, Ordering::SeqCst);
    broker.interrupt(0, "network down");

    wait_until("third reconnect attempt", || {
        broker.connects() == 4 && client.state() == ConnectionState::Connected
    });
    assert_eq!(client.next_backoff(), Duration::from_millis(10));
}

#[test]
fn test_drop_fails_pending_async_publishes() {
    let broker = Arc::new(FakeBroker::default());
    let settings = MqttSettings {
        backoff_initial_ms: 5000,
        backoff_max_ms: 5000,
        ..test_settings()
    };
    let client = connect_client(&broker, settings, Arc::new(StaticCredentialProvider::anonymous()));

    broker.interrupt(0, "network down");
    let (seen, handler) = outcomes();
    client.publish_async(mqtt_message("t", "a"), Arc::clone(&handler));
    client.publish_async(mqtt_message("t", "b"), handler);

    drop(client);
    assert_eq!(
        *seen.lock(),
        vec![("a".to_string(), false), ("b".to_string(), false)]
    );
}

#[test]
fn test_drop_disconnects() {
    let broker = Arc::new(FakeBroker::default());
    let client = connect(&broker);
    drop(client);
    assert_eq!(broker.ops().last(), Some(&Op::Disconnect));
}

#[test]
fn test_ack_book_matches_packet_ids() {
    let mut book = AckBook::default();
    let (first_tx, first) = Ack::channel();
    let (second_tx, second) = Ack::channel();
    book.queue(AckKind::Publish, first_tx);
    book.queue(AckKind::Publish, second_tx);
    book.assign(AckKind::Publish, 7);
    book.assign(AckKind::Publish, 8);

    book.complete(AckKind::Publish, 8, Ok(()));
    assert!(second.wait("publish", Duration::from_millis(50)).is_ok());
    book.complete(AckKind::Publish, 7, Err(BrokerError::transport("rejected")));
    assert!(matches!(
        first.wait("publish", Duration::from_millis(50)),
        Err(BrokerError::Transport(_))
    ));
}

#[test]
fn test_ack_book_rejects_packet_id_zero_and_fails_pending() {
    let mut book = AckBook::default();
    let (rejected_tx, rejected) = Ack::channel();
    let (pending_tx, pending) = Ack::channel();
    book.queue(AckKind::Publish, rejected_tx);
    book.queue(AckKind::Subscribe, pending_tx);

    book.assign(AckKind::Publish, 0);
    assert!(rejected.wait("publish", Duration::from_millis(50)).is_err());

    book.fail_all();
    assert!(matches!(
        pending.wait("subscribe", Duration::from_millis(50)),
        Err(BrokerError::Transport(_))
    ));

    let (_held, never) = Ack::channel();
    assert!(matches!(
        never.wait("subscribe", Duration::from_millis(10)),
        Err(BrokerError::Timeout { operation: "subscribe", .. })
    ));
}
