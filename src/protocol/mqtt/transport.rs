//! Seam between [`super::MqttClient`] and the MQTT library.
//!
//! A [`MqttTransport`] opens one [`MqttSession`] per connection attempt and
//! reports what happens to it through an [`EventSink`]. The client never
//! reuses a session: every reconnect opens a new one.
//!
//! [`RumqttTransport`] is the production implementation on top of
//! `rumqttc`'s blocking client. Its I/O thread drives the connection and
//! matches outgoing packet ids with PUBACK / SUBACK / UNSUBACK so each
//! operation can be awaited through an [`Ack`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rumqttc::{
    Client, ConnectReturnCode, Connection, Event, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use tracing::{debug, warn};

use crate::protocol::credentials::Credentials;
use crate::utils::{BrokerError, Result};

const REQUEST_CAPACITY: usize = 64;
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Everything needed to open one connection. Credentials are fetched fresh
/// by the client for every attempt.
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub client_id: String,
    pub keep_alive: Duration,
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    ConnectFailed(String),
    /// The connection dropped without being asked to.
    Interrupted(String),
    /// The connection ended after a requested disconnect.
    Closed,
    Message { topic: String, payload: Vec<u8> },
}

pub type EventSink = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Pending acknowledgement of a publish, subscribe or unsubscribe.
pub struct Ack {
    rx: Receiver<Result<()>>,
}

/// Completes an [`Ack`].
pub type AckSender = Sender<Result<()>>;

impl Ack {
    pub fn channel() -> (AckSender, Ack) {
        let (tx, rx) = channel::bounded(1);
        (tx, Ack { rx })
    }

    /// An acknowledgement that has already arrived.
    pub fn completed(result: Result<()>) -> Ack {
        let (tx, ack) = Self::channel();
        let _ = tx.send(result);
        ack
    }

    /// Blocks until the acknowledgement arrives, the session fails, or
    /// `timeout` passes.
    pub fn wait(self, operation: &'static str, timeout: Duration) -> Result<()> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(BrokerError::Timeout { operation, timeout }),
            Err(RecvTimeoutError::Disconnected) => Err(BrokerError::transport(format!(
                "connection closed before {operation} was acknowledged"
            ))),
        }
    }
}

pub trait MqttTransport: Send + Sync {
    /// Starts connecting. The outcome is reported through `events`, possibly
    /// before this returns.
    fn connect(&self, settings: &ConnectSettings, events: EventSink) -> Result<Box<dyn MqttSession>>;
}

pub trait MqttSession: Send + Sync {
    /// Publishes at least once.
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<Ack>;
    fn subscribe(&self, topic: &str) -> Result<Ack>;
    fn unsubscribe(&self, topic: &str) -> Result<Ack>;
    /// Requests a disconnect and waits up to `timeout` for the connection to
    /// close.
    fn disconnect(&self, timeout: Duration);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum AckKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

/// Waiters for acknowledgements, first by submission order until the packet
/// id is known, then by packet id.
#[derive(Default)]
pub(crate) struct AckBook {
    queued: HashMap<AckKind, VecDeque<AckSender>>,
    inflight: HashMap<(AckKind, u16), AckSender>,
}

impl AckBook {
    pub(crate) fn queue(&mut self, kind: AckKind, waiter: AckSender) {
        self.queued.entry(kind).or_default().push_back(waiter);
    }

    /// Drops the most recently queued waiter after a failed submission.
    pub(crate) fn unqueue_last(&mut self, kind: AckKind) {
        if let Some(queue) = self.queued.get_mut(&kind) {
            queue.pop_back();
        }
    }

    /// The request submitted first of `kind` went out with `pkid`.
    pub(crate) fn assign(&mut self, kind: AckKind, pkid: u16) {
        let Some(waiter) = self.queued.get_mut(&kind).and_then(VecDeque::pop_front) else {
            debug!("Outgoing {kind:?} {pkid} without a waiter");
            return;
        };
        if pkid == 0 {
            let _ = waiter.send(Err(BrokerError::transport(format!(
                "{kind:?} rejected: no packet id assigned"
            ))));
            return;
        }
        self.inflight.insert((kind, pkid), waiter);
    }

    pub(crate) fn complete(&mut self, kind: AckKind, pkid: u16, result: Result<()>) {
        match self.inflight.remove(&(kind, pkid)) {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => debug!("{kind:?} ack for unknown packet id {pkid}"),
        }
    }

    /// Drops every waiter; their [`Ack::wait`] reports a transport error.
    pub(crate) fn fail_all(&mut self) {
        self.queued.clear();
        self.inflight.clear();
    }
}

/// `rumqttc` backed transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct RumqttTransport;

impl MqttTransport for RumqttTransport {
    fn connect(&self, settings: &ConnectSettings, events: EventSink) -> Result<Box<dyn MqttSession>> {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options
            .set_keep_alive(settings.keep_alive.max(MIN_KEEP_ALIVE))
            .set_clean_session(true);
        if !settings.credentials.is_empty() {
            options.set_credentials(
                settings.credentials.access_key_id.clone(),
                settings.credentials.secret_access_key.clone(),
            );
        }
        if settings.tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let book = Arc::new(Mutex::new(AckBook::default()));
        let closing = Arc::new(AtomicBool::new(false));
        let (closed_tx, closed_rx) = channel::bounded(1);

        let io = {
            let book = Arc::clone(&book);
            let closing = Arc::clone(&closing);
            thread::Builder::new()
                .name(format!("mqtt-io-{}", settings.client_id))
                .spawn(move || {
                    drive(connection, &book, &events, &closing);
                    let _ = closed_tx.send(());
                })?
        };
        debug!("Connecting to {}:{} as {}", settings.host, settings.port, settings.client_id);

        Ok(Box::new(RumqttSession {
            client,
            book,
            submit: Mutex::new(()),
            closing,
            closed: closed_rx,
            io: Mutex::new(Some(io)),
        }))
    }
}

struct RumqttSession {
    client: Client,
    book: Arc<Mutex<AckBook>>,
    /// Keeps waiter order in step with the order requests reach the event loop.
    submit: Mutex<()>,
    closing: Arc<AtomicBool>,
    closed: Receiver<()>,
    io: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttSession {
    fn submit(
        &self,
        kind: AckKind,
        request: impl FnOnce(&Client) -> std::result::Result<(), rumqttc::ClientError>,
    ) -> Result<Ack> {
        let _order = self.submit.lock();
        let (tx, ack) = Ack::channel();
        self.book.lock().queue(kind, tx);
        if let Err(e) = request(&self.client) {
            self.book.lock().unqueue_last(kind);
            return Err(BrokerError::transport(format!("{kind:?} request failed: {e}")));
        }
        Ok(ack)
    }
}

impl MqttSession for RumqttSession {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<Ack> {
        self.submit(AckKind::Publish, |client| {
            client.publish(topic, QoS::AtLeastOnce, retain, payload)
        })
    }

    fn subscribe(&self, topic: &str) -> Result<Ack> {
        self.submit(AckKind::Subscribe, |client| {
            client.subscribe(topic, QoS::AtLeastOnce)
        })
    }

    fn unsubscribe(&self, topic: &str) -> Result<Ack> {
        self.submit(AckKind::Unsubscribe, |client| client.unsubscribe(topic))
    }

    fn disconnect(&self, timeout: Duration) {
        self.closing.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not delivered: {e}");
        }
        let Some(io) = self.io.lock().take() else {
            return;
        };
        if io.thread().id() == thread::current().id() {
            return;
        }
        match self.closed.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if io.join().is_err() {
                    warn!("MQTT I/O thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("MQTT connection did not close within {timeout:?}, detaching I/O thread");
            }
        }
    }
}

impl Drop for RumqttSession {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.client.try_disconnect();
    }
}

fn drive(mut connection: Connection, book: &Mutex<AckBook>, events: &EventSink, closing: &AtomicBool) {
    let mut connected = false;
    for notification in connection.iter() {
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connected = true;
                    events(SessionEvent::Connected);
                } else {
                    events(SessionEvent::ConnectFailed(format!("{:?}", ack.code)));
                    book.lock().fail_all();
                    return;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                events(SessionEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                });
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                book.lock().complete(AckKind::Publish, ack.pkid, Ok(()));
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let result = if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    Err(BrokerError::transport("subscription refused by broker"))
                } else {
                    Ok(())
                };
                book.lock().complete(AckKind::Subscribe, ack.pkid, result);
            }
            Ok(Event::Incoming(Packet::UnsubAck(ack))) => {
                book.lock().complete(AckKind::Unsubscribe, ack.pkid, Ok(()));
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                book.lock().assign(AckKind::Publish, pkid);
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                book.lock().assign(AckKind::Subscribe, pkid);
            }
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                book.lock().assign(AckKind::Unsubscribe, pkid);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                book.lock().fail_all();
                if closing.load(Ordering::SeqCst) {
                    events(SessionEvent::Closed);
                } else if connected {
                    events(SessionEvent::Interrupted(e.to_string()));
                } else {
                    events(SessionEvent::ConnectFailed(e.to_string()));
                }
                return;
            }
        }
    }
    book.lock().fail_all();
    events(SessionEvent::Closed);
}
