//! MQTT client with connection recovery.
//!
//! States move `Disconnected → Connecting → Connected`, and on an unexpected
//! hangup `Connected → Interrupted → Connecting → Connected`. Each connection
//! attempt opens a fresh [`MqttSession`] tagged with a generation number;
//! events from older sessions are dropped.
//!
//! One supervisor thread per client performs recovery. It waits on a command
//! channel: an interruption sends a reconnect command, and when nothing
//! arrives for the refresh interval the connection is rebuilt anyway.
//! Recovery pauses the publish queue, sleeps the current backoff, reconnects,
//! resumes the queue and resubscribes every active topic.
//!
//! An interruption pauses the queue and retires the dead session at once, so
//! nothing is published on it while the supervisor waits out the backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::transport::{ConnectSettings, EventSink, MqttSession, MqttTransport, SessionEvent};
use super::{Endpoint, MqttTargetOptions, PROTOCOL};
use crate::config::MqttSettings;
use crate::payload::Payload;
use crate::protocol::credentials::CredentialProvider;
use crate::protocol::{
    HandlerId, ProtocolClient, ProtocolMessage, ProtocolSubscription, PublishHandler, PublishJob,
    Subscribable, SubscriptionHandler, SubscriptionTable, Transition, enqueue_publish,
    publish_queue,
};
use crate::queue::JobQueue;
use crate::utils::{BrokerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Interrupted,
}

enum Command {
    Reconnect { generation: u64, reason: String },
    Shutdown,
}

type ConnectSignal = (u64, Sender<Result<()>>);

struct Inner {
    client_id: String,
    endpoint: Endpoint,
    keep_alive: Duration,
    settings: MqttSettings,
    credentials: Arc<dyn CredentialProvider>,
    transport: Arc<dyn MqttTransport>,

    session: RwLock<Option<Arc<dyn MqttSession>>>,
    /// Interrupted session awaiting disconnect by the next teardown.
    retired: Mutex<Option<Arc<dyn MqttSession>>>,
    generation: AtomicU64,
    state: Mutex<ConnectionState>,
    connect_signal: Mutex<Option<ConnectSignal>>,
    backoff: Mutex<Backoff>,
    reconnect_lock: Mutex<()>,

    subscriptions: SubscriptionTable,
    /// One gate per topic. A transport edge for a topic finishes before the
    /// next one for that topic starts; other topics are not held up.
    topic_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,

    queue: JobQueue<PublishJob, bool>,
    commands: Sender<Command>,
    halted: Mutex<bool>,
    wake: Condvar,
}

pub struct MqttClient {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl MqttClient {
    /// Connects and blocks until the broker accepts the connection or the
    /// connect timeout passes. Construction fails if the first connect does.
    pub fn connect(
        options: &MqttTargetOptions,
        endpoint: Endpoint,
        settings: MqttSettings,
        credentials: Arc<dyn CredentialProvider>,
        transport: Arc<dyn MqttTransport>,
    ) -> Result<Self> {
        let client_id = options
            .client_id
            .clone()
            .unwrap_or_else(|| format!("edge-broker-{}", uuid::Uuid::new_v4()));
        let keep_alive = options
            .keep_alive_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| settings.keep_alive());
        let refresh = settings.refresh_interval();
        let (commands, command_rx) = channel::unbounded();

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let worker = weak.clone();
            let queue = publish_queue(&client_id, move |message| match worker.upgrade() {
                Some(inner) => inner.publish(message),
                None => Err(BrokerError::transport("mqtt client dropped")),
            });
            Inner {
                client_id: client_id.clone(),
                endpoint,
                keep_alive,
                backoff: Mutex::new(Backoff::new(
                    settings.backoff_initial(),
                    settings.backoff_max(),
                )),
                settings,
                credentials,
                transport,
                session: RwLock::new(None),
                retired: Mutex::new(None),
                generation: AtomicU64::new(0),
                state: Mutex::new(ConnectionState::Disconnected),
                connect_signal: Mutex::new(None),
                reconnect_lock: Mutex::new(()),
                subscriptions: SubscriptionTable::new(),
                topic_gates: Mutex::new(HashMap::new()),
                queue,
                commands,
                halted: Mutex::new(false),
                wake: Condvar::new(),
            }
        });

        inner.establish()?;
        info!(
            "MQTT client {} connected to {} ({})",
            inner.client_id, inner.endpoint, options.region
        );

        let started = inner.queue.start().and_then(|()| {
            let weak = Arc::downgrade(&inner);
            thread::Builder::new()
                .name(format!("mqtt-supervisor-{client_id}"))
                .spawn(move || supervise(weak, command_rx, refresh))
                .map_err(BrokerError::from)
        });
        match started {
            Ok(supervisor) => Ok(Self {
                inner,
                supervisor: Mutex::new(Some(supervisor)),
            }),
            Err(e) => {
                inner.halt();
                inner.teardown();
                inner.queue.stop();
                Err(e)
            }
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Local subscribers currently sharing `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.subscriptions.count(topic)
    }

    #[cfg(test)]
    pub(crate) fn next_backoff(&self) -> Duration {
        self.inner.backoff.lock().peek()
    }
}

impl ProtocolClient for MqttClient {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn publish(&self, message: &ProtocolMessage) -> Result<()> {
        self.inner.publish(message)
    }

    fn publish_async(&self, message: ProtocolMessage, handler: Arc<dyn PublishHandler>) {
        enqueue_publish(&self.inner.queue, PROTOCOL, message, handler);
    }

    /// Makes one reconnect attempt on the caller's thread. If it fails the
    /// supervisor keeps retrying with backoff and the error is returned.
    fn reconnect(&self) -> Result<()> {
        match self.inner.recover("reconnect requested", Some(1)) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self.inner.commands.send(Command::Reconnect {
                    generation: self.inner.generation.load(Ordering::SeqCst),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn subscriber(&self) -> Option<&dyn Subscribable> {
        Some(self)
    }
}

impl Subscribable for MqttClient {
    fn subscribe(
        &self,
        subscription: &ProtocolSubscription,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<HandlerId> {
        let topic = subscription.key();
        let gate = self.inner.topic_gate(topic);
        let result = {
            let _edge = gate.lock();
            let (id, transition) = self.inner.subscriptions.add(subscription, handler);
            match transition {
                Transition::Activated => match self.inner.transport_subscribe(topic) {
                    Ok(()) => Ok(id),
                    Err(e) => {
                        self.inner.subscriptions.remove(id);
                        Err(e)
                    }
                },
                _ => Ok(id),
            }
        };
        self.inner.release_gate(topic, gate);
        result
    }

    fn unsubscribe(&self, id: HandlerId) -> Result<()> {
        let Some(topic) = self
            .inner
            .subscriptions
            .subscription(id)
            .map(|s| s.key().to_string())
        else {
            return Ok(());
        };
        let gate = self.inner.topic_gate(&topic);
        let result = {
            let _edge = gate.lock();
            match self.inner.subscriptions.remove(id) {
                (Some(_), Transition::Deactivated) => self.inner.transport_unsubscribe(&topic),
                _ => Ok(()),
            }
        };
        self.inner.release_gate(&topic, gate);
        result
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        self.inner.halt();
        let _ = self.inner.commands.send(Command::Shutdown);
        if let Some(supervisor) = self.supervisor.lock().take() {
            if supervisor.thread().id() != thread::current().id() && supervisor.join().is_err() {
                warn!("MQTT supervisor for {} panicked", self.inner.client_id);
            }
        }
        self.inner.teardown();
        self.inner.set_state(ConnectionState::Disconnected);
        self.inner.queue.stop();
        debug!("MQTT client {} closed", self.inner.client_id);
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if *state != next {
            info!("MQTT {}: {:?} -> {:?}", self.client_id, *state, next);
            *state = next;
        }
    }

    fn topic_gate(&self, topic: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.topic_gates.lock().entry(topic.to_string()).or_default())
    }

    /// Forgets the gate of a topic nobody subscribes to or waits on.
    fn release_gate(&self, topic: &str, gate: Arc<Mutex<()>>) {
        let mut gates = self.topic_gates.lock();
        if Arc::strong_count(&gate) == 2 && self.subscriptions.count(topic) == 0 {
            gates.remove(topic);
        }
    }

    fn current_session(&self) -> Result<Arc<dyn MqttSession>> {
        self.session
            .read()
            .clone()
            .ok_or_else(|| BrokerError::transport(format!("{} is not connected", self.client_id)))
    }

    fn publish(&self, message: &ProtocolMessage) -> Result<()> {
        let ProtocolMessage::Mqtt(message) = message else {
            return Err(message.mismatch(PROTOCOL));
        };
        let bytes = message.payload.to_wire()?;
        let session = self.current_session()?;
        session
            .publish(&message.topic, bytes, message.retain)?
            .wait("publish", self.settings.operation_timeout())
    }

    /// Subscribing while a reconnect is under way is deferred to the
    /// resubscribe that follows it.
    fn transport_subscribe(&self, topic: &str) -> Result<()> {
        let Some(session) = self.session.read().clone() else {
            debug!("MQTT {} subscribe to '{topic}' deferred until connected", self.client_id);
            return Ok(());
        };
        debug!("MQTT {} subscribing to '{topic}'", self.client_id);
        session
            .subscribe(topic)?
            .wait("subscribe", self.settings.operation_timeout())
    }

    fn transport_unsubscribe(&self, topic: &str) -> Result<()> {
        let Some(session) = self.session.read().clone() else {
            return Ok(());
        };
        debug!("MQTT {} unsubscribing from '{topic}'", self.client_id);
        session
            .unsubscribe(topic)?
            .wait("unsubscribe", self.settings.unsubscribe_timeout())
    }

    /// Opens a new session and waits for the connect outcome.
    fn establish(self: &Arc<Self>) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ConnectionState::Connecting);

        let outcome = self.open_session(generation);
        self.connect_signal.lock().take();
        match outcome {
            Ok(()) => {
                self.backoff.lock().reset();
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!("MQTT {} connect to {} failed: {e}", self.client_id, self.endpoint);
                self.teardown();
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    fn open_session(self: &Arc<Self>, generation: u64) -> Result<()> {
        let settings = ConnectSettings {
            host: self.endpoint.host.clone(),
            port: self.endpoint.port,
            tls: self.endpoint.tls,
            client_id: self.client_id.clone(),
            keep_alive: self.keep_alive,
            credentials: self.credentials.credentials()?,
        };
        let (signal, connected) = channel::bounded(1);
        *self.connect_signal.lock() = Some((generation, signal));

        let weak = Arc::downgrade(self);
        let events: EventSink = Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_event(generation, event);
            }
        });
        let session: Arc<dyn MqttSession> = Arc::from(self.transport.connect(&settings, events)?);
        *self.session.write() = Some(session);

        let timeout = self.settings.connect_timeout();
        match connected.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(BrokerError::Timeout {
                operation: "connect",
                timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => {
                Err(BrokerError::transport("connect attempt abandoned"))
            }
        }
    }

    /// Disconnects the current and any retired session. Their late events
    /// become stale.
    fn teardown(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let session = self.session.write().take();
        let retired = self.retired.lock().take();
        for session in session.into_iter().chain(retired) {
            session.disconnect(self.settings.operation_timeout());
        }
    }

    /// Stops publishing on a session the transport reported dead. Runs on the
    /// transport's event thread, so it neither waits for the queue nor joins
    /// the session.
    fn retire_session(&self) {
        self.queue.request_pause();
        let session = self.session.write().take();
        if let Some(session) = session {
            *self.retired.lock() = Some(session);
        }
    }

    fn signal_connect(&self, generation: u64, result: Result<()>) -> bool {
        let mut slot = self.connect_signal.lock();
        match slot.take() {
            Some((expected, signal)) if expected == generation => {
                let _ = signal.send(result);
                true
            }
            other => {
                *slot = other;
                false
            }
        }
    }

    fn on_event(&self, generation: u64, event: SessionEvent) {
        if generation != self.generation.load(Ordering::SeqCst) {
            debug!("MQTT {} ignoring {event:?} from an old session", self.client_id);
            return;
        }
        match event {
            SessionEvent::Connected => {
                self.signal_connect(generation, Ok(()));
            }
            SessionEvent::ConnectFailed(reason) | SessionEvent::Interrupted(reason) => {
                if self.signal_connect(generation, Err(BrokerError::transport(reason.clone()))) {
                    return;
                }
                self.retire_session();
                self.set_state(ConnectionState::Interrupted);
                let _ = self.commands.send(Command::Reconnect { generation, reason });
            }
            SessionEvent::Closed => {
                debug!("MQTT {} session closed", self.client_id);
            }
            SessionEvent::Message { topic, payload } => {
                let payload = Payload::from_transport(&payload);
                if self.subscriptions.dispatch(&topic, &payload) == 0 {
                    debug!("MQTT {} has no local subscriber for '{topic}'", self.client_id);
                }
            }
        }
    }

    /// Reconnects with backoff, at most `max_attempts` times when given.
    ///
    /// The publish queue stays paused while this runs, and stays paused if
    /// every attempt fails.
    fn recover(self: &Arc<Self>, reason: &str, max_attempts: Option<u32>) -> Result<()> {
        let _serial = self.reconnect_lock.lock();
        self.queue.pause();

        let mut attempt = 0u32;
        let result = loop {
            if self.is_halted() {
                break Err(BrokerError::transport("mqtt client is shutting down"));
            }
            attempt += 1;
            self.teardown();
            self.set_state(ConnectionState::Disconnected);

            let delay = self.backoff.lock().next_delay();
            warn!(
                "MQTT {} reconnecting ({reason}), attempt {attempt} after {delay:?}",
                self.client_id
            );
            if !self.sleep(delay) {
                break Err(BrokerError::transport("mqtt client is shutting down"));
            }
            match self.establish() {
                Ok(()) => break Ok(()),
                Err(e) if max_attempts.is_some_and(|max| attempt >= max) => break Err(e),
                Err(_) => {}
            }
        };

        if result.is_ok() {
            info!("MQTT {} reconnected after {attempt} attempt(s)", self.client_id);
            self.queue.resume();
            self.resubscribe();
        }
        result
    }

    fn resubscribe(&self) {
        for (subscription, _) in self.subscriptions.snapshot() {
            let topic = subscription.key();
            let gate = self.topic_gate(topic);
            {
                let _edge = gate.lock();
                let count = self.subscriptions.count(topic);
                if count > 0 {
                    match self.transport_subscribe(topic) {
                        Ok(()) => debug!(
                            "MQTT {} resubscribed to '{topic}' for {count} subscriber(s)",
                            self.client_id
                        ),
                        Err(e) => warn!(
                            "MQTT {} failed to resubscribe to '{topic}': {e}",
                            self.client_id
                        ),
                    }
                }
            }
            self.release_gate(topic, gate);
        }
    }

    fn halt(&self) {
        *self.halted.lock() = true;
        self.wake.notify_all();
    }

    fn is_halted(&self) -> bool {
        *self.halted.lock()
    }

    /// Sleeps for `delay` unless halted first. Returns false when halted.
    fn sleep(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut halted = self.halted.lock();
        while !*halted {
            if self.wake.wait_until(&mut halted, deadline).timed_out() {
                break;
            }
        }
        !*halted
    }
}

fn supervise(inner: Weak<Inner>, commands: Receiver<Command>, refresh: Duration) {
    loop {
        let reason = match commands.recv_timeout(refresh) {
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
            Ok(Command::Reconnect { generation, reason }) => Some((generation, reason)),
            Err(RecvTimeoutError::Timeout) => None,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.is_halted() {
            return;
        }
        let reason = match reason {
            Some((generation, reason)) => {
                if generation != inner.generation.load(Ordering::SeqCst) {
                    debug!("MQTT {} skipping stale reconnect request", inner.client_id);
                    continue;
                }
                format!("connection interrupted: {reason}")
            }
            None => {
                info!("MQTT {} refreshing connection after {refresh:?}", inner.client_id);
                "scheduled refresh".to_string()
            }
        };
        if let Err(e) = inner.recover(&reason, None) {
            debug!("MQTT {} recovery stopped: {e}", inner.client_id);
        }
    }
}
