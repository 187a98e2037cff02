use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Destination, RoutingConfig, SubscriptionConfig, TargetConfig};
use crate::payload::Payload;
use crate::protocol::credentials::CredentialProvider;
use crate::protocol::factory::FactoryRegistry;
use crate::protocol::{
    HandlerId, ProtocolClient, ProtocolMessage, PublishHandler, SubscriptionHandler,
};
use crate::utils::{BrokerError, Result};

/// Source name handed to subscribers for payloads published in-process.
pub const LOCAL_SOURCE: &str = "local";

/// Handle returned by [`Broker::subscribe`], used to undo that call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(Uuid);

impl SubscriptionToken {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outcome of one destination of [`Broker::publish_async`].
pub trait PublishCallback: Send + Sync {
    fn on_published(&self, target_name: &str, payload: &Payload, success: bool);
}

impl<F> PublishCallback for F
where
    F: Fn(&str, &Payload, bool) + Send + Sync,
{
    fn on_published(&self, target_name: &str, payload: &Payload, success: bool) {
        self(target_name, payload, success)
    }
}

struct LocalSubscriber {
    token: SubscriptionToken,
    subscription_id: String,
    handler: Arc<dyn SubscriptionHandler>,
}

struct RemoteRegistration {
    target_name: String,
    handler_id: HandlerId,
}

/// Routes payloads by logical id to the targets of a routing configuration
/// and to in-process subscribers.
///
/// One protocol client is created per target by [`Broker::initialize`].
/// `publish` fans a payload out to every destination of every pipe with the
/// given message id; `subscribe` registers a local handler and forwards the
/// subscription to every target that lists the subscription id.
pub struct Broker {
    config: RoutingConfig,
    registry: Arc<FactoryRegistry>,
    credentials: Arc<dyn CredentialProvider>,
    clients: RwLock<HashMap<String, Arc<dyn ProtocolClient>>>,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
    local: Mutex<Vec<LocalSubscriber>>,
    remote: Mutex<HashMap<SubscriptionToken, Vec<RemoteRegistration>>>,
}

impl Broker {
    /// Parses and validates `json` without touching any transport.
    ///
    /// Validation covers the document structure, unique target names,
    /// destinations naming existing targets, and the option objects of every
    /// target whose protocol is in `registry`.
    pub fn from_config(
        json: &str,
        registry: Arc<FactoryRegistry>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        let config = RoutingConfig::parse(json)?;
        validate(&config, &registry)?;
        debug!(
            "Broker configured with {} target(s) and {} pipe(s)",
            config.targets.len(),
            config.pipes.len()
        );
        Ok(Self {
            config,
            registry,
            credentials,
            clients: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            local: Mutex::new(Vec::new()),
            remote: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Creates one protocol client per target.
    ///
    /// All or nothing: if any target fails, the clients created so far are
    /// dropped and the broker stays uninitialized, so the call can be
    /// retried. Calling it again after success does nothing.
    pub fn initialize(&self) -> Result<()> {
        let _init = self.init_lock.lock();
        if self.is_initialized() {
            return Ok(());
        }

        let mut created: HashMap<String, Arc<dyn ProtocolClient>> = HashMap::new();
        for target in &self.config.targets {
            match self.create_client(target) {
                Ok(client) => {
                    info!("Created {} client for target '{}'", target.protocol, target.name);
                    created.insert(target.name.clone(), client);
                }
                Err(e) => {
                    error!(
                        "Failed to create {} client for target '{}': {e}",
                        target.protocol, target.name
                    );
                    return Err(e);
                }
            }
        }

        *self.clients.write() = created;
        self.initialized.store(true, Ordering::SeqCst);
        info!("Broker initialized with {} target(s)", self.config.targets.len());
        Ok(())
    }

    fn create_client(&self, target: &TargetConfig) -> Result<Arc<dyn ProtocolClient>> {
        self.registry
            .require(&target.protocol)?
            .create_client(&target.options, Arc::clone(&self.credentials))
    }

    /// The live client of a target, once initialized.
    pub fn client(&self, target_name: &str) -> Option<Arc<dyn ProtocolClient>> {
        self.clients.read().get(target_name).cloned()
    }

    fn require_client(&self, target_name: &str) -> Result<Arc<dyn ProtocolClient>> {
        if !self.is_initialized() {
            return Err(BrokerError::NotInitialized);
        }
        self.client(target_name)
            .ok_or_else(|| BrokerError::UnknownTarget(target_name.to_string()))
    }

    fn build_message(&self, destination: &Destination, payload: &Payload) -> Result<ProtocolMessage> {
        let target = self
            .config
            .target(&destination.target_name)
            .ok_or_else(|| BrokerError::UnknownTarget(destination.target_name.clone()))?;
        self.registry
            .require(&target.protocol)?
            .create_message(payload, &destination.message_options)
    }

    /// Publishes synchronously to every destination routed for `message_id`
    /// and to local subscribers of the same id.
    ///
    /// Every destination is attempted even after a failure; the error lists
    /// the targets that failed.
    pub fn publish(&self, message_id: &str, payload: &Payload) -> Result<()> {
        self.deliver_local(message_id, payload);

        let mut attempted = 0usize;
        let mut failed = Vec::new();
        for destination in self.config.destinations_for(message_id) {
            attempted += 1;
            let outcome = self.build_message(destination, payload).and_then(|message| {
                self.require_client(&destination.target_name)?.publish(&message)
            });
            if let Err(e) = outcome {
                warn!(
                    "Publish of '{message_id}' to '{}' failed: {e}",
                    destination.target_name
                );
                failed.push(destination.target_name.clone());
            }
        }
        if attempted == 0 {
            debug!("No destinations for message id '{message_id}'");
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::PublishFailed(failed))
        }
    }

    /// Hands each destination's publish to that target's own queue.
    ///
    /// `callback` fires once per destination. Destinations that cannot be
    /// reached at all (message options rejected, broker not initialized)
    /// report failure right away. Returns the number of destinations.
    pub fn publish_async(
        &self,
        message_id: &str,
        payload: &Payload,
        callback: Arc<dyn PublishCallback>,
    ) -> usize {
        self.deliver_local(message_id, payload);

        let mut dispatched = 0;
        for destination in self.config.destinations_for(message_id) {
            dispatched += 1;
            let target_name = destination.target_name.clone();
            let queued = self.build_message(destination, payload).and_then(|message| {
                let client = self.require_client(&target_name)?;
                Ok((client, message))
            });
            match queued {
                Ok((client, message)) => {
                    let callback = Arc::clone(&callback);
                    let handler: Arc<dyn PublishHandler> = Arc::new(
                        move |_protocol: &str, message: &ProtocolMessage, success: bool| {
                            callback.on_published(&target_name, message.payload(), success)
                        },
                    );
                    client.publish_async(message, handler);
                }
                Err(e) => {
                    warn!("Async publish of '{message_id}' to '{target_name}' failed: {e}");
                    callback.on_published(&target_name, payload, false);
                }
            }
        }
        dispatched
    }

    fn deliver_local(&self, message_id: &str, payload: &Payload) {
        let handlers: Vec<Arc<dyn SubscriptionHandler>> = self
            .local
            .lock()
            .iter()
            .filter(|s| s.subscription_id == message_id)
            .map(|s| Arc::clone(&s.handler))
            .collect();
        for handler in handlers {
            handler.on_message(LOCAL_SOURCE, payload);
        }
    }

    /// Registers `handler` under `subscription_id`.
    ///
    /// The handler receives local publishes of that id (source `"local"`)
    /// and inbound data from every target whose subscriptions list the id
    /// (source is the target name). If any target refuses the subscription,
    /// the registrations made so far by this call are undone.
    pub fn subscribe(
        &self,
        subscription_id: &str,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<SubscriptionToken> {
        let token = SubscriptionToken::new();
        let mut registrations = Vec::new();

        for (target, subscription) in self.config.subscriptions_for(subscription_id) {
            match self.subscribe_remote(target, subscription, Arc::clone(&handler)) {
                Ok(handler_id) => registrations.push(RemoteRegistration {
                    target_name: target.name.clone(),
                    handler_id,
                }),
                Err(e) => {
                    warn!(
                        "Subscribe '{subscription_id}' on target '{}' failed: {e}",
                        target.name
                    );
                    let _ = self.release(registrations);
                    return Err(e);
                }
            }
        }

        debug!(
            "Subscription {token} for '{subscription_id}' spans {} target(s)",
            registrations.len()
        );
        self.local.lock().push(LocalSubscriber {
            token,
            subscription_id: subscription_id.to_string(),
            handler,
        });
        self.remote.lock().insert(token, registrations);
        Ok(token)
    }

    fn subscribe_remote(
        &self,
        target: &TargetConfig,
        subscription: &SubscriptionConfig,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<HandlerId> {
        let client = self.require_client(&target.name)?;
        let subscription = self
            .registry
            .require(&target.protocol)?
            .create_subscription(&subscription.options)?;
        let source = target.name.clone();
        let forward: Arc<dyn SubscriptionHandler> =
            Arc::new(move |_key: &str, payload: &Payload| handler.on_message(&source, payload));
        client.subscribe(&subscription, forward)
    }

    /// Undoes one [`subscribe`](Self::subscribe). Unknown or already used
    /// tokens are ignored.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> Result<()> {
        self.local.lock().retain(|s| s.token != token);
        let Some(registrations) = self.remote.lock().remove(&token) else {
            debug!("Unsubscribe of unknown token {token}");
            return Ok(());
        };
        self.release(registrations)
    }

    fn release(&self, registrations: Vec<RemoteRegistration>) -> Result<()> {
        let mut first_error = None;
        for registration in registrations {
            let outcome = self
                .require_client(&registration.target_name)
                .and_then(|client| client.unsubscribe(registration.handler_id));
            if let Err(e) = outcome {
                warn!("Unsubscribe on target '{}' failed: {e}", registration.target_name);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Forces the named target to rebuild its connection.
    pub fn reconnect(&self, target_name: &str) -> Result<()> {
        self.require_client(target_name)?.reconnect()
    }
}

fn with_context(context: String, e: BrokerError) -> BrokerError {
    match e {
        BrokerError::Config(msg) => BrokerError::Config(format!("{context}: {msg}")),
        other => BrokerError::Config(format!("{context}: {other}")),
    }
}

fn validate(config: &RoutingConfig, registry: &FactoryRegistry) -> Result<()> {
    for target in &config.targets {
        let Some(factory) = registry.get(&target.protocol) else {
            continue;
        };
        factory
            .validate_options(&target.options)
            .map_err(|e| with_context(format!("target '{}'", target.name), e))?;
        for subscription in &target.subscriptions {
            factory
                .validate_subscription_options(&subscription.options)
                .map_err(|e| {
                    with_context(
                        format!(
                            "target '{}' subscription '{}'",
                            target.name, subscription.subscription_id
                        ),
                        e,
                    )
                })?;
        }
    }

    for pipe in &config.pipes {
        for destination in &pipe.destinations {
            let Some(target) = config.target(&destination.target_name) else {
                return Err(BrokerError::config(format!(
                    "pipe '{}' names unknown target '{}'",
                    pipe.message_id, destination.target_name
                )));
            };
            if let Some(factory) = registry.get(&target.protocol) {
                factory
                    .validate_message_options(&destination.message_options)
                    .map_err(|e| {
                        with_context(
                            format!("pipe '{}' destination '{}'", pipe.message_id, target.name),
                            e,
                        )
                    })?;
            }
        }
    }
    Ok(())
}
