//! Process-wide default configuration and the broker instance cache.

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Weak};

use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::engine::Broker;
use crate::config::ROUTING_CONFIG_ENV;
use crate::protocol::credentials::EnvCredentialProvider;
use crate::protocol::factory::default_registry;
use crate::utils::{BrokerError, Result};

const EMPTY_CONFIG: &str = "{}";

lazy_static! {
    static ref DEFAULT_CONFIG: RwLock<Option<String>> = RwLock::new(None);
    static ref INSTANCES: Mutex<HashMap<String, Weak<Broker>>> = Mutex::new(HashMap::new());
}

/// Sets the configuration used by [`Broker::create`] when called without
/// one. Brokers that already exist keep their configuration.
pub fn set_default_config(json: impl Into<String>) {
    *DEFAULT_CONFIG.write() = Some(json.into());
}

pub fn clear_default_config() {
    *DEFAULT_CONFIG.write() = None;
}

/// Picks the configuration text: the explicit one if non-empty, then the
/// process default, then the file named by `EDGE_BROKER_CONFIG`, then `{}`.
pub fn resolve_config(explicit: Option<&str>) -> Result<String> {
    if let Some(json) = explicit.filter(|json| !json.trim().is_empty()) {
        return Ok(json.to_string());
    }
    if let Some(json) = DEFAULT_CONFIG.read().clone() {
        return Ok(json);
    }
    if let Ok(path) = std::env::var(ROUTING_CONFIG_ENV) {
        debug!("Loading routing configuration from {path}");
        return fs::read_to_string(&path).map_err(|e| {
            BrokerError::config(format!("cannot read {ROUTING_CONFIG_ENV}={path}: {e}"))
        });
    }
    Ok(EMPTY_CONFIG.to_string())
}

impl Broker {
    /// Returns the broker for the resolved configuration, building it on
    /// first use. Identical configuration text yields the same instance for
    /// as long as someone holds it.
    pub fn create(config: Option<&str>) -> Result<Arc<Broker>> {
        let resolved = resolve_config(config)?;
        let mut instances = INSTANCES.lock();
        if let Some(broker) = instances.get(&resolved).and_then(Weak::upgrade) {
            return Ok(broker);
        }

        let broker = Arc::new(Broker::from_config(
            &resolved,
            default_registry(),
            Arc::new(EnvCredentialProvider),
        )?);
        instances.retain(|_, broker| broker.strong_count() > 0);
        instances.insert(resolved, Arc::downgrade(&broker));
        info!("Created broker instance ({} cached)", instances.len());
        Ok(broker)
    }
}
