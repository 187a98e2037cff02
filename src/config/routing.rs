//! Routing configuration: named targets and the pipes that route logical
//! message ids to them.
//!
//! ```json
//! {
//!   "targets": [{"protocol": "mqtt", "name": "cloud",
//!                "mqtt_options": {"endpoint": "...", "region": "..."},
//!                "mqtt_subscriptions": [{"subscription_id": "gate", "topic": "cmd/gate"}]}],
//!   "pipes": [{"message_id": "prop",
//!              "destinations": [{"target_name": "cloud",
//!                                "mqtt_message_options": {"topic": "telemetry"}}]}]
//! }
//! ```
//!
//! Option objects are keyed by the target's protocol name, so they are pulled
//! out of the raw JSON here and handed to the protocol factories untouched.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::utils::{BrokerError, Result};

/// A named, configured instance of one transport protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetConfig {
    pub protocol: String,
    pub name: String,
    /// Contents of `<protocol>_options`, `{}` when absent.
    pub options: Value,
    /// Entries of `<protocol>_subscriptions`.
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// One entry of a target's `<protocol>_subscriptions` list.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionConfig {
    pub subscription_id: String,
    /// The whole entry, including `subscription_id`.
    pub options: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub target_name: String,
    /// Contents of `<protocol>_message_options`, `{}` when absent.
    pub message_options: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipeConfig {
    pub message_id: String,
    pub destinations: Vec<Destination>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingConfig {
    pub targets: Vec<TargetConfig>,
    pub pipes: Vec<PipeConfig>,
}

impl RoutingConfig {
    /// Parses and structurally validates a routing configuration.
    ///
    /// An empty or whitespace-only string is the empty configuration.
    pub fn parse(json: &str) -> Result<Self> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        let root: Value = serde_json::from_str(json)
            .map_err(|e| BrokerError::config(format!("invalid routing JSON: {e}")))?;
        let root = root
            .as_object()
            .ok_or_else(|| BrokerError::config("routing configuration must be a JSON object"))?;

        let mut targets = Vec::new();
        let mut names = HashSet::new();
        for (i, raw) in optional_array(root, "targets", "configuration")?
            .iter()
            .enumerate()
        {
            let target = parse_target(raw, i)?;
            if !names.insert(target.name.clone()) {
                return Err(BrokerError::config(format!(
                    "duplicate target name '{}'",
                    target.name
                )));
            }
            targets.push(target);
        }

        let mut config = Self {
            targets,
            pipes: Vec::new(),
        };
        for (i, raw) in optional_array(root, "pipes", "configuration")?
            .iter()
            .enumerate()
        {
            let pipe = config.parse_pipe(raw, i)?;
            config.pipes.push(pipe);
        }
        Ok(config)
    }

    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// All destinations of every pipe routing `message_id`, in config order.
    pub fn destinations_for<'a>(
        &'a self,
        message_id: &'a str,
    ) -> impl Iterator<Item = &'a Destination> + 'a {
        self.pipes
            .iter()
            .filter(move |p| p.message_id == message_id)
            .flat_map(|p| p.destinations.iter())
    }

    /// Targets carrying a subscription entry for `subscription_id`, with that entry.
    pub fn subscriptions_for<'a>(
        &'a self,
        subscription_id: &'a str,
    ) -> impl Iterator<Item = (&'a TargetConfig, &'a SubscriptionConfig)> + 'a {
        self.targets.iter().flat_map(move |t| {
            t.subscriptions
                .iter()
                .filter(move |s| s.subscription_id == subscription_id)
                .map(move |s| (t, s))
        })
    }

    fn parse_pipe(&self, raw: &Value, index: usize) -> Result<PipeConfig> {
        let what = format!("pipe #{index}");
        let obj = raw
            .as_object()
            .ok_or_else(|| BrokerError::config(format!("{what} must be an object")))?;
        let message_id = required_str(obj, "message_id", &what)?;
        let raw_destinations = obj
            .get("destinations")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                BrokerError::config(format!("{what} ('{message_id}') requires a 'destinations' array"))
            })?;

        let mut destinations = Vec::with_capacity(raw_destinations.len());
        for (j, raw) in raw_destinations.iter().enumerate() {
            let what = format!("destination #{j} of pipe '{message_id}'");
            let obj = raw
                .as_object()
                .ok_or_else(|| BrokerError::config(format!("{what} must be an object")))?;
            let target_name = required_str(obj, "target_name", &what)?;
            let target = self.target(&target_name).ok_or_else(|| {
                BrokerError::config(format!("{what} references unknown target '{target_name}'"))
            })?;
            let message_options =
                optional_object(obj, &format!("{}_message_options", target.protocol), &what)?;
            destinations.push(Destination {
                target_name,
                message_options,
            });
        }

        Ok(PipeConfig {
            message_id,
            destinations,
        })
    }
}

fn parse_target(raw: &Value, index: usize) -> Result<TargetConfig> {
    let what = format!("target #{index}");
    let obj = raw
        .as_object()
        .ok_or_else(|| BrokerError::config(format!("{what} must be an object")))?;
    let protocol = required_str(obj, "protocol", &what)?;
    let name = required_str(obj, "name", &what)?;
    let what = format!("target '{name}'");
    let options = optional_object(obj, &format!("{protocol}_options"), &what)?;

    let mut subscriptions = Vec::new();
    for (j, entry) in optional_array(obj, &format!("{protocol}_subscriptions"), &what)?
        .iter()
        .enumerate()
    {
        let entry_obj = entry.as_object().ok_or_else(|| {
            BrokerError::config(format!("subscription #{j} of {what} must be an object"))
        })?;
        let subscription_id =
            required_str(entry_obj, "subscription_id", &format!("subscription #{j} of {what}"))?;
        subscriptions.push(SubscriptionConfig {
            subscription_id,
            options: entry.clone(),
        });
    }

    Ok(TargetConfig {
        protocol,
        name,
        options,
        subscriptions,
    })
}

fn required_str(obj: &Map<String, Value>, key: &str, what: &str) -> Result<String> {
    match obj.get(key).and_then(Value::as_str) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(BrokerError::config(format!(
            "{what} requires a non-empty string '{key}'"
        ))),
    }
}

fn optional_object(obj: &Map<String, Value>, key: &str, what: &str) -> Result<Value> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(Value::Object(Map::new())),
        Some(v @ Value::Object(_)) => Ok(v.clone()),
        Some(_) => Err(BrokerError::config(format!("{what}: '{key}' must be an object"))),
    }
}

fn optional_array<'a>(obj: &'a Map<String, Value>, key: &str, what: &str) -> Result<&'a [Value]> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(_) => Err(BrokerError::config(format!("{what}: '{key}' must be an array"))),
    }
}
