//! GPIO protocol: pulses output pins according to an anomaly flag.
//!
//! Message options are four `;`-delimited lists read position by position:
//!
//! ```json
//! {"rules": "Anomaly;All", "signal_types": "High;Low",
//!  "pins": "17;27", "pulse_width_ms": "500;100"}
//! ```
//!
//! The payload's first byte is the flag: `0` is normal, anything else an
//! anomaly. Each entry whose rule matches pulses its pin; all matching
//! entries run at once and publish returns when the last one is done.

mod client;
mod driver;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::credentials::CredentialProvider;
use super::factory::{ProtocolFactory, parse_options};
use super::{ProtocolClient, ProtocolMessage};
use crate::payload::Payload;
use crate::utils::{BrokerError, Result};

pub use client::GpioClient;
pub use driver::{PinDriver, RppalPinDriver};

pub const PROTOCOL: &str = "gpio";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Anomaly,
    Normal,
    All,
}

impl Rule {
    pub fn matches(self, anomaly: bool) -> bool {
        match self {
            Rule::All => true,
            Rule::Anomaly => anomaly,
            Rule::Normal => !anomaly,
        }
    }

    /// Whether one payload can select both rules.
    pub fn overlaps(self, other: Rule) -> bool {
        [true, false].iter().any(|&flag| self.matches(flag) && other.matches(flag))
    }
}

impl FromStr for Rule {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anomaly" => Ok(Rule::Anomaly),
            "normal" => Ok(Rule::Normal),
            "all" => Ok(Rule::All),
            other => Err(BrokerError::config(format!("unknown gpio rule: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Drive high for the pulse, then low.
    High,
    /// Drive low for the pulse, then high.
    Low,
}

impl FromStr for Signal {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Signal::High),
            "low" => Ok(Signal::Low),
            other => Err(BrokerError::config(format!("unknown gpio signal type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinAction {
    pub rule: Rule,
    pub signal: Signal,
    pub pin: u8,
    pub pulse_width: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpioMessage {
    pub anomaly: bool,
    pub actions: Vec<PinAction>,
    pub payload: Payload,
}

impl GpioMessage {
    /// Entries whose rule matches this message's flag.
    pub fn selected(&self) -> impl Iterator<Item = &PinAction> {
        self.actions.iter().filter(|a| a.rule.matches(self.anomaly))
    }
}

#[derive(Debug, Deserialize)]
struct GpioMessageOptions {
    rules: String,
    signal_types: String,
    pins: String,
    pulse_width_ms: String,
}

fn split<T: FromStr>(field: &str, list: &str) -> Result<Vec<T>>
where
    T::Err: std::fmt::Display,
{
    list.split(';')
        .map(|item| {
            item.trim()
                .parse::<T>()
                .map_err(|e| BrokerError::config(format!("gpio {field} entry '{item}': {e}")))
        })
        .collect()
}

fn parse_actions(options: &Value) -> Result<Vec<PinAction>> {
    let options: GpioMessageOptions = parse_options(PROTOCOL, "message options", options)?;
    let rules: Vec<Rule> = split("rules", &options.rules)?;
    let signals: Vec<Signal> = split("signal_types", &options.signal_types)?;
    let pins: Vec<u8> = split("pins", &options.pins)?;
    let widths: Vec<u64> = split("pulse_width_ms", &options.pulse_width_ms)?;

    if rules.len() != signals.len() || rules.len() != pins.len() || rules.len() != widths.len() {
        return Err(BrokerError::config(format!(
            "gpio message options need equal-length lists, got rules={} signal_types={} pins={} pulse_width_ms={}",
            rules.len(),
            signals.len(),
            pins.len(),
            widths.len()
        )));
    }

    let actions: Vec<PinAction> = rules
        .into_iter()
        .zip(signals)
        .zip(pins.into_iter().zip(widths))
        .map(|((rule, signal), (pin, width))| PinAction {
            rule,
            signal,
            pin,
            pulse_width: Duration::from_millis(width),
        })
        .collect();

    // pulses run concurrently, so one payload may drive each pin once
    for (i, action) in actions.iter().enumerate() {
        if let Some(other) = actions[..i]
            .iter()
            .find(|other| other.pin == action.pin && other.rule.overlaps(action.rule))
        {
            return Err(BrokerError::config(format!(
                "gpio pin {} is driven by both {:?} and {:?} for the same payload",
                action.pin, other.rule, action.rule
            )));
        }
    }
    Ok(actions)
}

fn anomaly_flag(payload: &Payload) -> Result<bool> {
    match payload.data() {
        Some([flag, ..]) => Ok(*flag != 0),
        Some([]) => Err(BrokerError::config("gpio payload is empty, expected a flag byte")),
        None => Err(BrokerError::config("gpio payload must be a single flag, not a batch")),
    }
}

#[derive(Default)]
pub struct GpioFactory {
    driver: Option<Arc<dyn PinDriver>>,
}

impl GpioFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_driver(driver: Arc<dyn PinDriver>) -> Self {
        Self {
            driver: Some(driver),
        }
    }
}

impl ProtocolFactory for GpioFactory {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn validate_options(&self, options: &Value) -> Result<()> {
        if options.is_object() {
            Ok(())
        } else {
            Err(BrokerError::config("gpio options must be an object"))
        }
    }

    fn validate_message_options(&self, options: &Value) -> Result<()> {
        parse_actions(options).map(|_| ())
    }

    fn create_client(
        &self,
        options: &Value,
        _credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Arc<dyn ProtocolClient>> {
        self.validate_options(options)?;
        let driver = match &self.driver {
            Some(driver) => Arc::clone(driver),
            None => Arc::new(RppalPinDriver::new()),
        };
        Ok(Arc::new(GpioClient::new(driver)))
    }

    fn create_message(&self, payload: &Payload, options: &Value) -> Result<ProtocolMessage> {
        let actions = parse_actions(options)?;
        Ok(ProtocolMessage::Gpio(GpioMessage {
            anomaly: anomaly_flag(payload)?,
            actions,
            payload: payload.clone(),
        }))
    }
}
