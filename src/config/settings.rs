use std::time::Duration;

use serde::Deserialize;

/// Top-level tuning settings for the broker.
///
/// Routing (targets and pipes) is not part of this; it comes from the JSON
/// routing configuration handled by [`super::routing`].
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub log_level: String,
    pub mqtt: MqttSettings,
}

/// Timing knobs for MQTT clients.
///
/// Durations are stored in their configured unit and exposed as [`Duration`]
/// through the accessor methods.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MqttSettings {
    pub connect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub unsubscribe_timeout_ms: u64,
    pub keep_alive_secs: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub refresh_interval_secs: u64,
}

impl MqttSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn unsubscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.unsubscribe_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

/// Partial settings loaded from files or environment.
///
/// Allows settings to be given partially. Missing values are filled from
/// [`Settings::default`].
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub log_level: Option<String>,
    pub mqtt: Option<PartialMqttSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialMqttSettings {
    pub connect_timeout_ms: Option<u64>,
    pub operation_timeout_ms: Option<u64>,
    pub unsubscribe_timeout_ms: Option<u64>,
    pub keep_alive_secs: Option<u64>,
    pub backoff_initial_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    pub refresh_interval_secs: Option<u64>,
}

impl PartialSettings {
    /// Overlays the values present in `self` on top of `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        let mqtt = self.mqtt.unwrap_or_default();
        let d = defaults.mqtt;
        Settings {
            log_level: self.log_level.unwrap_or(defaults.log_level),
            mqtt: MqttSettings {
                connect_timeout_ms: mqtt.connect_timeout_ms.unwrap_or(d.connect_timeout_ms),
                operation_timeout_ms: mqtt
                    .operation_timeout_ms
                    .unwrap_or(d.operation_timeout_ms),
                unsubscribe_timeout_ms: mqtt
                    .unsubscribe_timeout_ms
                    .unwrap_or(d.unsubscribe_timeout_ms),
                keep_alive_secs: mqtt.keep_alive_secs.unwrap_or(d.keep_alive_secs),
                backoff_initial_ms: mqtt.backoff_initial_ms.unwrap_or(d.backoff_initial_ms),
                backoff_max_ms: mqtt.backoff_max_ms.unwrap_or(d.backoff_max_ms),
                refresh_interval_secs: mqtt
                    .refresh_interval_secs
                    .unwrap_or(d.refresh_interval_secs),
            },
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            mqtt: MqttSettings::default(),
        }
    }
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            operation_timeout_ms: 10_000,
            unsubscribe_timeout_ms: 5_000,
            keep_alive_secs: 30,
            backoff_initial_ms: 250,
            backoff_max_ms: 16_000,
            refresh_interval_secs: 12 * 60 * 60,
        }
    }
}
