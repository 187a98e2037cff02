//! The `config` module handles the two configuration layers of the broker.
//!
//! - [`routing`]: the JSON routing configuration (targets and pipes) a
//!   [`crate::broker::Broker`] is built from.
//! - [`settings`]: process tuning knobs (log level, MQTT timing), layered from
//!   an optional `config/broker.*` file, `.env` and `EDGE_BROKER__*`
//!   environment variables over built-in defaults.

pub mod routing;
mod settings;

use config::{Config, ConfigError, Environment, File};
use lazy_static::lazy_static;
use tracing::warn;

use settings::PartialSettings;

pub use routing::{Destination, PipeConfig, RoutingConfig, SubscriptionConfig, TargetConfig};
pub use settings::{MqttSettings, Settings};

/// Environment variable naming a routing configuration file, consulted when a
/// broker is created without an explicit or default configuration.
pub const ROUTING_CONFIG_ENV: &str = "EDGE_BROKER_CONFIG";

/// Loads the settings from the default file and environment variables and
/// merges them with default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    // a missing .env is the normal case
    let _ = dotenvy::dotenv();

    let builder = Config::builder()
        .add_source(File::with_name("config/broker").required(false))
        .add_source(
            Environment::with_prefix("EDGE_BROKER")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}

lazy_static! {
    static ref SETTINGS: Settings = load_config().unwrap_or_else(|e| {
        warn!("Failed to load broker settings, using defaults: {e}");
        Settings::default()
    });
}

/// Process-wide settings, loaded once on first use.
pub fn settings() -> &'static Settings {
    &SETTINGS
}
