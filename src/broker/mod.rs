pub mod engine;
pub mod instances;

pub use engine::{Broker, LOCAL_SOURCE, PublishCallback, SubscriptionToken};
pub use instances::{clear_default_config, resolve_config, set_default_config};
