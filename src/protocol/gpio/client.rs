use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use super::{PROTOCOL, PinDriver};
use crate::protocol::{ProtocolClient, ProtocolMessage, PublishHandler};
use crate::utils::{BrokerError, Result};

/// Synchronous GPIO client. There is no queue: async publishes run on the
/// caller's thread.
pub struct GpioClient {
    driver: Arc<dyn PinDriver>,
}

impl GpioClient {
    pub fn new(driver: Arc<dyn PinDriver>) -> Self {
        Self { driver }
    }
}

impl ProtocolClient for GpioClient {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn publish(&self, message: &ProtocolMessage) -> Result<()> {
        let ProtocolMessage::Gpio(message) = message else {
            return Err(message.mismatch(PROTOCOL));
        };

        let driver = self.driver.as_ref();
        let failures: Vec<String> = thread::scope(|scope| {
            let pulses: Vec<_> = message
                .selected()
                .map(|action| {
                    let pulse = scope.spawn(move || {
                        driver.pulse(action.pin, action.signal, action.pulse_width)
                    });
                    (action.pin, pulse)
                })
                .collect();
            if pulses.is_empty() {
                debug!("No GPIO rule matches anomaly={}", message.anomaly);
            }
            pulses
                .into_iter()
                .filter_map(|(pin, pulse)| match pulse.join() {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(format!("pin {pin}: {e}")),
                    Err(_) => Some(format!("pin {pin}: pulse panicked")),
                })
                .collect()
        });

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::transport(format!(
                "gpio pulse failed: {}",
                failures.join("; ")
            )))
        }
    }

    fn publish_async(&self, message: ProtocolMessage, handler: Arc<dyn PublishHandler>) {
        let success = match self.publish(&message) {
            Ok(()) => true,
            Err(e) => {
                warn!("GPIO publish failed: {e}");
                false
            }
        };
        handler.on_message_published(PROTOCOL, &message, success);
    }
}
