use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rppal::gpio::Gpio;
use tracing::debug;

use super::Signal;
use crate::utils::Result;

pub trait PinDriver: Send + Sync {
    /// Drives `pin` to `signal` for `width`, then back to the opposite level.
    fn pulse(&self, pin: u8, signal: Signal, width: Duration) -> Result<()>;
}

/// Raspberry Pi GPIO through `rppal`. The controller is opened on the first
/// pulse, so hosts without GPIO can still create the target.
#[derive(Default)]
pub struct RppalPinDriver {
    gpio: Mutex<Option<Arc<Gpio>>>,
}

impl RppalPinDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn controller(&self) -> Result<Arc<Gpio>> {
        let mut gpio = self.gpio.lock();
        if let Some(gpio) = gpio.as_ref() {
            return Ok(Arc::clone(gpio));
        }
        let opened = Arc::new(Gpio::new()?);
        *gpio = Some(Arc::clone(&opened));
        Ok(opened)
    }
}

impl PinDriver for RppalPinDriver {
    fn pulse(&self, pin: u8, signal: Signal, width: Duration) -> Result<()> {
        let mut output = self.controller()?.get(pin)?.into_output();
        debug!("GPIO {pin}: {signal:?} pulse for {width:?}");
        match signal {
            Signal::High => {
                output.set_high();
                thread::sleep(width);
                output.set_low();
            }
            Signal::Low => {
                output.set_low();
                thread::sleep(width);
                output.set_high();
            }
        }
        Ok(())
    }
}
