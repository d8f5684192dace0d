use log::debug;

use crate::config::LedConfig;
use crate::error::HalError;
use crate::hal::{DigitalIo, Level, PinId};

/// Push-pull indicator LED, lit when driven high.
#[derive(Debug, Clone)]
pub struct Led {
    pub id: u8,
    pub pin: PinId,
    pub description: Option<String>,
}

impl Led {
    pub fn new(config: &LedConfig) -> Self {
        Led {
            id: config.id,
            pin: config.pin,
            description: config.description.clone(),
        }
    }

    /// Configure the pin as an output, off.
    pub fn init<H: DigitalIo>(&self, hal: &mut H) -> Result<(), HalError> {
        hal.configure_output(self.pin, Level::Low)?;
        debug!("LED {} on pin {} ready", self.id, self.pin);
        Ok(())
    }

    pub fn on<H: DigitalIo>(&self, hal: &mut H) -> Result<(), HalError> {
        hal.write_pin(self.pin, Level::High)
    }

    pub fn off<H: DigitalIo>(&self, hal: &mut H) -> Result<(), HalError> {
        hal.write_pin(self.pin, Level::Low)
    }

    /// Returns whether the LED is now lit.
    pub fn toggle<H: DigitalIo>(&self, hal: &mut H) -> Result<bool, HalError> {
        let next = !hal.read_pin(self.pin)?;
        hal.write_pin(self.pin, next)?;
        Ok(next.is_high())
    }

    pub fn is_on<H: DigitalIo>(&self, hal: &mut H) -> Result<bool, HalError> {
        Ok(hal.read_pin(self.pin)?.is_high())
    }
}
