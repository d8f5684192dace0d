use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::DebounceError;
use crate::hal::{Edge, Level, PinId, TimerSettings};
use crate::transport::{DEFAULT_BUFFER_SIZE, MAX_DMA_LENGTH};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardConfig {
    #[serde(default)]
    pub timer: TimerConfig,
    #[serde(default)]
    pub buttons: Vec<ButtonConfig>,
    #[serde(default)]
    pub leds: Vec<LedConfig>,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub simulation: Option<SimulationConfig>,
}

/// Debounce timer clocking. The source clock is prescaled down to
/// `prescaled_hz`, then divided to the tick rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerConfig {
    pub source_clock_hz: u32,
    pub prescaled_hz: u32,
    pub tick_hz: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonConfig {
    pub id: u8,
    pub pin: PinId,
    /// Edge reported when the button is pressed
    pub edge: Edge,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedConfig {
    pub id: u8,
    pub pin: PinId,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub chip_select_pin: PinId,
    pub enable_pin: PinId,
    pub data_ready_pin: PinId,
    pub buffer_capacity: usize,
    /// Address of the SPI data register used as the DMA peripheral side
    pub spi_data_register: u32,
    /// Filler shifted out while receiving
    pub dummy_byte: u8,
    /// Bytes clocked in for each receive transaction
    pub receive_length: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    pub interval_ms: u64,
}

/// Stimulus applied to the simulated board by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub press_interval_ms: u64,
    #[serde(default = "default_bounce_cycles")]
    pub bounce_cycles: usize,
    #[serde(default)]
    pub peer_frame: Vec<u8>,
    #[serde(default)]
    pub peer_interval_ms: Option<u64>,
}

fn default_bounce_cycles() -> usize {
    3
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            source_clock_hz: 72_000_000,
            prescaled_hz: 10_000,
            tick_hz: 100,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chip_select_pin: 12,
            enable_pin: 8,
            data_ready_pin: 11,
            buffer_capacity: DEFAULT_BUFFER_SIZE,
            spi_data_register: 0x4000_380C,
            dummy_byte: 0x00,
            receive_length: 16,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { interval_ms: 5 }
    }
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            timer: TimerConfig::default(),
            buttons: vec![ButtonConfig {
                id: 0,
                pin: 2,
                edge: Edge::Falling,
                description: Some("mode".to_string()),
            }],
            leds: vec![
                LedConfig {
                    id: 0,
                    pin: 13,
                    description: Some("status".to_string()),
                },
                LedConfig {
                    id: 1,
                    pin: 14,
                    description: None,
                },
            ],
            transport: TransportConfig::default(),
            polling: PollingConfig::default(),
            simulation: None,
        }
    }
}

impl ButtonConfig {
    /// Level the line settles at while the button is held.
    pub fn pressed_level(&self) -> Level {
        match self.edge {
            Edge::Rising => Level::High,
            Edge::Falling | Edge::Both => Level::Low,
        }
    }
}

impl TimerConfig {
    /// Register values: `prescaler = source / prescaled - 1` and
    /// `autoreload = prescaled / tick - 1`, both 16 bits wide.
    pub fn settings(&self) -> Result<TimerSettings, DebounceError> {
        let invalid = |reason: String| Err(DebounceError::Configuration(reason));
        if self.source_clock_hz == 0 || self.prescaled_hz == 0 || self.tick_hz == 0 {
            return invalid("timer frequencies must be non-zero".to_string());
        }
        if self.source_clock_hz % self.prescaled_hz != 0 {
            return invalid(format!(
                "{} Hz source cannot be prescaled to {} Hz",
                self.source_clock_hz, self.prescaled_hz
            ));
        }
        if self.prescaled_hz % self.tick_hz != 0 {
            return invalid(format!(
                "{} Hz cannot be divided to a {} Hz tick",
                self.prescaled_hz, self.tick_hz
            ));
        }
        if self.tick_hz > 1000 {
            return invalid(format!("{} Hz tick is shorter than 1 ms", self.tick_hz));
        }
        // The one-shot is armed in whole milliseconds
        if 1000 % self.tick_hz != 0 {
            return invalid(format!(
                "{} Hz tick is not a whole number of milliseconds",
                self.tick_hz
            ));
        }
        let prescaler = u16::try_from(self.source_clock_hz / self.prescaled_hz - 1);
        let autoreload = u16::try_from(self.prescaled_hz / self.tick_hz - 1);
        match (prescaler, autoreload) {
            (Ok(prescaler), Ok(autoreload)) => Ok(TimerSettings {
                prescaler,
                autoreload,
            }),
            _ => invalid("timer divisors exceed 16 bits".to_string()),
        }
    }

    pub fn period_ms(&self) -> u32 {
        1000 / self.tick_hz.max(1)
    }
}

impl BoardConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let mut config: BoardConfig =
            serde_yaml::from_str(&content).context("Failed to parse configuration file")?;
        config.buttons.sort_by(|a, b| a.id.cmp(&b.id));
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        // Button IDs index the debounce channels, so they must run 0..n
        for (index, button) in self.buttons.iter().enumerate() {
            if button.id as usize != index {
                anyhow::bail!(
                    "Configuration error for button IDs, they must be consecutive starting from zero."
                );
            }
        }

        let mut pins = HashSet::new();
        let transport = &self.transport;
        let all_pins = self
            .buttons
            .iter()
            .map(|b| b.pin)
            .chain(self.leds.iter().map(|l| l.pin))
            .chain([
                transport.chip_select_pin,
                transport.enable_pin,
                transport.data_ready_pin,
            ]);
        for pin in all_pins {
            if !pins.insert(pin) {
                anyhow::bail!("Pin {} is assigned more than once", pin);
            }
        }

        self.timer
            .settings()
            .context("Invalid debounce timer configuration")?;

        if transport.buffer_capacity == 0 || transport.buffer_capacity > MAX_DMA_LENGTH {
            anyhow::bail!(
                "Transport buffer capacity must be within 1..={}",
                MAX_DMA_LENGTH
            );
        }
        if transport.receive_length == 0 || transport.receive_length > transport.buffer_capacity {
            anyhow::bail!("Receive length must fit the transport buffer");
        }
        Ok(())
    }
}
