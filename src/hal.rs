//! Boundary between the board logic and the peripherals it drives.
//!
//! Nothing above this module touches registers. A platform port implements
//! these traits; [`crate::sim::SimHal`] implements them in memory.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HalError;
use crate::transport::BufferHandle;

pub type PinId = u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }

    pub fn is_low(self) -> bool {
        self == Level::Low
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

impl std::ops::Not for Level {
    type Output = Level;

    fn not(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

/// Edge selection for line interrupts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    /// Whether a change from `from` to `to` triggers this edge.
    pub fn matches(self, from: Level, to: Level) -> bool {
        match (self, from, to) {
            (Edge::Rising, Level::Low, Level::High) => true,
            (Edge::Falling, Level::High, Level::Low) => true,
            (Edge::Both, a, b) => a != b,
            _ => false,
        }
    }
}

/// Interrupt priority tiers, highest first.
///
/// DMA completion outranks everything because it hands buffer ownership
/// back. A late button edge is recoverable, so it sits at the bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    DmaComplete = 0,
    DataReadyAndTimer = 1,
    ButtonEdge = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Receive,
    Transmit,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Receive => write!(f, "receive"),
            Direction::Transmit => write!(f, "transmit"),
        }
    }
}

/// Interrupt sources the board reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Irq {
    /// Edge detected on an external line
    Exti(PinId),
    /// Debounce timer expired
    DebounceTimer,
    /// Transmit DMA channel finished its transfer
    DmaTransmitComplete,
}

/// Prescaler and auto-reload values for the debounce timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSettings {
    pub prescaler: u16,
    pub autoreload: u16,
}

/// One DMA channel descriptor. Memory is supplied separately by
/// [`DmaEngine::start_channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub direction: Direction,
    /// Address of the SPI data register the channel reads from or writes to
    pub peripheral: u32,
    pub length: usize,
}

pub trait DigitalIo {
    fn read_pin(&mut self, pin: PinId) -> Result<Level, HalError>;
    fn write_pin(&mut self, pin: PinId, level: Level) -> Result<(), HalError>;
    fn configure_output(&mut self, pin: PinId, initial: Level) -> Result<(), HalError>;
    fn configure_edge_interrupt(
        &mut self,
        pin: PinId,
        edge: Edge,
        priority: Priority,
    ) -> Result<(), HalError>;
    fn enable_interrupt(&mut self, pin: PinId) -> Result<(), HalError>;
    fn disable_interrupt(&mut self, pin: PinId) -> Result<(), HalError>;
}

pub trait OneShotTimer {
    fn configure(&mut self, settings: TimerSettings) -> Result<(), HalError>;
    /// Arm the timer to fire once after `period_ms`.
    fn start_one_shot(&mut self, period_ms: u32);
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}

pub trait DmaEngine {
    fn configure_channel(&mut self, config: ChannelConfig) -> Result<(), HalError>;
    /// Hand `buffer` to the channel matching its direction and start it.
    fn start_channel(&mut self, buffer: BufferHandle);
    /// Stop a channel, returning the memory it was given, if any.
    fn stop_channel(&mut self, direction: Direction) -> Option<BufferHandle>;
    fn set_spi_enabled(&mut self, enabled: bool);
}

pub trait InterruptSource {
    /// Next pending interrupt, highest priority first.
    fn take_pending(&mut self) -> Option<Irq>;

    /// Let time pass. Real peripherals keep their own time.
    fn advance(&mut self, _elapsed: Duration) {}
}

/// Everything the board needs from a platform.
pub trait Hal: DigitalIo + OneShotTimer + DmaEngine + InterruptSource {}

impl<T> Hal for T where T: DigitalIo + OneShotTimer + DmaEngine + InterruptSource {}
