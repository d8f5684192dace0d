use crate::hal::{Direction, PinId};
use crate::debounce::ButtonId;

/// Failures reported by the pin, timer and DMA boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HalError {
    #[error("Unknown pin {0}")]
    UnknownPin(PinId),
    #[error("Timer configuration failed: {0}")]
    Timer(String),
    #[error("DMA {direction} channel error: {reason}")]
    Dma { direction: Direction, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DebounceError {
    #[error("Unknown button {0}")]
    UnknownButton(ButtonId),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Hal(#[from] HalError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// A transfer in this direction is still in flight; retry after completion.
    #[error("{0} buffer busy")]
    BufferBusy(Direction),
    /// The transport was powered down and must be re-initialized.
    #[error("Transport disabled")]
    TransportDisabled,
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Hal(#[from] HalError),
}

/// An initialization step failed. The board must not run with a partially
/// configured peripheral, so these are never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FatalError {
    #[error("Invalid board configuration: {0}")]
    Config(String),
    #[error("Debounce timer setup failed: {0}")]
    Timer(HalError),
    #[error("Pin setup failed: {0}")]
    Pin(HalError),
    #[error("Transport setup failed: {0}")]
    Transport(TransportError),
}
