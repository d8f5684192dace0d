//! Board I/O layer for an MCU paired with a wireless co-processor.
//!
//! Debounced buttons, indicator LEDs and the SPI/DMA transport to the
//! co-processor, written against the boundary traits in [`hal`] so the same
//! logic runs on hardware or on the in-memory [`sim::SimHal`].

pub mod board;
pub mod config;
pub mod daemon;
pub mod debounce;
pub mod error;
pub mod events;
pub mod hal;
pub mod led;
pub mod sim;
pub mod transport;

// Re-export main types for convenience
pub use board::Board;
pub use config::BoardConfig;
pub use daemon::Daemon;
pub use debounce::DebounceEngine;
pub use error::{DebounceError, FatalError, HalError, TransportError};
pub use events::EventMessage;
pub use transport::{TransportController, TransportState};
