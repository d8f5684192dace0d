pub mod buffer;
pub mod controller;

pub use buffer::{BufferHandle, BufferState, TransportBuffers, DEFAULT_BUFFER_SIZE, MAX_DMA_LENGTH};
pub use controller::{TransportController, TransportState};
