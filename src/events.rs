use crate::debounce::ButtonId;

/// Event messages sent from the daemon to the main loop. `ButtonPressed`
/// is sent once per settled transition, `DataReady` when the co-processor
/// asks to be read and `FrameReceived` once its frame has arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventMessage {
    ButtonPressed {
        button: ButtonId,
        description: Option<String>,
    },
    DataReady,
    FrameReceived(Vec<u8>),
}
