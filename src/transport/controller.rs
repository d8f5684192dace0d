//! SPI/DMA transport to the wireless co-processor.
//!
//! Every exchange is full duplex: a send clocks in (and discards) whatever
//! the co-processor shifts out, a receive shifts out dummy bytes. The
//! transmit DMA channel's completion interrupt ends the transaction.

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::buffer::{BufferHandle, TransportBuffers};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::hal::{ChannelConfig, DigitalIo, Direction, DmaEngine, Edge, Level, PinId, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    CsAsserted,
    TransferArmed,
    TransferComplete,
    Disabled,
}

impl TransportState {
    /// Legal moves of the transaction state machine. Leaving `Disabled`
    /// is not a transition; only [`TransportController::init`] does it.
    pub fn can_transition_to(self, next: TransportState) -> bool {
        use TransportState::*;
        matches!(
            (self, next),
            (_, Disabled)
                | (Idle, CsAsserted)
                | (CsAsserted, TransferArmed)
                | (CsAsserted, Idle)
                | (TransferArmed, TransferComplete)
                | (TransferComplete, Idle)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionKind {
    Send,
    Receive,
}

#[derive(Debug)]
struct Session {
    state: TransportState,
    buffers: TransportBuffers,
    transaction: Option<TransactionKind>,
    data_ready: bool,
}

impl Session {
    fn transition(&mut self, next: TransportState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transport transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!("Transport {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Refuse to start while disabled, mid-transaction or holding an
    /// unread inbound frame.
    fn check_can_start(&self) -> Result<(), TransportError> {
        match self.state {
            TransportState::Disabled => Err(TransportError::TransportDisabled),
            TransportState::Idle => {
                if self.buffers.contents(Direction::Receive).is_some() {
                    Err(TransportError::BufferBusy(Direction::Receive))
                } else {
                    Ok(())
                }
            }
            _ => Err(TransportError::BufferBusy(Direction::Transmit)),
        }
    }
}

type DataReadyCallback = Box<dyn Fn() + Send + 'static>;

pub struct TransportController {
    chip_select: PinId,
    enable: PinId,
    data_ready: PinId,
    spi_data_register: u32,
    dummy_byte: u8,
    session: Mutex<Session>,
    on_data_ready: Mutex<Option<DataReadyCallback>>,
}

impl TransportController {
    /// The controller starts `Disabled`; call [`init`](Self::init) before use.
    pub fn new(config: &TransportConfig) -> Self {
        TransportController {
            chip_select: config.chip_select_pin,
            enable: config.enable_pin,
            data_ready: config.data_ready_pin,
            spi_data_register: config.spi_data_register,
            dummy_byte: config.dummy_byte,
            session: Mutex::new(Session {
                state: TransportState::Disabled,
                buffers: TransportBuffers::new(config.buffer_capacity),
                transaction: None,
                data_ready: false,
            }),
            on_data_ready: Mutex::new(None),
        }
    }

    pub fn data_ready_pin(&self) -> PinId {
        self.data_ready
    }

    pub fn state(&self) -> TransportState {
        self.session.lock().state
    }

    pub fn capacity(&self) -> usize {
        self.session.lock().buffers.capacity()
    }

    /// Bring the lines to their idle levels and reset both buffers. Valid
    /// from any state, including `Disabled`. The co-processor stays
    /// unpowered and data-ready stays masked until [`power_up`](Self::power_up).
    pub fn init<H>(&self, hal: &mut H) -> Result<(), TransportError>
    where
        H: DigitalIo + DmaEngine,
    {
        let mut session = self.session.lock();
        Self::reclaim(hal, &mut session.buffers);
        hal.set_spi_enabled(false);

        hal.configure_output(self.chip_select, Level::High)?;
        hal.configure_output(self.enable, Level::Low)?;
        hal.configure_edge_interrupt(self.data_ready, Edge::Falling, Priority::DataReadyAndTimer)?;
        hal.disable_interrupt(self.data_ready)?;

        session.buffers.reset_all();
        session.transaction = None;
        session.data_ready = false;
        if session.state != TransportState::Idle {
            debug!("Transport {:?} -> Idle (init)", session.state);
        }
        session.state = TransportState::Idle;
        info!(
            "Transport initialized: cs={} en={} irq={} capacity={}",
            self.chip_select,
            self.enable,
            self.data_ready,
            session.buffers.capacity()
        );
        Ok(())
    }

    /// Power the co-processor and start listening for data-ready.
    pub fn power_up<H: DigitalIo>(&self, hal: &mut H) -> Result<(), TransportError> {
        let session = self.session.lock();
        if session.state == TransportState::Disabled {
            return Err(TransportError::TransportDisabled);
        }
        hal.write_pin(self.enable, Level::High)?;
        hal.enable_interrupt(self.data_ready)?;
        info!("Co-processor powered up");
        Ok(())
    }

    /// Stop everything. An in-flight transfer is abandoned and its data
    /// discarded. Only [`init`](Self::init) leaves the resulting state.
    pub fn power_down<H>(&self, hal: &mut H) -> Result<(), TransportError>
    where
        H: DigitalIo + DmaEngine,
    {
        let mut session = self.session.lock();
        if session.transaction.is_some() {
            warn!("Powering down with a transfer in flight, data discarded");
        }
        session.transition(TransportState::Disabled);
        session.transaction = None;
        session.data_ready = false;

        Self::reclaim(hal, &mut session.buffers);
        session.buffers.reset_all();
        hal.set_spi_enabled(false);

        hal.disable_interrupt(self.data_ready)?;
        hal.write_pin(self.enable, Level::Low)?;
        hal.write_pin(self.chip_select, Level::High)?;
        info!("Transport powered down");
        Ok(())
    }

    /// Start a full-duplex exchange carrying `bytes` out. Completion is
    /// reported by the DMA interrupt through [`on_dma_complete`](Self::on_dma_complete).
    pub fn send<H>(&self, hal: &mut H, bytes: &[u8]) -> Result<(), TransportError>
    where
        H: DigitalIo + DmaEngine,
    {
        let mut session = self.session.lock();
        session.check_can_start()?;
        self.start_transaction(hal, &mut session, bytes, TransactionKind::Send)
    }

    /// Clock in `len` bytes from the co-processor, shifting out dummy bytes.
    /// The frame becomes available to [`try_receive`](Self::try_receive).
    pub fn begin_receive<H>(&self, hal: &mut H, len: usize) -> Result<(), TransportError>
    where
        H: DigitalIo + DmaEngine,
    {
        let mut session = self.session.lock();
        session.check_can_start()?;
        if len == 0 || len > session.buffers.capacity() {
            return Err(TransportError::Configuration(format!(
                "receive length {} outside 1..={}",
                len,
                session.buffers.capacity()
            )));
        }
        let filler = vec![self.dummy_byte; len];
        self.start_transaction(hal, &mut session, &filler, TransactionKind::Receive)
    }

    fn start_transaction<H>(
        &self,
        hal: &mut H,
        session: &mut Session,
        outbound: &[u8],
        kind: TransactionKind,
    ) -> Result<(), TransportError>
    where
        H: DigitalIo + DmaEngine,
    {
        let len = outbound.len();
        let tx = session.buffers.acquire_for_transmit(outbound)?;
        let rx = match session.buffers.acquire_for_receive(len) {
            Ok(rx) => rx,
            Err(e) => {
                Self::abandon(&mut session.buffers, [tx]);
                return Err(e);
            }
        };

        session.transition(TransportState::CsAsserted);
        let setup = hal
            .write_pin(self.chip_select, Level::Low)
            .and_then(|_| hal.configure_channel(self.channel(Direction::Receive, len)))
            .and_then(|_| hal.configure_channel(self.channel(Direction::Transmit, len)));
        if let Err(e) = setup {
            warn!("Transfer setup failed, releasing chip-select: {}", e);
            if let Err(e) = hal.write_pin(self.chip_select, Level::High) {
                warn!("Failed to release chip-select: {}", e);
            }
            session.transition(TransportState::Idle);
            Self::abandon(&mut session.buffers, [tx, rx]);
            return Err(e.into());
        }

        hal.set_spi_enabled(true);
        hal.start_channel(rx);
        hal.start_channel(tx);
        session.transaction = Some(kind);
        session.transition(TransportState::TransferArmed);
        debug!("{:?} of {} bytes armed", kind, len);
        Ok(())
    }

    fn channel(&self, direction: Direction, length: usize) -> ChannelConfig {
        ChannelConfig {
            direction,
            peripheral: self.spi_data_register,
            length,
        }
    }

    /// Return handles that never reached a channel and recycle their buffers.
    fn abandon<const N: usize>(buffers: &mut TransportBuffers, handles: [BufferHandle; N]) {
        for handle in handles {
            let direction = handle.direction();
            if let Err(e) = buffers.release_on_complete(handle) {
                warn!("Failed to return {} buffer: {}", direction, e);
            }
            buffers.reset(direction);
        }
    }

    /// Stop both channels and take back whatever memory they held.
    fn reclaim<H: DmaEngine>(hal: &mut H, buffers: &mut TransportBuffers) {
        for direction in [Direction::Transmit, Direction::Receive] {
            if let Some(handle) = hal.stop_channel(direction) {
                if let Err(e) = buffers.release_on_complete(handle) {
                    warn!("Failed to reclaim {} buffer: {}", direction, e);
                }
            }
        }
    }

    /// DMA transmit-complete interrupt handler.
    pub fn on_dma_complete<H>(&self, hal: &mut H) -> Result<(), TransportError>
    where
        H: DigitalIo + DmaEngine,
    {
        let mut session = self.session.lock();
        if session.state != TransportState::TransferArmed {
            warn!("DMA complete while {:?}, ignored", session.state);
            return Ok(());
        }
        session.transition(TransportState::TransferComplete);
        let kind = session.transaction.take();

        let mut released = Ok(());
        for direction in [Direction::Transmit, Direction::Receive] {
            match hal.stop_channel(direction) {
                Some(handle) => {
                    if let Err(e) = session.buffers.release_on_complete(handle) {
                        released = released.and(Err(e));
                    }
                }
                None => {
                    warn!("{} channel held no buffer at completion", direction);
                    session.buffers.reset(direction);
                }
            }
        }
        // Bytes clocked in during a send carry nothing
        if kind != Some(TransactionKind::Receive) {
            session.buffers.reset(Direction::Receive);
        }

        let deasserted = hal.write_pin(self.chip_select, Level::High);
        session.transition(TransportState::Idle);
        debug!("{:?} complete", kind);
        deasserted?;
        released
    }

    /// Data-ready interrupt handler. Records the request and runs the
    /// notification hook. The hook must not call back into the controller.
    pub fn on_data_ready(&self) {
        {
            let mut session = self.session.lock();
            if session.state == TransportState::Disabled {
                warn!("Data-ready while disabled, ignored");
                return;
            }
            session.data_ready = true;
        }
        debug!("Co-processor signalled data ready");
        if let Some(callback) = self.on_data_ready.lock().as_ref() {
            callback();
        }
    }

    pub fn set_on_data_ready<F>(&self, callback: F)
    where
        F: Fn() + Send + 'static,
    {
        *self.on_data_ready.lock() = Some(Box::new(callback));
    }

    pub fn clear_on_data_ready(&self) {
        *self.on_data_ready.lock() = None;
    }

    /// Whether data-ready fired since the last call.
    pub fn take_data_ready(&self) -> bool {
        std::mem::take(&mut self.session.lock().data_ready)
    }

    /// Instantaneous level of the active-low data-ready line.
    pub fn data_ready_asserted<H: DigitalIo>(&self, hal: &mut H) -> Result<bool, TransportError> {
        Ok(hal.read_pin(self.data_ready)?.is_low())
    }

    pub fn enable_data_ready_interrupt<H: DigitalIo>(&self, hal: &mut H) -> Result<(), TransportError> {
        if self.state() == TransportState::Disabled {
            return Err(TransportError::TransportDisabled);
        }
        hal.enable_interrupt(self.data_ready)?;
        Ok(())
    }

    pub fn disable_data_ready_interrupt<H: DigitalIo>(&self, hal: &mut H) -> Result<(), TransportError> {
        hal.disable_interrupt(self.data_ready)?;
        Ok(())
    }

    /// Take the completed inbound frame, if any.
    pub fn try_receive(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut session = self.session.lock();
        if session.state == TransportState::Disabled {
            return Err(TransportError::TransportDisabled);
        }
        Ok(session.buffers.take_received())
    }

    /// Bytes shifted out by the last completed transaction.
    pub fn last_transmitted(&self) -> Option<Vec<u8>> {
        self.session
            .lock()
            .buffers
            .contents(Direction::Transmit)
            .map(<[u8]>::to_vec)
    }
}
