//! In-memory peripherals implementing the hardware boundary.
//!
//! Pins, the one-shot timer and the two DMA channels behave like their
//! hardware counterparts closely enough to exercise the interrupt flow:
//! masked lines drop edges, the timer stops itself after firing, and a DMA
//! exchange only happens with chip-select asserted and both channels armed.
//! Pending interrupts are released highest priority first.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use log::{debug, warn};

use crate::config::{BoardConfig, SimulationConfig};
use crate::error::HalError;
use crate::hal::{
    ChannelConfig, DigitalIo, Direction, DmaEngine, Edge, InterruptSource, Irq, Level,
    OneShotTimer, PinId, Priority, TimerSettings,
};
use crate::transport::{BufferHandle, MAX_DMA_LENGTH};

pub const SIM_PIN_COUNT: PinId = 64;

/// Boundary calls recorded in order, for sequencing checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HalOp {
    WritePin(PinId, Level),
    EnableInterrupt(PinId),
    DisableInterrupt(PinId),
    TimerConfigure(TimerSettings),
    TimerStart(u32),
    TimerStop,
    ConfigureChannel(Direction, usize),
    StartChannel(Direction),
    StopChannel(Direction),
    SpiEnabled(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PinMode {
    Input,
    Output,
}

#[derive(Debug)]
struct SimPin {
    level: Level,
    mode: PinMode,
    trigger: Option<(Edge, Priority)>,
    interrupt_enabled: bool,
}

#[derive(Debug, Default)]
struct SimTimer {
    settings: Option<TimerSettings>,
    remaining: Option<Duration>,
    reject_configuration: bool,
}

#[derive(Debug, Default)]
struct SimChannel {
    config: Option<ChannelConfig>,
    buffer: Option<BufferHandle>,
}

/// Transport wiring the SPI peer model needs to know about.
#[derive(Debug, Clone, Copy)]
struct PeerLines {
    chip_select: PinId,
    data_ready: PinId,
}

#[derive(Debug)]
pub struct SimHal {
    pins: BTreeMap<PinId, SimPin>,
    timer: SimTimer,
    rx: SimChannel,
    tx: SimChannel,
    spi_enabled: bool,
    peer_lines: Option<PeerLines>,
    peer_outbound: VecDeque<u8>,
    captured: Vec<Vec<u8>>,
    pending: BTreeSet<(Priority, u64, Irq)>,
    sequence: u64,
    journal: Vec<HalOp>,
}

impl SimHal {
    /// All pins start as floating inputs reading low.
    pub fn new() -> Self {
        let pins = (0..SIM_PIN_COUNT)
            .map(|pin| {
                (
                    pin,
                    SimPin {
                        level: Level::Low,
                        mode: PinMode::Input,
                        trigger: None,
                        interrupt_enabled: false,
                    },
                )
            })
            .collect();
        SimHal {
            pins,
            timer: SimTimer::default(),
            rx: SimChannel::default(),
            tx: SimChannel::default(),
            spi_enabled: false,
            peer_lines: None,
            peer_outbound: VecDeque::new(),
            captured: Vec::new(),
            pending: BTreeSet::new(),
            sequence: 0,
            journal: Vec::new(),
        }
    }

    /// A board wired as `config` describes: buttons rest at their released
    /// level, the data-ready line rests high, the SPI peer sits on the
    /// transport pins.
    pub fn from_config(config: &BoardConfig) -> Self {
        let mut hal = SimHal::new();
        for button in &config.buttons {
            hal.set_level(button.pin, !button.pressed_level());
        }
        hal.set_level(config.transport.data_ready_pin, Level::High);
        hal.peer_lines = Some(PeerLines {
            chip_select: config.transport.chip_select_pin,
            data_ready: config.transport.data_ready_pin,
        });
        hal
    }

    fn pin(&self, pin: PinId) -> Result<&SimPin, HalError> {
        self.pins.get(&pin).ok_or(HalError::UnknownPin(pin))
    }

    fn pin_mut(&mut self, pin: PinId) -> Result<&mut SimPin, HalError> {
        self.pins.get_mut(&pin).ok_or(HalError::UnknownPin(pin))
    }

    fn raise(&mut self, priority: Priority, irq: Irq) {
        self.sequence += 1;
        self.pending.insert((priority, self.sequence, irq));
        debug!("Sim: {:?} pending at {:?}", irq, priority);
    }

    /// Set a level without generating an edge.
    pub fn set_level(&mut self, pin: PinId, level: Level) {
        if let Some(p) = self.pins.get_mut(&pin) {
            p.level = level;
        }
    }

    /// Drive an input from outside the chip. Raises the line interrupt when
    /// the change matches its edge and the line is unmasked.
    pub fn drive_pin(&mut self, pin: PinId, level: Level) -> Result<(), HalError> {
        let p = self.pin_mut(pin)?;
        let previous = p.level;
        p.level = level;
        let fire = match p.trigger {
            Some((edge, priority)) if edge.matches(previous, level) => {
                if p.interrupt_enabled {
                    Some(priority)
                } else {
                    debug!("Sim: edge on masked pin {} dropped", pin);
                    None
                }
            }
            _ => None,
        };
        if let Some(priority) = fire {
            self.raise(priority, Irq::Exti(pin));
        }
        Ok(())
    }

    /// Contact bounce: `cycles` times away from `settle` and back.
    pub fn bounce(&mut self, pin: PinId, settle: Level, cycles: usize) -> Result<(), HalError> {
        for _ in 0..cycles {
            self.drive_pin(pin, !settle)?;
            self.drive_pin(pin, settle)?;
        }
        Ok(())
    }

    /// Queue bytes the co-processor will shift out and pull its data-ready
    /// line low.
    pub fn queue_peer_frame(&mut self, bytes: &[u8]) -> Result<(), HalError> {
        let lines = self
            .peer_lines
            .ok_or_else(|| HalError::Dma {
                direction: Direction::Receive,
                reason: "no SPI peer attached".to_string(),
            })?;
        self.peer_outbound.extend(bytes.iter().copied());
        self.drive_pin(lines.data_ready, Level::Low)
    }

    /// Perform the armed full-duplex exchange and raise transmit-complete.
    pub fn complete_dma(&mut self) -> Result<(), HalError> {
        let dma_error = |direction, reason: &str| HalError::Dma {
            direction,
            reason: reason.to_string(),
        };
        if let Some(lines) = self.peer_lines {
            if self.pin(lines.chip_select)?.level != Level::Low {
                return Err(dma_error(Direction::Transmit, "chip-select not asserted"));
            }
        }
        if !self.spi_enabled {
            return Err(dma_error(Direction::Transmit, "SPI disabled"));
        }
        let tx = self
            .tx
            .buffer
            .as_ref()
            .ok_or_else(|| dma_error(Direction::Transmit, "channel not started"))?;
        let frame = tx.as_slice().to_vec();
        let rx = self
            .rx
            .buffer
            .as_mut()
            .ok_or_else(|| dma_error(Direction::Receive, "channel not started"))?;
        for byte in rx.as_mut_slice() {
            *byte = self.peer_outbound.pop_front().unwrap_or(0);
        }
        self.captured.push(frame);

        if self.peer_outbound.is_empty() {
            if let Some(lines) = self.peer_lines {
                self.set_level(lines.data_ready, Level::High);
            }
        }
        self.raise(Priority::DmaComplete, Irq::DmaTransmitComplete);
        Ok(())
    }

    /// Make the next timer configuration fail.
    pub fn reject_timer_configuration(&mut self) {
        self.timer.reject_configuration = true;
    }

    pub fn level(&self, pin: PinId) -> Option<Level> {
        self.pins.get(&pin).map(|p| p.level)
    }

    pub fn interrupt_enabled(&self, pin: PinId) -> bool {
        self.pins.get(&pin).is_some_and(|p| p.interrupt_enabled)
    }

    pub fn timer_settings(&self) -> Option<TimerSettings> {
        self.timer.settings
    }

    pub fn spi_enabled(&self) -> bool {
        self.spi_enabled
    }

    pub fn channel_active(&self, direction: Direction) -> bool {
        match direction {
            Direction::Receive => self.rx.buffer.is_some(),
            Direction::Transmit => self.tx.buffer.is_some(),
        }
    }

    /// Frames the peer received, oldest first.
    pub fn captured_frames(&self) -> &[Vec<u8>] {
        &self.captured
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn journal(&self) -> &[HalOp] {
        &self.journal
    }

    pub fn clear_journal(&mut self) {
        self.journal.clear();
    }

    fn channel_mut(&mut self, direction: Direction) -> &mut SimChannel {
        match direction {
            Direction::Receive => &mut self.rx,
            Direction::Transmit => &mut self.tx,
        }
    }
}

impl Default for SimHal {
    fn default() -> Self {
        Self::new()
    }
}

impl DigitalIo for SimHal {
    fn read_pin(&mut self, pin: PinId) -> Result<Level, HalError> {
        Ok(self.pin(pin)?.level)
    }

    fn write_pin(&mut self, pin: PinId, level: Level) -> Result<(), HalError> {
        let p = self.pin_mut(pin)?;
        if p.mode != PinMode::Output {
            warn!("Sim: write to input pin {}", pin);
        }
        p.level = level;
        self.journal.push(HalOp::WritePin(pin, level));
        Ok(())
    }

    fn configure_output(&mut self, pin: PinId, initial: Level) -> Result<(), HalError> {
        let p = self.pin_mut(pin)?;
        p.mode = PinMode::Output;
        p.trigger = None;
        p.interrupt_enabled = false;
        p.level = initial;
        Ok(())
    }

    fn configure_edge_interrupt(
        &mut self,
        pin: PinId,
        edge: Edge,
        priority: Priority,
    ) -> Result<(), HalError> {
        let p = self.pin_mut(pin)?;
        p.mode = PinMode::Input;
        p.trigger = Some((edge, priority));
        Ok(())
    }

    fn enable_interrupt(&mut self, pin: PinId) -> Result<(), HalError> {
        self.pin_mut(pin)?.interrupt_enabled = true;
        self.journal.push(HalOp::EnableInterrupt(pin));
        Ok(())
    }

    fn disable_interrupt(&mut self, pin: PinId) -> Result<(), HalError> {
        self.pin_mut(pin)?.interrupt_enabled = false;
        self.journal.push(HalOp::DisableInterrupt(pin));
        Ok(())
    }
}

impl OneShotTimer for SimHal {
    fn configure(&mut self, settings: TimerSettings) -> Result<(), HalError> {
        if self.timer.reject_configuration {
            return Err(HalError::Timer(format!(
                "prescaler {} / autoreload {} rejected",
                settings.prescaler, settings.autoreload
            )));
        }
        self.timer.settings = Some(settings);
        self.journal.push(HalOp::TimerConfigure(settings));
        Ok(())
    }

    fn start_one_shot(&mut self, period_ms: u32) {
        if self.timer.settings.is_none() {
            warn!("Sim: timer started before configuration");
        }
        self.timer.remaining = Some(Duration::from_millis(u64::from(period_ms)));
        self.journal.push(HalOp::TimerStart(period_ms));
    }

    fn stop(&mut self) {
        self.timer.remaining = None;
        self.journal.push(HalOp::TimerStop);
    }

    fn is_running(&self) -> bool {
        self.timer.remaining.is_some()
    }
}

impl DmaEngine for SimHal {
    fn configure_channel(&mut self, config: ChannelConfig) -> Result<(), HalError> {
        if config.length == 0 || config.length > MAX_DMA_LENGTH {
            return Err(HalError::Dma {
                direction: config.direction,
                reason: format!("length {} out of range", config.length),
            });
        }
        self.channel_mut(config.direction).config = Some(config);
        self.journal
            .push(HalOp::ConfigureChannel(config.direction, config.length));
        Ok(())
    }

    fn start_channel(&mut self, buffer: BufferHandle) {
        let direction = buffer.direction();
        let channel = self.channel_mut(direction);
        if channel.config.is_none() {
            warn!("Sim: {} channel started without configuration", direction);
        }
        if channel.buffer.replace(buffer).is_some() {
            warn!("Sim: {} channel restarted while active", direction);
        }
        self.journal.push(HalOp::StartChannel(direction));
    }

    fn stop_channel(&mut self, direction: Direction) -> Option<BufferHandle> {
        self.journal.push(HalOp::StopChannel(direction));
        self.channel_mut(direction).buffer.take()
    }

    fn set_spi_enabled(&mut self, enabled: bool) {
        self.spi_enabled = enabled;
        self.journal.push(HalOp::SpiEnabled(enabled));
    }
}

impl InterruptSource for SimHal {
    fn take_pending(&mut self) -> Option<Irq> {
        self.pending.pop_first().map(|(_, _, irq)| irq)
    }

    fn advance(&mut self, elapsed: Duration) {
        let Some(remaining) = self.timer.remaining else {
            return;
        };
        if elapsed >= remaining {
            // One-pulse mode: the counter stops on update.
            self.timer.remaining = None;
            self.raise(Priority::DataReadyAndTimer, Irq::DebounceTimer);
        } else {
            self.timer.remaining = Some(remaining - elapsed);
        }
    }
}

/// Scripted activity for running the daemon without hardware: a button
/// pressed and released with contact bounce, the co-processor offering a
/// frame, and armed DMA transfers completed on the next step.
#[derive(Debug)]
pub struct SimStimulus {
    config: SimulationConfig,
    button: Option<(PinId, Level)>,
    since_press: Duration,
    since_frame: Duration,
    held: Option<Duration>,
}

impl SimStimulus {
    /// `None` unless the configuration has a `simulation` section. The first
    /// press and frame are due on the first step.
    pub fn from_config(config: &BoardConfig) -> Option<Self> {
        let simulation = config.simulation.clone()?;
        let button = config
            .buttons
            .first()
            .map(|b| (b.pin, b.pressed_level()));
        let press_interval = Duration::from_millis(simulation.press_interval_ms);
        let frame_interval = Duration::from_millis(simulation.peer_interval_ms.unwrap_or(0));
        Some(SimStimulus {
            config: simulation,
            button,
            since_press: press_interval,
            since_frame: frame_interval,
            held: None,
        })
    }

    pub fn step(&mut self, hal: &mut SimHal, elapsed: Duration) {
        if hal.channel_active(Direction::Transmit) {
            if let Err(e) = hal.complete_dma() {
                warn!("Sim: DMA completion failed: {}", e);
            }
        }
        if let Err(e) = self.step_button(hal, elapsed) {
            warn!("Sim: button stimulus failed: {}", e);
        }
        if let Err(e) = self.step_peer(hal, elapsed) {
            warn!("Sim: peer stimulus failed: {}", e);
        }
    }

    fn step_button(&mut self, hal: &mut SimHal, elapsed: Duration) -> Result<(), HalError> {
        let Some((pin, pressed)) = self.button else {
            return Ok(());
        };
        let interval = Duration::from_millis(self.config.press_interval_ms);
        self.since_press += elapsed;

        if let Some(held) = self.held.as_mut() {
            *held += elapsed;
            // Released half way to the next press
            if *held >= interval / 2 {
                self.held = None;
                hal.drive_pin(pin, !pressed)?;
                hal.bounce(pin, !pressed, self.config.bounce_cycles)?;
                debug!("Sim: button on pin {} released", pin);
            }
            return Ok(());
        }
        if self.since_press >= interval {
            self.since_press = Duration::ZERO;
            self.held = Some(Duration::ZERO);
            hal.drive_pin(pin, pressed)?;
            hal.bounce(pin, pressed, self.config.bounce_cycles)?;
            debug!("Sim: button on pin {} pressed", pin);
        }
        Ok(())
    }

    fn step_peer(&mut self, hal: &mut SimHal, elapsed: Duration) -> Result<(), HalError> {
        let Some(interval_ms) = self.config.peer_interval_ms else {
            return Ok(());
        };
        if self.config.peer_frame.is_empty() {
            return Ok(());
        }
        self.since_frame += elapsed;
        if self.since_frame >= Duration::from_millis(interval_ms) {
            self.since_frame = Duration::ZERO;
            hal.queue_peer_frame(&self.config.peer_frame)?;
            debug!("Sim: peer queued {} bytes", self.config.peer_frame.len());
        }
        Ok(())
    }
}
