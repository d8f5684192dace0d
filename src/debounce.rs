//! Button debounce driven by an edge interrupt and a one-shot timer.
//!
//! The first edge on a button masks that button's line and arms the timer.
//! Bounce noise during the window never reaches the engine. When the timer
//! expires the button gets a latched `debounced` event, its line is unmasked
//! and the timer is stopped. The latch is a one-shot mailbox: reading it
//! clears it.
//!
//! One timer serves every button. The engine records which button armed it
//! and only that button is resolved on expiry; edges from other buttons
//! while the window is open are dropped.

use log::{debug, warn};
use parking_lot::Mutex;

use crate::config::ButtonConfig;
use crate::error::DebounceError;
use crate::hal::{DigitalIo, Edge, Level, OneShotTimer, PinId, Priority};

pub type ButtonId = u8;

#[derive(Debug, Clone)]
pub struct ButtonChannel {
    pub id: ButtonId,
    pub pin: PinId,
    pub edge: Edge,
    /// Edge seen, debounce window open
    pub pending: bool,
    /// Settled transition waiting to be consumed
    pub debounced: bool,
    /// Level sampled when the last window closed
    pub settled: Option<Level>,
}

#[derive(Debug)]
struct DebounceState {
    channels: Vec<ButtonChannel>,
    armed_by: Option<ButtonId>,
}

impl DebounceState {
    fn channel(&self, button: ButtonId) -> Result<&ButtonChannel, DebounceError> {
        self.channels
            .get(button as usize)
            .ok_or(DebounceError::UnknownButton(button))
    }

    fn channel_mut(&mut self, button: ButtonId) -> Result<&mut ButtonChannel, DebounceError> {
        self.channels
            .get_mut(button as usize)
            .ok_or(DebounceError::UnknownButton(button))
    }
}

/// Every operation runs with the engine's state locked, which stands in for
/// masking the timer and button interrupts around the critical section.
#[derive(Debug)]
pub struct DebounceEngine {
    period_ms: u32,
    state: Mutex<DebounceState>,
}

impl DebounceEngine {
    /// Buttons must be ordered by id, ids running from zero.
    pub fn new(buttons: &[ButtonConfig], period_ms: u32) -> Self {
        let channels = buttons
            .iter()
            .map(|b| ButtonChannel {
                id: b.id,
                pin: b.pin,
                edge: b.edge,
                pending: false,
                debounced: false,
                settled: None,
            })
            .collect();
        DebounceEngine {
            period_ms,
            state: Mutex::new(DebounceState {
                channels,
                armed_by: None,
            }),
        }
    }

    pub fn period_ms(&self) -> u32 {
        self.period_ms
    }

    /// Configure each button line for its edge at the lowest priority tier,
    /// clear all flags and unmask the lines.
    pub fn init<H>(&self, hal: &mut H) -> Result<(), DebounceError>
    where
        H: DigitalIo + OneShotTimer,
    {
        let mut state = self.state.lock();
        hal.stop();
        state.armed_by = None;
        for channel in state.channels.iter_mut() {
            hal.configure_edge_interrupt(channel.pin, channel.edge, Priority::ButtonEdge)?;
            channel.pending = false;
            channel.debounced = false;
            channel.settled = hal.read_pin(channel.pin).ok();
            hal.enable_interrupt(channel.pin)?;
            debug!(
                "Button {} on pin {} armed for {:?} edges",
                channel.id, channel.pin, channel.edge
            );
        }
        Ok(())
    }

    pub fn button_for_pin(&self, pin: PinId) -> Option<ButtonId> {
        self.state
            .lock()
            .channels
            .iter()
            .find(|c| c.pin == pin)
            .map(|c| c.id)
    }

    /// Edge interrupt handler.
    pub fn on_edge<H>(&self, hal: &mut H, button: ButtonId) -> Result<(), DebounceError>
    where
        H: DigitalIo + OneShotTimer,
    {
        let mut state = self.state.lock();
        let pin = state.channel(button)?.pin;
        if let Some(armed) = state.armed_by {
            debug!(
                "Button {} edge ignored, window open for button {}",
                button, armed
            );
            return Ok(());
        }

        hal.disable_interrupt(pin)?;
        let channel = state.channel_mut(button)?;
        channel.pending = true;
        state.armed_by = Some(button);
        hal.start_one_shot(self.period_ms);
        debug!("Button {} edge, debounce timer armed", button);
        Ok(())
    }

    /// Timer interrupt handler. Returns the button that settled, if any.
    pub fn on_timer_expiry<H>(&self, hal: &mut H) -> Result<Option<ButtonId>, DebounceError>
    where
        H: DigitalIo + OneShotTimer,
    {
        let mut state = self.state.lock();
        let Some(button) = state.armed_by.take() else {
            warn!("Debounce timer expired with no button armed");
            hal.stop();
            return Ok(None);
        };

        let channel = state.channel_mut(button)?;
        let pin = channel.pin;
        channel.pending = false;
        channel.debounced = true;
        channel.settled = hal.read_pin(pin).ok();
        let settled = channel.settled;

        hal.enable_interrupt(pin)?;
        hal.stop();
        debug!("Button {} settled at {:?}", button, settled);
        Ok(Some(button))
    }

    /// Whether a settled transition happened since the last call.
    pub fn read_and_clear(&self, button: ButtonId) -> Result<bool, DebounceError> {
        let mut state = self.state.lock();
        let channel = state.channel_mut(button)?;
        Ok(std::mem::take(&mut channel.debounced))
    }

    /// Instantaneous pin level, high as `true`.
    pub fn read_raw<H: DigitalIo>(&self, hal: &mut H, button: ButtonId) -> Result<bool, DebounceError> {
        let pin = self.state.lock().channel(button)?.pin;
        Ok(hal.read_pin(pin)?.is_high())
    }

    pub fn settled_level(&self, button: ButtonId) -> Result<Option<Level>, DebounceError> {
        Ok(self.state.lock().channel(button)?.settled)
    }

    pub fn is_pending(&self, button: ButtonId) -> Result<bool, DebounceError> {
        Ok(self.state.lock().channel(button)?.pending)
    }

    /// Button whose edge opened the current window
    pub fn armed_by(&self) -> Option<ButtonId> {
        self.state.lock().armed_by
    }

    pub fn button_count(&self) -> usize {
        self.state.lock().channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{InterruptSource, Irq};
    use crate::sim::{HalOp, SimHal};
    use std::time::Duration;

    const BUTTON_PIN: PinId = 2;
    const OTHER_PIN: PinId = 3;

    fn buttons() -> Vec<ButtonConfig> {
        vec![
            ButtonConfig {
                id: 0,
                pin: BUTTON_PIN,
                edge: Edge::Falling,
                description: None,
            },
            ButtonConfig {
                id: 1,
                pin: OTHER_PIN,
                edge: Edge::Falling,
                description: None,
            },
        ]
    }

    fn setup() -> (DebounceEngine, SimHal) {
        let mut hal = SimHal::new();
        hal.set_level(BUTTON_PIN, Level::High);
        hal.set_level(OTHER_PIN, Level::High);
        let engine = DebounceEngine::new(&buttons(), 10);
        engine.init(&mut hal).unwrap();
        (engine, hal)
    }

    /// Dispatch what the simulated lines raised, the way the board does.
    fn service(engine: &DebounceEngine, hal: &mut SimHal) {
        while let Some(irq) = hal.take_pending() {
            match irq {
                Irq::Exti(pin) => {
                    let button = engine.button_for_pin(pin).unwrap();
                    engine.on_edge(hal, button).unwrap();
                }
                Irq::DebounceTimer => {
                    engine.on_timer_expiry(hal).unwrap();
                }
                Irq::DmaTransmitComplete => unreachable!(),
            }
        }
    }

    #[test]
    fn test_press_reported_once() {
        let (engine, mut hal) = setup();
        hal.drive_pin(BUTTON_PIN, Level::Low).unwrap();
        service(&engine, &mut hal);
        assert!(engine.is_pending(0).unwrap());
        assert!(hal.is_running());
        assert!(!hal.interrupt_enabled(BUTTON_PIN));

        hal.advance(Duration::from_millis(10));
        service(&engine, &mut hal);

        assert!(!engine.is_pending(0).unwrap());
        assert!(hal.interrupt_enabled(BUTTON_PIN));
        assert!(!hal.is_running());
        assert!(engine.read_and_clear(0).unwrap());
        assert!(!engine.read_and_clear(0).unwrap());
    }

    #[test]
    fn test_bounce_burst_yields_single_event() {
        let (engine, mut hal) = setup();
        hal.drive_pin(BUTTON_PIN, Level::Low).unwrap();
        service(&engine, &mut hal);
        hal.bounce(BUTTON_PIN, Level::Low, 5).unwrap();
        service(&engine, &mut hal);

        let starts = hal
            .journal()
            .iter()
            .filter(|op| matches!(op, HalOp::TimerStart(_)))
            .count();
        assert_eq!(starts, 1);

        hal.advance(Duration::from_millis(10));
        service(&engine, &mut hal);
        assert!(engine.read_and_clear(0).unwrap());
        assert!(!engine.read_and_clear(0).unwrap());
        assert_eq!(engine.settled_level(0).unwrap(), Some(Level::Low));
    }

    #[test]
    fn test_edge_while_armed_does_not_restart_timer() {
        let (engine, mut hal) = setup();
        engine.on_edge(&mut hal, 0).unwrap();
        hal.advance(Duration::from_millis(6));
        engine.on_edge(&mut hal, 0).unwrap();
        engine.on_edge(&mut hal, 1).unwrap();

        // First window still closes at 10 ms
        hal.advance(Duration::from_millis(4));
        assert_eq!(hal.take_pending(), Some(Irq::DebounceTimer));
        assert_eq!(engine.on_timer_expiry(&mut hal).unwrap(), Some(0));
        assert!(!engine.read_and_clear(1).unwrap());
        assert!(!engine.is_pending(1).unwrap());
    }

    #[test]
    fn test_expiry_resolves_arming_button() {
        let (engine, mut hal) = setup();
        engine.on_edge(&mut hal, 1).unwrap();
        assert_eq!(engine.armed_by(), Some(1));
        assert_eq!(engine.on_timer_expiry(&mut hal).unwrap(), Some(1));
        assert!(!engine.read_and_clear(0).unwrap());
        assert!(engine.read_and_clear(1).unwrap());
    }

    #[test]
    fn test_spurious_expiry_stops_timer() {
        let (engine, mut hal) = setup();
        hal.start_one_shot(10);
        assert_eq!(engine.on_timer_expiry(&mut hal).unwrap(), None);
        assert!(!hal.is_running());
        assert!(!engine.read_and_clear(0).unwrap());
    }

    #[test]
    fn test_read_raw_has_no_side_effects() {
        let (engine, mut hal) = setup();
        assert!(engine.read_raw(&mut hal, 0).unwrap());
        hal.drive_pin(BUTTON_PIN, Level::Low).unwrap();
        assert!(!engine.read_raw(&mut hal, 0).unwrap());
        assert!(!engine.is_pending(0).unwrap());
        assert!(!engine.read_and_clear(0).unwrap());
    }

    #[test]
    fn test_unknown_button() {
        let (engine, mut hal) = setup();
        assert_eq!(
            engine.read_and_clear(7),
            Err(DebounceError::UnknownButton(7))
        );
        assert_eq!(
            engine.on_edge(&mut hal, 7),
            Err(DebounceError::UnknownButton(7))
        );
    }

    #[test]
    fn test_second_press_after_window() {
        let (engine, mut hal) = setup();
        for _ in 0..2 {
            hal.drive_pin(BUTTON_PIN, Level::Low).unwrap();
            service(&engine, &mut hal);
            hal.advance(Duration::from_millis(10));
            service(&engine, &mut hal);
            assert!(engine.read_and_clear(0).unwrap());
            hal.drive_pin(BUTTON_PIN, Level::High).unwrap();
        }
        assert!(!engine.read_and_clear(0).unwrap());
    }
}
