//! The board: peripherals plus the logic driving them, and interrupt routing.
//!
//! The HAL sits behind a mutex. Holding it is the equivalent of running with
//! interrupts masked: handlers and foreground calls both take it, so neither
//! can observe the other half-way through. Lock order is always the HAL
//! first, then the engine's own state.

use std::time::Duration;

use log::{error, info, warn};
use parking_lot::Mutex;

use crate::config::{BoardConfig, ButtonConfig};
use crate::debounce::{ButtonId, DebounceEngine};
use crate::error::{DebounceError, FatalError, HalError, TransportError};
use crate::hal::{Hal, Irq, Level};
use crate::led::Led;
use crate::transport::{TransportController, TransportState};

pub struct Board<H: Hal> {
    hal: Mutex<H>,
    debounce: DebounceEngine,
    transport: TransportController,
    leds: Vec<Led>,
    buttons: Vec<ButtonConfig>,
}

impl<H: Hal> Board<H> {
    /// Bring up every peripheral. Any failure is fatal and the board is
    /// never handed out half-configured.
    pub fn init(mut hal: H, config: &BoardConfig) -> Result<Self, FatalError> {
        config
            .validate()
            .map_err(|e| FatalError::Config(format!("{:#}", e)))?;

        let leds: Vec<Led> = config.leds.iter().map(Led::new).collect();
        for led in &leds {
            led.init(&mut hal).map_err(FatalError::Pin)?;
        }

        // Timer first: an edge arriving once the lines are unmasked starts it
        let settings = config
            .timer
            .settings()
            .map_err(|e| FatalError::Config(e.to_string()))?;
        hal.configure(settings).map_err(FatalError::Timer)?;

        let debounce = DebounceEngine::new(&config.buttons, config.timer.period_ms());
        debounce.init(&mut hal).map_err(|e| match e {
            DebounceError::Hal(e) => FatalError::Pin(e),
            other => FatalError::Config(other.to_string()),
        })?;

        let transport = TransportController::new(&config.transport);
        transport.init(&mut hal).map_err(FatalError::Transport)?;

        info!(
            "Board initialized: {} button(s), {} LED(s), debounce period {}ms",
            config.buttons.len(),
            leds.len(),
            debounce.period_ms()
        );
        Ok(Board {
            hal: Mutex::new(hal),
            debounce,
            transport,
            leds,
            buttons: config.buttons.clone(),
        })
    }

    /// Run `f` with exclusive access to the peripherals.
    pub fn with_hal<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        f(&mut *self.hal.lock())
    }

    /// Route one interrupt to its handler. Handler failures are logged.
    pub fn on_interrupt(&self, irq: Irq) {
        let mut hal = self.hal.lock();
        let hal = &mut *hal;
        match irq {
            Irq::DmaTransmitComplete => {
                if let Err(e) = self.transport.on_dma_complete(hal) {
                    error!("DMA complete handler failed: {}", e);
                }
            }
            Irq::DebounceTimer => {
                if let Err(e) = self.debounce.on_timer_expiry(hal) {
                    error!("Debounce timer handler failed: {}", e);
                }
            }
            Irq::Exti(pin) if pin == self.transport.data_ready_pin() => {
                self.transport.on_data_ready();
            }
            Irq::Exti(pin) => match self.debounce.button_for_pin(pin) {
                Some(button) => {
                    if let Err(e) = self.debounce.on_edge(hal, button) {
                        error!("Button {} edge handler failed: {}", button, e);
                    }
                }
                None => warn!("Edge on unassigned pin {}", pin),
            },
        }
    }

    /// Handle everything pending, highest priority first. Returns the number
    /// of interrupts handled.
    pub fn service_pending(&self) -> usize {
        let mut serviced = 0;
        loop {
            let irq = self.hal.lock().take_pending();
            let Some(irq) = irq else {
                break;
            };
            self.on_interrupt(irq);
            serviced += 1;
        }
        serviced
    }

    pub fn advance(&self, elapsed: Duration) {
        self.hal.lock().advance(elapsed);
    }

    pub fn buttons(&self) -> &[ButtonConfig] {
        &self.buttons
    }

    pub fn read_and_clear(&self, button: ButtonId) -> Result<bool, DebounceError> {
        self.debounce.read_and_clear(button)
    }

    pub fn read_raw(&self, button: ButtonId) -> Result<bool, DebounceError> {
        self.debounce.read_raw(&mut *self.hal.lock(), button)
    }

    pub fn settled_level(&self, button: ButtonId) -> Result<Option<Level>, DebounceError> {
        self.debounce.settled_level(button)
    }

    pub fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.transport.send(&mut *self.hal.lock(), bytes)
    }

    pub fn begin_receive(&self, len: usize) -> Result<(), TransportError> {
        self.transport.begin_receive(&mut *self.hal.lock(), len)
    }

    pub fn try_receive(&self) -> Result<Option<Vec<u8>>, TransportError> {
        self.transport.try_receive()
    }

    pub fn last_transmitted(&self) -> Option<Vec<u8>> {
        self.transport.last_transmitted()
    }

    pub fn take_data_ready(&self) -> bool {
        self.transport.take_data_ready()
    }

    pub fn data_ready_asserted(&self) -> Result<bool, TransportError> {
        self.transport.data_ready_asserted(&mut *self.hal.lock())
    }

    /// Runs in interrupt context with the HAL held; it must not call back
    /// into the board.
    pub fn set_on_data_ready<F>(&self, callback: F)
    where
        F: Fn() + Send + 'static,
    {
        self.transport.set_on_data_ready(callback);
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport.state()
    }

    pub fn power_up(&self) -> Result<(), TransportError> {
        self.transport.power_up(&mut *self.hal.lock())
    }

    pub fn power_down(&self) -> Result<(), TransportError> {
        self.transport.power_down(&mut *self.hal.lock())
    }

    /// Full re-initialization, the only way out of a power-down.
    pub fn reinitialize_transport(&self) -> Result<(), TransportError> {
        let mut hal = self.hal.lock();
        self.transport.init(&mut *hal)?;
        self.transport.power_up(&mut *hal)
    }

    pub fn led(&self, id: u8) -> Option<&Led> {
        self.leds.iter().find(|l| l.id == id)
    }

    /// Returns whether the LED is now lit, or `None` for an unknown LED.
    pub fn toggle_led(&self, id: u8) -> Option<Result<bool, HalError>> {
        let led = self.led(id)?;
        Some(led.toggle(&mut *self.hal.lock()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{Direction, TimerSettings};
    use crate::sim::{HalOp, SimHal};

    const BUTTON_PIN: u8 = 2;

    fn board() -> (Board<SimHal>, BoardConfig) {
        let config = BoardConfig::default();
        let hal = SimHal::from_config(&config);
        let board = match Board::init(hal, &config) {
            Ok(board) => board,
            Err(e) => panic!("board init failed: {}", e),
        };
        (board, config)
    }

    fn press(board: &Board<SimHal>) {
        board.with_hal(|hal| {
            hal.drive_pin(BUTTON_PIN, Level::Low).unwrap();
            hal.bounce(BUTTON_PIN, Level::Low, 3).unwrap();
        });
        board.service_pending();
        board.advance(Duration::from_millis(10));
        board.service_pending();
    }

    #[test]
    fn test_init_configures_peripherals() {
        let (board, config) = board();
        board.with_hal(|hal| {
            assert_eq!(
                hal.timer_settings(),
                Some(TimerSettings {
                    prescaler: 7199,
                    autoreload: 99
                })
            );
            assert!(hal.interrupt_enabled(BUTTON_PIN));
            assert_eq!(hal.level(config.leds[0].pin), Some(Level::Low));
        });
        assert_eq!(board.transport_state(), TransportState::Idle);
    }

    #[test]
    fn test_timer_configured_before_buttons_unmasked() {
        let (board, _) = board();
        board.with_hal(|hal| {
            let journal = hal.journal();
            let timer = journal
                .iter()
                .position(|op| matches!(op, HalOp::TimerConfigure(_)))
                .unwrap();
            let unmask = journal
                .iter()
                .position(|op| *op == HalOp::EnableInterrupt(BUTTON_PIN))
                .unwrap();
            assert!(timer < unmask);
        });
    }

    #[test]
    fn test_timer_failure_is_fatal() {
        let config = BoardConfig::default();
        let mut hal = SimHal::from_config(&config);
        hal.reject_timer_configuration();
        assert!(matches!(
            Board::init(hal, &config),
            Err(FatalError::Timer(HalError::Timer(_)))
        ));
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let mut config = BoardConfig::default();
        config.buttons[0].id = 3;
        let hal = SimHal::from_config(&config);
        assert!(matches!(
            Board::init(hal, &config),
            Err(FatalError::Config(_))
        ));
    }

    #[test]
    fn test_bad_pin_is_fatal() {
        let mut config = BoardConfig::default();
        config.leds[1].pin = 250;
        let hal = SimHal::from_config(&config);
        assert!(matches!(
            Board::init(hal, &config),
            Err(FatalError::Pin(HalError::UnknownPin(250)))
        ));
    }

    #[test]
    fn test_button_press_routed() {
        let (board, _) = board();
        press(&board);
        assert!(board.read_and_clear(0).unwrap());
        assert!(!board.read_and_clear(0).unwrap());
        assert!(!board.read_raw(0).unwrap());
        assert_eq!(board.settled_level(0).unwrap(), Some(Level::Low));
    }

    #[test]
    fn test_data_ready_routed() {
        let (board, _) = board();
        board.power_up().unwrap();
        board.with_hal(|hal| hal.queue_peer_frame(&[1, 2, 3, 4]).unwrap());
        assert!(board.data_ready_asserted().unwrap());
        assert_eq!(board.service_pending(), 1);
        assert!(board.take_data_ready());

        board.begin_receive(4).unwrap();
        board.with_hal(|hal| hal.complete_dma().unwrap());
        board.service_pending();
        assert_eq!(board.try_receive(), Ok(Some(vec![1, 2, 3, 4])));
    }

    #[test]
    fn test_dma_and_timer_serviced_together() {
        let (board, _) = board();
        board.with_hal(|hal| hal.drive_pin(BUTTON_PIN, Level::Low).unwrap());
        board.service_pending();
        board.send(&[0xAA]).unwrap();

        board.advance(Duration::from_millis(10));
        board.with_hal(|hal| hal.complete_dma().unwrap());
        assert_eq!(board.service_pending(), 2);

        assert_eq!(board.transport_state(), TransportState::Idle);
        assert_eq!(board.last_transmitted(), Some(vec![0xAA]));
        assert!(board.read_and_clear(0).unwrap());
    }

    #[test]
    fn test_unassigned_edge_is_ignored() {
        let (board, _) = board();
        board.on_interrupt(Irq::Exti(40));
        board.on_interrupt(Irq::DebounceTimer);
        assert!(!board.read_and_clear(0).unwrap());
    }

    #[test]
    fn test_reinitialize_after_power_down() {
        let (board, config) = board();
        board.power_up().unwrap();
        board.send(&[1]).unwrap();
        board.power_down().unwrap();
        assert_eq!(board.send(&[2]), Err(TransportError::TransportDisabled));
        board.with_hal(|hal| assert!(!hal.channel_active(Direction::Transmit)));

        board.reinitialize_transport().unwrap();
        board.with_hal(|hal| {
            assert_eq!(hal.level(config.transport.enable_pin), Some(Level::High));
        });
        board.send(&[2]).unwrap();
        board.with_hal(|hal| hal.complete_dma().unwrap());
        board.service_pending();
        assert_eq!(board.last_transmitted(), Some(vec![2]));
    }

    #[test]
    fn test_toggle_led() {
        let (board, _) = board();
        assert_eq!(board.toggle_led(0), Some(Ok(true)));
        assert_eq!(board.toggle_led(0), Some(Ok(false)));
        assert_eq!(board.toggle_led(9), None);
    }
}
