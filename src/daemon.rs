use anyhow::Result;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::time::sleep;

use crate::board::Board;
use crate::config::BoardConfig;
use crate::error::{FatalError, TransportError};
use crate::events::EventMessage;
use crate::hal::Hal;

type Stimulus<H> = Box<dyn FnMut(&mut H, Duration) + Send>;

pub struct Daemon<H: Hal> {
    board: Board<H>,
    config: BoardConfig,
    event_tx: Option<Sender<EventMessage>>,
    stimulus: Option<Stimulus<H>>,
    receive_pending: bool,
}

impl<H: Hal> Daemon<H> {
    pub fn new(
        hal: H,
        config: BoardConfig,
        event_tx: Option<Sender<EventMessage>>,
    ) -> Result<Self, FatalError> {
        let board = Board::init(hal, &config)?;
        board.power_up().map_err(FatalError::Transport)?;

        info!("Polling interval: {}ms", config.polling.interval_ms);
        info!("Monitoring {} button(s)", config.buttons.len());
        for button in &config.buttons {
            info!(
                "  - Button {}: pin {} {:?} {:?}",
                button.id, button.pin, button.edge, button.description
            );
        }

        Ok(Daemon {
            board,
            config,
            event_tx,
            stimulus: None,
            receive_pending: false,
        })
    }

    pub fn board(&self) -> &Board<H> {
        &self.board
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    /// Drive the peripherals from outside on every poll, before interrupts
    /// are serviced.
    pub fn set_stimulus<F>(&mut self, stimulus: F)
    where
        F: FnMut(&mut H, Duration) + Send + 'static,
    {
        self.stimulus = Some(Box::new(stimulus));
    }

    pub fn clear_stimulus(&mut self) {
        self.stimulus = None;
    }

    pub async fn poll(&mut self) -> Result<()> {
        let interval = Duration::from_millis(self.config.polling.interval_ms);

        if let Some(stimulus) = self.stimulus.as_mut() {
            self.board.with_hal(|hal| stimulus(hal, interval));
        }
        self.board.service_pending();
        self.board.advance(interval);
        self.board.service_pending();

        self.check_buttons()?;
        self.check_transport()?;

        // Sleep for the configured polling interval
        sleep(interval).await;

        Ok(())
    }

    fn check_buttons(&self) -> Result<()> {
        for button in self.board.buttons() {
            if !self.board.read_and_clear(button.id)? {
                continue;
            }
            // Release bounce latches too; only a settle at the pressed level counts
            if self.board.settled_level(button.id)? != Some(button.pressed_level()) {
                debug!("Button {} released", button.id);
                continue;
            }
            info!("Button {} pressed ({:?})", button.id, button.description);
            if let Some(led) = self.config.leds.first() {
                if let Some(Err(e)) = self.board.toggle_led(led.id) {
                    warn!("Failed to toggle LED {}: {}", led.id, e);
                }
            }
            self.emit(EventMessage::ButtonPressed {
                button: button.id,
                description: button.description.clone(),
            });
        }
        Ok(())
    }

    fn check_transport(&mut self) -> Result<()> {
        if let Some(frame) = self.board.try_receive()? {
            info!("Received {} byte frame from co-processor", frame.len());
            self.emit(EventMessage::FrameReceived(frame));
            // Data-ready is edge triggered; a line still low means more to read
            if self.board.data_ready_asserted()? {
                debug!("Data ready still asserted");
                self.receive_pending = true;
            }
        }

        if self.board.take_data_ready() {
            self.emit(EventMessage::DataReady);
            self.receive_pending = true;
        }
        if self.receive_pending {
            match self.board.begin_receive(self.config.transport.receive_length) {
                Ok(()) => {
                    debug!("Receive started");
                    self.receive_pending = false;
                }
                Err(TransportError::BufferBusy(direction)) => {
                    debug!("Receive deferred, {} buffer busy", direction);
                }
                Err(e) => {
                    warn!("Failed to start receive: {}", e);
                    self.receive_pending = false;
                }
            }
        }
        Ok(())
    }

    fn emit(&self, event: EventMessage) {
        if let Some(tx) = &self.event_tx {
            if let Err(e) = tx.try_send(event) {
                warn!("Event dropped: {}", e);
            }
        }
    }

    /// Apply the parts of `new_config` that take effect without
    /// re-initializing the board. Hardware changes need a restart.
    pub fn reload_config(&mut self, new_config: BoardConfig) -> Result<()> {
        new_config.validate()?;
        if new_config.timer != self.config.timer
            || new_config.buttons != self.config.buttons
            || new_config.leds != self.config.leds
            || new_config.transport != self.config.transport
        {
            warn!("Hardware configuration changed; restart to apply");
        }
        self.config.polling = new_config.polling;
        self.config.simulation = new_config.simulation;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Power the transport down and turn the LEDs off.
    pub fn shutdown(&self) -> Result<()> {
        for led in &self.config.leds {
            if let Some(led) = self.board.led(led.id) {
                self.board.with_hal(|hal| led.off(hal))?;
            }
        }
        self.board.power_down()?;
        info!("Board shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::hal::Level;
    use crate::sim::{SimHal, SimStimulus};
    use crate::transport::TransportState;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::Receiver<EventMessage>) -> Vec<EventMessage> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_poll_reports_press() {
        let config = BoardConfig::default();
        let hal = SimHal::from_config(&config);
        let (tx, mut rx) = mpsc::channel(8);
        let mut daemon = Daemon::new(hal, config.clone(), Some(tx)).unwrap();

        daemon
            .board()
            .with_hal(|hal| hal.drive_pin(config.buttons[0].pin, Level::Low).unwrap());
        for _ in 0..3 {
            daemon.poll().await.unwrap();
        }

        assert_eq!(
            drain(&mut rx),
            vec![EventMessage::ButtonPressed {
                button: 0,
                description: Some("mode".to_string()),
            }]
        );
        daemon
            .board()
            .with_hal(|hal| assert_eq!(hal.level(config.leds[0].pin), Some(Level::High)));
    }

    #[tokio::test]
    async fn test_simulated_peer_frame_received() {
        let mut config = BoardConfig::default();
        config.transport.receive_length = 4;
        config.simulation = Some(SimulationConfig {
            press_interval_ms: 1000,
            bounce_cycles: 3,
            peer_frame: vec![0x10, 0x20, 0x30, 0x40],
            peer_interval_ms: Some(1000),
        });
        let hal = SimHal::from_config(&config);
        let (tx, mut rx) = mpsc::channel(8);
        let mut daemon = Daemon::new(hal, config.clone(), Some(tx)).unwrap();
        let mut stimulus = SimStimulus::from_config(&config).unwrap();
        daemon.set_stimulus(move |hal, elapsed| stimulus.step(hal, elapsed));

        for _ in 0..3 {
            daemon.poll().await.unwrap();
        }

        let events = drain(&mut rx);
        assert!(events.contains(&EventMessage::DataReady));
        assert!(events.contains(&EventMessage::FrameReceived(vec![0x10, 0x20, 0x30, 0x40])));
        assert!(events
            .iter()
            .any(|e| matches!(e, EventMessage::ButtonPressed { button: 0, .. })));
    }

    #[tokio::test]
    async fn test_release_is_not_a_press() {
        let mut config = BoardConfig::default();
        config.simulation = Some(SimulationConfig {
            press_interval_ms: 100,
            bounce_cycles: 3,
            peer_frame: vec![],
            peer_interval_ms: None,
        });
        let hal = SimHal::from_config(&config);
        let (tx, mut rx) = mpsc::channel(8);
        let mut daemon = Daemon::new(hal, config.clone(), Some(tx)).unwrap();
        let mut stimulus = SimStimulus::from_config(&config).unwrap();
        daemon.set_stimulus(move |hal, elapsed| stimulus.step(hal, elapsed));

        // Press on the first poll, release 50 ms later
        for _ in 0..18 {
            daemon.poll().await.unwrap();
        }

        let presses = drain(&mut rx)
            .iter()
            .filter(|e| matches!(e, EventMessage::ButtonPressed { .. }))
            .count();
        assert_eq!(presses, 1);
        assert_eq!(daemon.board().settled_level(0).unwrap(), Some(Level::High));
        daemon
            .board()
            .with_hal(|hal| assert_eq!(hal.level(config.leds[0].pin), Some(Level::High)));
    }

    #[tokio::test]
    async fn test_long_frame_read_in_chunks() {
        let mut config = BoardConfig::default();
        config.transport.receive_length = 4;
        config.simulation = Some(SimulationConfig {
            press_interval_ms: 60_000,
            bounce_cycles: 0,
            peer_frame: (1..=8).collect(),
            peer_interval_ms: Some(60_000),
        });
        let hal = SimHal::from_config(&config);
        let (tx, mut rx) = mpsc::channel(16);
        let mut daemon = Daemon::new(hal, config.clone(), Some(tx)).unwrap();
        let mut stimulus = SimStimulus::from_config(&config).unwrap();
        daemon.set_stimulus(move |hal, elapsed| stimulus.step(hal, elapsed));

        for _ in 0..6 {
            daemon.poll().await.unwrap();
        }

        let frames: Vec<Vec<u8>> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                EventMessage::FrameReceived(frame) => Some(frame),
                _ => None,
            })
            .collect();
        assert_eq!(frames, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
        assert!(!daemon.board().data_ready_asserted().unwrap());
    }

    #[tokio::test]
    async fn test_reload_keeps_hardware() {
        let config = BoardConfig::default();
        let hal = SimHal::from_config(&config);
        let mut daemon = Daemon::new(hal, config.clone(), None).unwrap();

        let mut new_config = config.clone();
        new_config.polling.interval_ms = 20;
        new_config.transport.receive_length = 8;
        daemon.reload_config(new_config).unwrap();

        assert_eq!(daemon.config().polling.interval_ms, 20);
        assert_eq!(daemon.config().transport.receive_length, 16);
    }

    #[tokio::test]
    async fn test_shutdown_powers_down() {
        let config = BoardConfig::default();
        let hal = SimHal::from_config(&config);
        let daemon = Daemon::new(hal, config.clone(), None).unwrap();
        daemon.shutdown().unwrap();
        assert_eq!(daemon.board().transport_state(), TransportState::Disabled);
        daemon
            .board()
            .with_hal(|hal| assert_eq!(hal.level(config.transport.enable_pin), Some(Level::Low)));
    }
}
