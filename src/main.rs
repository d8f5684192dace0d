use anyhow::{Context, Result};
use board_io::sim::{SimHal, SimStimulus};
use board_io::{BoardConfig, Daemon, EventMessage};
use log::{error, info};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/board-io/config.yaml".to_string());

    info!("Board I/O daemon starting...");
    info!("Loading configuration from: {}", config_path);
    let config = BoardConfig::from_file(&config_path)?;
    info!("Configuration loaded successfully");

    let (event_tx, mut event_rx) = mpsc::channel::<EventMessage>(32);

    let hal = SimHal::from_config(&config);
    let mut daemon = match Daemon::new(hal, config.clone(), Some(event_tx)) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("Fatal initialization error: {}", e);
            return Err(e).context("Board initialization failed");
        }
    };
    install_stimulus(&mut daemon, &config);

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to setup SIGHUP handler")?;

    info!("Daemon started successfully");

    loop {
        tokio::select! {
            result = daemon.poll() => {
                if let Err(e) = result {
                    error!("Daemon poll error: {:#}", e);
                    return Err(e);
                }
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading configuration");
                match BoardConfig::from_file(&config_path) {
                    Ok(new_config) => {
                        install_stimulus(&mut daemon, &new_config);
                        daemon.reload_config(new_config)?;
                    }
                    Err(e) => error!("Failed to reload configuration: {:#}", e),
                }
            }
            maybe_event = event_rx.recv() => {
                if let Some(event) = maybe_event {
                    match event {
                        EventMessage::ButtonPressed { button, description } => {
                            info!("Event: button {} pressed ({:?})", button, description);
                        }
                        EventMessage::DataReady => {
                            info!("Event: co-processor data ready");
                        }
                        EventMessage::FrameReceived(frame) => {
                            info!("Event: frame received {:02x?}", frame);
                        }
                    }
                }
            }
        }
    }

    daemon.shutdown()?;
    info!("Board I/O daemon shutdown complete");
    Ok(())
}

/// Replace the scripted activity with what `config` describes.
fn install_stimulus(daemon: &mut Daemon<SimHal>, config: &BoardConfig) {
    match SimStimulus::from_config(config) {
        Some(mut stimulus) => {
            info!("Simulation stimulus enabled");
            daemon.set_stimulus(move |hal, elapsed| stimulus.step(hal, elapsed));
        }
        None => daemon.clear_stimulus(),
    }
}

fn init_logger() {
    // Systemd/journald will capture stdout/stderr.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();
}
