// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

mod config;
mod listener;
mod logging;
mod recording;
mod signals;
mod stream;
mod sweep;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use specan_backend::{DriverFactory, IqDriver, MockDriver, Receiver};
use specan_core::{DeviceStatus, DynResult};
use specan_dsp::{SignalDetector, SoftwareAgc};

use config::ServerConfig;
use listener::AppState;
use recording::RecordingManager;
use signals::SignalStore;
use stream::{spawn_event_pump, StreamManager};
use sweep::SweepEngine;

const PKG_DESCRIPTION: &str = concat!(
    env!("CARGO_PKG_NAME"),
    " - real-time spectrum analysis server"
);

#[derive(Debug, Parser)]
#[command(version = env!("CARGO_PKG_VERSION"), about = PKG_DESCRIPTION)]
struct Cli {
    /// Path to configuration file
    #[arg(long = "config", short = 'C', value_name = "FILE")]
    config: Option<PathBuf>,
    /// Print example configuration and exit
    #[arg(long = "print-config")]
    print_config: bool,
    /// IP address for the TCP listener
    #[arg(short = 'l', long = "listen")]
    listen: Option<IpAddr>,
    /// Port for the TCP listener
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,
}

/// Build the receiver driver factory from config. The mock driver stands in
/// when no hardware stack is compiled in.
fn driver_factory(cfg: &ServerConfig) -> DriverFactory {
    match cfg.device.driver.as_str() {
        #[cfg(feature = "soapysdr")]
        "soapysdr" => {
            let args = cfg.device.device_args.clone();
            Box::new(move |status: &DeviceStatus| {
                specan_backend::soapy::SoapyDriver::open(&args, status)
                    .map(|d| Box::new(d) as Box<dyn IqDriver>)
            })
        }
        #[cfg(not(feature = "soapysdr"))]
        "soapysdr" => {
            warn!("Built without the soapysdr feature; using the mock driver");
            Box::new(|status: &DeviceStatus| {
                Ok(Box::new(MockDriver::silent(status.sample_rate)) as Box<dyn IqDriver>)
            })
        }
        "mock" => Box::new(|status: &DeviceStatus| {
            Ok(Box::new(MockDriver::silent(status.sample_rate)) as Box<dyn IqDriver>)
        }),
        other => {
            warn!("Unknown device driver '{}'; using the mock driver", other);
            Box::new(|status: &DeviceStatus| {
                Ok(Box::new(MockDriver::silent(status.sample_rate)) as Box<dyn IqDriver>)
            })
        }
    }
}

#[tokio::main]
async fn main() -> DynResult<()> {
    let cli = Cli::parse();

    if cli.print_config {
        println!("{}", ServerConfig::example_toml());
        return Ok(());
    }

    let (cfg, config_path) = if let Some(ref path) = cli.config {
        (ServerConfig::load_from_file(path)?, Some(path.clone()))
    } else {
        ServerConfig::load_from_default_paths()?
    };
    cfg.validate()
        .map_err(|e| format!("Invalid server configuration: {}", e))?;

    logging::init_logging(cfg.general.log_level.as_deref());

    if let Some(ref path) = config_path {
        info!("Loaded configuration from {}", path.display());
    }

    let config = Arc::new(cfg);
    let receiver = Arc::new(Receiver::new(
        driver_factory(&config),
        config.initial_status(),
        config.limits(),
    ));
    let agc = Arc::new(SoftwareAgc::default());
    let detector = Arc::new(SignalDetector::new(config.detection_config()));
    let recording = Arc::new(RecordingManager::new(&config.recording));
    let store = Arc::new(SignalStore::open(
        &config.detection.db_path,
        config.detection.match_bandwidth_hz,
    )?);

    let (manager, event_rx) = StreamManager::new(
        Arc::clone(&config),
        Arc::clone(&receiver),
        agc,
        detector,
        recording,
    );
    let event_pump = spawn_event_pump(Arc::clone(&manager), Arc::clone(&store), event_rx);
    let sweep = SweepEngine::new(Arc::clone(&manager), Arc::clone(&receiver), Arc::clone(&config));

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        manager: Arc::clone(&manager),
        sweep: Arc::clone(&sweep),
        store,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut listener_task = None;
    if config.listen.enabled {
        let listen_ip = cli.listen.unwrap_or(config.listen.listen);
        let listen_port = cli.port.unwrap_or(config.listen.port);
        let addr = SocketAddr::from((listen_ip, listen_port));
        let listener = TcpListener::bind(addr).await?;
        let listener_state = Arc::clone(&state);
        listener_task = Some(tokio::spawn(async move {
            if let Err(e) = listener::run_listener(listener, listener_state, shutdown_rx).await {
                error!("Listener error: {:?}", e);
            }
        }));
    }

    info!(
        "specan-server ready (device: {}, {:.3} MHz @ {:.2} MS/s)",
        config.device.driver,
        config.device.center_freq / 1e6,
        config.device.sample_rate / 1e6,
    );

    signal::ctrl_c().await?;
    info!("Ctrl+C received, shutting down");
    let _ = shutdown_tx.send(true);

    sweep.stop().await;
    manager.shutdown().await;
    manager.recording.iq.stop();
    manager.recording.spectrum.stop();

    event_pump.abort();
    if let Some(task) = listener_task {
        if !task.is_finished() {
            task.abort();
        }
        let _ = task.await;
    }
    Ok(())
}
