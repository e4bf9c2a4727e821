// src/main.rs - Cooling controller entry point
use std::path::PathBuf;

use clap::Parser;
use tokio::sync::watch;

use n2_cooling::communication::{FlowController, TelemetryPublisher, TelemetryServer};
use n2_cooling::config::{self, Config};
use n2_cooling::control::{FeedbackMode, StrategyKind};
use n2_cooling::control_loop::ControlLoop;
use n2_cooling::hardware::{
    DeviceChannel, HwmonProbe, RigOptions, SerialChannel, SimulatedRig, ThermalProbe,
};
use n2_cooling::sensors::SensorReader;
use n2_cooling::storage::SampleStore;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Nitrogen cooling controller
#[derive(Parser, Debug)]
#[command(name = "n2-cooling", about = "Regulates an enclosure temperature through a gas flow valve.")]
struct Cli {
    /// Path to a TOML config file (defaults apply when omitted)
    config: Option<PathBuf>,

    /// Target temperature in °C
    #[arg(long, allow_negative_numbers = true)]
    setpoint: Option<f64>,

    /// Regulate, or pin the valve open or closed
    #[arg(long, value_enum)]
    feedback: Option<FeedbackMode>,

    /// Telemetry endpoint, e.g. tcp://*:5000
    #[arg(long)]
    monitor: Option<String>,

    /// Control algorithm
    #[arg(long, value_enum)]
    strategy: Option<StrategyKind>,

    /// Run against the simulated rig
    #[arg(long)]
    simulate: bool,

    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(setpoint) = cli.setpoint {
        config.control.setpoint = setpoint;
    }
    if let Some(feedback) = cli.feedback {
        config.control.feedback_mode = feedback;
    }
    if let Some(strategy) = cli.strategy {
        config.control.strategy = strategy;
    }
    if let Some(monitor) = &cli.monitor {
        config.telemetry.endpoint = Some(monitor.clone());
    }
    if cli.simulate {
        config.hardware.simulate = true;
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).init();
    tracing::info!("Starting n2-cooling {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            config::load_config(&path.to_string_lossy())?
        }
        None => Config::default(),
    };
    apply_overrides(&mut config, &cli);
    config.validate().map_err(|e| {
        tracing::error!("{}", e);
        e
    })?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping");
            let _ = stop_tx.send(true);
        }
    });

    let publisher = TelemetryPublisher::new(&config.telemetry.name, config.telemetry.buffer);
    let _server = match &config.telemetry.endpoint {
        Some(endpoint) => match TelemetryServer::bind(endpoint, &publisher).await {
            Ok(server) => Some(server),
            Err(e) => {
                tracing::warn!("Telemetry disabled, cannot bind {}: {}", endpoint, e);
                None
            }
        },
        None => None,
    };
    let store = SampleStore::open(&config.storage).await?;

    if config.hardware.simulate {
        let preset = match config.control.strategy {
            StrategyKind::Hysteresis => RigOptions::dry_ice(),
            StrategyKind::Pid => RigOptions::cold_gas(),
        };
        tracing::info!("Using simulated rig");
        let rig = SimulatedRig::new(RigOptions {
            node: config.valve.node,
            ..preset
        });
        run(config, rig.valve(), rig.probe(), publisher, store, stop_rx).await
    } else {
        let channel = SerialChannel::open(&config.valve.serial, config.valve.baud).map_err(|e| {
            tracing::error!("Cannot open {}: {}", config.valve.serial, e);
            tracing::error!("Available ports: {:?}", SerialChannel::available_ports());
            e
        })?;
        let probe = HwmonProbe::new(&config.sensors);
        run(config, channel, probe, publisher, store, stop_rx).await
    }
}

async fn run<C: DeviceChannel, P: ThermalProbe>(
    config: Config,
    channel: C,
    probe: P,
    publisher: TelemetryPublisher,
    store: SampleStore,
    stop_rx: watch::Receiver<bool>,
) -> Result<(), BoxError> {
    let valve = FlowController::new(channel, config.valve.node, config.valve.response_timeout());
    let sensors = SensorReader::new(probe, config.control.retry_policy());
    let mut control = ControlLoop::new(
        config.control.clone(),
        valve,
        sensors,
        publisher,
        store,
        config.valve.capacity,
    );

    control.start().await?;
    let result = control.run(stop_rx).await;

    if let Err(e) = control.shutdown().await {
        tracing::error!("Failed to leave the valve in a safe state: {}", e);
    }

    let stats = result?;
    tracing::info!(
        "{} ticks, {} failed, {} valve commands, {} telemetry messages dropped",
        stats.ticks,
        stats.failed_ticks,
        stats.valve_commands,
        control.publisher().dropped()
    );
    Ok(())
}
