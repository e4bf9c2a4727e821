// Integration tests for the control loop against the simulated rig

use std::path::PathBuf;
use std::time::Duration;

use n2_cooling::communication::valve_protocol::raw_from_percent;
use n2_cooling::communication::{FlowController, ProtocolError, TelemetryPublisher, ValveError};
use n2_cooling::config::{ControlConfig, StorageConfig};
use n2_cooling::control::{ControlMode, FeedbackMode, StrategyKind, ValveCommand};
use n2_cooling::control_loop::{ControlError, ControlLoop};
use n2_cooling::hardware::{RigOptions, SimulatedProbe, SimulatedRig, SimulatedValve};
use n2_cooling::sensors::{SensorError, SensorReader, SensorWarning};
use n2_cooling::storage::{read_table, SampleStore};
use tempfile::TempDir;
use tokio::sync::watch;

struct Harness {
    rig: SimulatedRig,
    control: ControlLoop<SimulatedValve, SimulatedProbe>,
    table: PathBuf,
    text_log: PathBuf,
    _dir: TempDir,
}

async fn harness(configure: impl FnOnce(&mut ControlConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageConfig {
        table: dir.path().join("cooling.n2t").display().to_string(),
        text_log: dir.path().join("temperature.log").display().to_string(),
    };

    let mut config = ControlConfig {
        sensor_retry_budget: 3,
        ..ControlConfig::default()
    };
    configure(&mut config);

    let rig = SimulatedRig::new(RigOptions {
        noise: 0.0,
        frozen: true,
        reply_chunk: 5,
        ..RigOptions::dry_ice()
    });
    rig.set_temperatures(-19.0, -40.0);

    let valve = FlowController::new(rig.valve(), 0x80, Duration::from_millis(1000));
    let sensors = SensorReader::new(rig.probe(), config.retry_policy());
    let publisher = TelemetryPublisher::new("CoolingData", 16);
    let store = SampleStore::open(&storage).await.unwrap();
    let control = ControlLoop::new(config, valve, sensors, publisher, store, None);

    Harness {
        rig,
        control,
        table: PathBuf::from(storage.table),
        text_log: PathBuf::from(storage.text_log),
        _dir: dir,
    }
}

async fn tick_at(h: &mut Harness, temperature: f64) -> Option<ValveCommand> {
    h.rig.set_temperatures(temperature, -40.0);
    h.control.tick().await.unwrap().command
}

#[tokio::test(start_paused = true)]
async fn test_startup_sequence() {
    let mut h = harness(|c| c.initial_output = 0x20_0000).await;
    h.control.start().await.unwrap();

    let snapshot = h.rig.snapshot();
    assert_eq!(snapshot.mode_code, ControlMode::Feedback.wire_code());
    assert_eq!(snapshot.output_raw, 0x20_0000);
    assert_eq!(h.control.capacity(), Some(20.0));

    let text = std::fs::read_to_string(&h.text_log).unwrap();
    assert!(text.contains("Valve started with valve feedback"));
    assert!(text.contains("valve 0x200000,"));
}

#[tokio::test(start_paused = true)]
async fn test_hysteresis_cooldown_scenario() {
    let mut h = harness(|_| {}).await;
    h.control.start().await.unwrap();

    assert_eq!(tick_at(&mut h, -19.0).await, None);
    assert_eq!(h.rig.snapshot().output_raw, 0);

    assert_eq!(
        tick_at(&mut h, -20.3).await,
        Some(ValveCommand::SetOutput(0x80_0000))
    );
    assert_eq!(h.rig.snapshot().output_raw, 0x80_0000);

    for _ in 0..9 {
        assert_eq!(tick_at(&mut h, -19.5).await, None);
        assert_eq!(h.rig.snapshot().output_raw, 0x80_0000);
    }

    assert_eq!(tick_at(&mut h, -19.4).await, Some(ValveCommand::SetOutput(0)));
    assert_eq!(h.rig.snapshot().output_raw, 0);
    assert_eq!(h.control.stats().ticks, 12);
    assert_eq!(h.control.stats().valve_commands, 2);

    let records = read_table(&h.table).await.unwrap();
    assert_eq!(records.len(), 12);
    assert_eq!(records[1].command, Some(ValveCommand::SetOutput(0x80_0000)));
    assert!(records.iter().all(|r| r.mode == ControlMode::Feedback));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_response_fails_tick_only() {
    let mut h = harness(|_| {}).await;
    h.control.start().await.unwrap();

    h.rig.inject_reply(":0680027241\r\n");
    let err = h.control.tick().await.unwrap_err();
    assert!(matches!(err, ControlError::Sensor(SensorError::Valve(ValveError::Protocol(_)))));
    assert!(!err.is_fatal());

    // The next tick talks to the device normally again
    assert!(h.control.tick().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_run_continues_after_failed_tick() {
    let mut h = harness(|_| {}).await;
    h.control.start().await.unwrap();
    h.rig.inject_reply(":058002724100\r\n");

    let (stop_tx, stop_rx) = watch::channel(false);
    let stopper = async move {
        tokio::time::sleep(Duration::from_millis(3500)).await;
        stop_tx.send(true).unwrap();
    };
    let (stats, _) = tokio::join!(h.control.run(stop_rx), stopper);
    let stats = stats.unwrap();

    // Ticks at 0, 1, 2 and 3 s; the first one hit the truncated answer
    assert_eq!(stats.failed_ticks, 1);
    assert_eq!(stats.ticks, 3);
    assert_eq!(read_table(&h.table).await.unwrap().len(), 3);

    let text = std::fs::read_to_string(&h.text_log).unwrap();
    assert!(text.contains("tick failed"));
    assert!(text.contains(&ProtocolError::Truncated { expected: 19, actual: 13 }.to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_expiry_is_a_failed_tick() {
    let mut h = harness(|c| c.tick_timeout_ms = 500).await;
    h.control.start().await.unwrap();
    h.rig.inject_silence();

    let (stop_tx, stop_rx) = watch::channel(false);
    let stopper = async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        stop_tx.send(true).unwrap();
    };
    let (stats, _) = tokio::join!(h.control.run(stop_rx), stopper);
    let stats = stats.unwrap();
    assert_eq!(stats.failed_ticks, 1);
    assert_eq!(stats.ticks, 2);
}

#[tokio::test(start_paused = true)]
async fn test_mode_rejected_is_fatal_without_actuation() {
    let mut h = harness(|_| {}).await;
    h.rig.force_mode_readback(Some(ControlMode::Closed.wire_code()));

    let err = h.control.start().await.unwrap_err();
    assert!(matches!(
        err,
        ControlError::Valve(ValveError::ModeRejected { requested: ControlMode::Feedback, reported: 3 })
    ));
    assert!(err.is_fatal());

    // Only the mode write reached the device
    let snapshot = h.rig.snapshot();
    assert_eq!(snapshot.writes, 1);
    assert_eq!(snapshot.output_raw, 0);
}

#[tokio::test(start_paused = true)]
async fn test_sensor_fault_and_humidity_fault() {
    let mut h = harness(|_| {}).await;
    h.control.start().await.unwrap();

    h.rig.drop_temperature_reads(3);
    let err = h.control.tick().await.unwrap_err();
    assert!(matches!(err, ControlError::Sensor(SensorError::Fault { attempts: 3 })));
    assert!(!err.is_fatal());

    h.rig.fail_humidity_reads(1);
    let report = h.control.tick().await.unwrap();
    assert_eq!(report.sample.humidity_dut, None);
    assert!(matches!(report.warnings[..], [SensorWarning::HumidityUnavailable(_)]));

    let text = std::fs::read_to_string(&h.text_log).unwrap();
    assert!(text.contains("Humidity read error"));
}

#[tokio::test(start_paused = true)]
async fn test_pinned_mode_bypasses_strategy() {
    let mut h = harness(|_| {}).await;
    h.control.start().await.unwrap();
    h.control.change_mode(FeedbackMode::Open).await.unwrap();
    assert_eq!(h.control.mode(), ControlMode::Open);
    assert_eq!(h.rig.snapshot().mode_code, 8);

    // Far below the opening threshold, but the strategy is bypassed
    assert_eq!(tick_at(&mut h, -30.0).await, None);
    let records = read_table(&h.table).await.unwrap();
    assert_eq!(records.last().unwrap().mode, ControlMode::Open);
}

#[tokio::test(start_paused = true)]
async fn test_pid_strategy_drives_output_every_tick() {
    let mut h = harness(|_| {}).await;
    h.control.start().await.unwrap();
    h.control.change_mode(FeedbackMode::Close).await.unwrap();

    h.control.select_strategy(StrategyKind::Pid).await.unwrap();
    assert_eq!(h.control.strategy_kind(), StrategyKind::Pid);
    assert_eq!(h.control.mode(), ControlMode::Feedback);

    // 3 °C too warm: kp * error = 24 %
    let command = tick_at(&mut h, -17.0).await;
    assert_eq!(command, Some(ValveCommand::SetOutput(raw_from_percent(24.0))));
    assert!(tick_at(&mut h, -17.0).await.is_some());

    let err = h.control.change_mode(FeedbackMode::Open).await.unwrap_err();
    assert!(matches!(err, ControlError::ModeFixed { requested: ControlMode::Open }));
}

#[tokio::test(start_paused = true)]
async fn test_setpoint_change_moves_thresholds() {
    let mut h = harness(|_| {}).await;
    h.control.start().await.unwrap();
    h.control.set_setpoint(-30.0).await.unwrap();
    assert_eq!(h.control.setpoint(), -30.0);

    assert_eq!(tick_at(&mut h, -25.0).await, None);
    assert_eq!(
        tick_at(&mut h, -30.5).await,
        Some(ValveCommand::SetOutput(0x80_0000))
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_leaves_valve_safe() {
    let mut h = harness(|_| {}).await;
    h.control.start().await.unwrap();
    tick_at(&mut h, -21.0).await;
    assert_ne!(h.rig.snapshot().output_raw, 0);

    h.control.shutdown().await.unwrap();
    let snapshot = h.rig.snapshot();
    assert_eq!(snapshot.output_raw, 0);
    assert_eq!(snapshot.mode_code, ControlMode::Off.wire_code());
    assert_eq!(h.control.mode(), ControlMode::Off);
}

#[tokio::test(start_paused = true)]
async fn test_rolling_average_tracks_dut() {
    let mut h = harness(|c| c.average_window = 2).await;
    h.control.start().await.unwrap();
    tick_at(&mut h, -10.0).await;
    tick_at(&mut h, -19.0).await;
    tick_at(&mut h, -21.0).await;
    assert_eq!(h.control.average_temperature(), Some(-20.0));
    assert_eq!(h.control.history().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_open_valve_closes_after_returning_to_feedback() {
    let mut h = harness(|_| {}).await;
    h.control.start().await.unwrap();
    assert_eq!(
        tick_at(&mut h, -20.3).await,
        Some(ValveCommand::SetOutput(0x80_0000))
    );

    h.control.change_mode(FeedbackMode::Open).await.unwrap();
    h.control.change_mode(FeedbackMode::On).await.unwrap();
    // The output register still holds the open position
    assert_eq!(h.rig.snapshot().output_raw, 0x80_0000);

    assert_eq!(tick_at(&mut h, -10.0).await, Some(ValveCommand::SetOutput(0)));
    assert_eq!(h.rig.snapshot().output_raw, 0);
}

#[tokio::test(start_paused = true)]
async fn test_initial_output_closes_above_setpoint() {
    let mut h = harness(|c| c.initial_output = 0x20_0000).await;
    h.control.start().await.unwrap();
    assert_eq!(tick_at(&mut h, -10.0).await, Some(ValveCommand::SetOutput(0)));
    assert_eq!(h.rig.snapshot().output_raw, 0);
}

#[tokio::test(start_paused = true)]
async fn test_switch_back_from_pid_tracks_open_valve() {
    let mut h = harness(|_| {}).await;
    h.control.start().await.unwrap();
    h.control.select_strategy(StrategyKind::Pid).await.unwrap();
    assert!(tick_at(&mut h, -17.0).await.is_some());
    assert_ne!(h.rig.snapshot().output_raw, 0);

    h.control.select_strategy(StrategyKind::Hysteresis).await.unwrap();
    assert_eq!(tick_at(&mut h, -10.0).await, Some(ValveCommand::SetOutput(0)));
}
