// src/control_loop.rs - Fixed-cadence regulation loop
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::communication::{FlowController, TelemetryPublisher, ValveError};
use crate::config::ControlConfig;
use crate::control::{
    build_strategy, ControlMode, ControlStrategy, FeedbackMode, StrategyKind, ValveCommand,
    VALVE_CLOSED,
};
use crate::hardware::{DeviceChannel, ThermalProbe};
use crate::history::RingBuffer;
use crate::sample::Sample;
use crate::sensors::{Acquisition, SensorError, SensorReader, SensorWarning};
use crate::storage::{LogRecord, SampleStore, StorageError};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Valve(#[from] ValveError),
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("Tick exceeded watchdog of {0:?}")]
    TickTimeout(Duration),
    #[error("Control mode is fixed to feedback while PID is active (requested {requested})")]
    ModeFixed { requested: ControlMode },
}

impl ControlError {
    /// Fatal errors stop the loop; everything else fails only the tick.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ControlError::Storage(_)
                | ControlError::Valve(ValveError::ModeRejected { .. })
                | ControlError::Sensor(SensorError::Valve(ValveError::ModeRejected { .. }))
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub failed_ticks: u64,
    pub valve_commands: u64,
    pub warnings: u64,
}

/// Outcome of one successful tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub sample: Sample,
    pub command: Option<ValveCommand>,
    pub warnings: Vec<SensorWarning>,
}

/// Owns the valve, the sensors, the active strategy and both sinks.
///
/// Each tick reads a sample, lets the strategy decide in feedback mode,
/// actuates, then publishes and persists. Ticks never overlap.
pub struct ControlLoop<C, P> {
    config: ControlConfig,
    valve: FlowController<C>,
    sensors: SensorReader<P>,
    strategy: Box<dyn ControlStrategy>,
    mode: ControlMode,
    publisher: TelemetryPublisher,
    store: SampleStore,
    history: RingBuffer<f64>,
    capacity: Option<f64>,
    last_output: Option<u32>,
    stats: LoopStats,
}

impl<C: DeviceChannel, P: ThermalProbe> ControlLoop<C, P> {
    pub fn new(
        config: ControlConfig,
        valve: FlowController<C>,
        sensors: SensorReader<P>,
        publisher: TelemetryPublisher,
        store: SampleStore,
        capacity: Option<f64>,
    ) -> Self {
        let strategy = build_strategy(config.strategy, &config);
        let mut mode = config.feedback_mode.control_mode();
        if config.strategy == StrategyKind::Pid && mode != ControlMode::Feedback {
            tracing::warn!("PID strategy requires feedback mode, ignoring mode {}", mode);
            mode = ControlMode::Feedback;
        }
        let history = RingBuffer::new(config.history_len);
        Self {
            config,
            valve,
            sensors,
            strategy,
            mode,
            publisher,
            store,
            history,
            capacity,
            last_output: None,
            stats: LoopStats::default(),
        }
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    pub fn setpoint(&self) -> f64 {
        self.strategy.setpoint()
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn capacity(&self) -> Option<f64> {
        self.capacity
    }

    pub fn history(&self) -> &RingBuffer<f64> {
        &self.history
    }

    /// Rolling mean of the DUT temperature over the configured window.
    pub fn average_temperature(&self) -> Option<f64> {
        self.history.mean_recent(self.config.average_window)
    }

    pub fn valve_mut(&mut self) -> &mut FlowController<C> {
        &mut self.valve
    }

    pub fn sensors_mut(&mut self) -> &mut SensorReader<P> {
        &mut self.sensors
    }

    pub fn publisher(&self) -> &TelemetryPublisher {
        &self.publisher
    }

    pub fn store(&self) -> &SampleStore {
        &self.store
    }

    /// Bring the valve into a known state before the first tick.
    ///
    /// The mode is set and confirmed first; a rejected mode aborts before any
    /// output is written.
    pub async fn start(&mut self) -> Result<(), ControlError> {
        tracing::info!(
            "Starting {} control at {:.2}C in mode {}",
            self.strategy.kind(),
            self.strategy.setpoint(),
            self.mode
        );
        if let Err(e) = self.valve.set_control_mode(self.mode).await {
            self.store.note(&format!("ERR: control mode cannot be set: {}", e)).await?;
            return Err(e.into());
        }
        self.store.note(&format!("Valve started with valve {}", self.mode)).await?;

        self.valve.set_valve_output(VALVE_CLOSED).await?;
        self.last_output = Some(VALVE_CLOSED);
        if self.mode == ControlMode::Feedback && self.config.initial_output != VALVE_CLOSED {
            self.valve.set_valve_output(self.config.initial_output).await?;
            self.last_output = Some(self.config.initial_output);
        }

        if self.capacity.is_none() {
            let capacity = self.valve.capacity().await?;
            tracing::info!("Flow controller capacity {:.3}", capacity);
            self.capacity = Some(capacity);
        }

        self.note_valve_state().await
    }

    async fn note_valve_state(&mut self) -> Result<(), ControlError> {
        let output = self.valve.valve_output_raw().await?;
        let measure = self.valve.measure_raw().await?;
        let line = format!("valve 0x{:x},0x{:x}", output, measure);
        tracing::info!("{}", line);
        self.store.note(&line).await?;
        Ok(())
    }

    /// Switch between regulation and a pinned valve. Resets the strategy.
    pub async fn change_mode(&mut self, feedback: FeedbackMode) -> Result<(), ControlError> {
        let mode = feedback.control_mode();
        if self.strategy.kind() == StrategyKind::Pid && mode != ControlMode::Feedback {
            return Err(ControlError::ModeFixed { requested: mode });
        }
        self.valve.set_control_mode(mode).await?;
        self.strategy.reset();
        self.mode = mode;
        self.config.feedback_mode = feedback;
        self.store.note(&format!("control mode changed to {}", mode)).await?;
        Ok(())
    }

    /// Replace the strategy with a freshly reset one of `kind`.
    pub async fn select_strategy(&mut self, kind: StrategyKind) -> Result<(), ControlError> {
        if kind == StrategyKind::Pid && self.mode != ControlMode::Feedback {
            self.valve.set_control_mode(ControlMode::Feedback).await?;
            self.mode = ControlMode::Feedback;
            self.config.feedback_mode = FeedbackMode::On;
            self.store.note("control mode changed to feedback").await?;
        }
        self.config.setpoint = self.strategy.setpoint();
        self.config.strategy = kind;
        self.strategy = build_strategy(kind, &self.config);
        self.store.note(&format!("strategy changed to {}", kind)).await?;
        Ok(())
    }

    pub async fn set_setpoint(&mut self, setpoint: f64) -> Result<(), ControlError> {
        self.strategy.set_setpoint(setpoint);
        self.config.setpoint = setpoint;
        self.store.note(&format!("setpoint changed to {:.2}C", setpoint)).await?;
        Ok(())
    }

    async fn capacity_or_probe(&mut self) -> Result<f64, ControlError> {
        match self.capacity {
            Some(capacity) => Ok(capacity),
            None => {
                let capacity = self.valve.capacity().await?;
                self.capacity = Some(capacity);
                Ok(capacity)
            }
        }
    }

    /// Run one iteration: acquire, decide, actuate, publish, persist.
    pub async fn tick(&mut self) -> Result<TickReport, ControlError> {
        let capacity = self.capacity_or_probe().await?;
        let Acquisition { sample, warnings } =
            self.sensors.read_sample(&mut self.valve, capacity).await?;

        for warning in &warnings {
            tracing::warn!("{}", warning);
            self.stats.warnings += 1;
            // The record summary already marks missing humidity
            if matches!(warning, SensorWarning::TemperatureChannelMissing { .. }) {
                self.store.note(&warning.to_string()).await?;
            }
        }

        self.history.push(sample.temperature_dut);

        let command = if self.mode == ControlMode::Feedback && sample.temperature_dut.is_finite() {
            // The device output wins over whatever the strategy last commanded
            self.strategy.observe_valve(sample.valve_position > 0.0);
            self.strategy.decide(&sample, Instant::now())
        } else {
            None
        };

        if let Some(command) = command {
            self.actuate(command, &sample).await?;
        }

        self.publisher.publish(&sample);
        let record = LogRecord::new(sample, self.mode, command);
        self.store.append(&record).await?;

        match self.average_temperature() {
            Some(average) => tracing::info!("{} avg {:.2}C", record.summary(), average),
            None => tracing::info!("{}", record.summary()),
        }

        self.stats.ticks += 1;
        Ok(TickReport {
            sample,
            command,
            warnings,
        })
    }

    async fn actuate(&mut self, command: ValveCommand, sample: &Sample) -> Result<(), ControlError> {
        self.valve.apply(&command).await?;
        self.stats.valve_commands += 1;

        if let ValveCommand::SetOutput(raw) = command {
            let changed = self.last_output != Some(raw);
            self.last_output = Some(raw);
            if !changed {
                return Ok(());
            }
        }

        tracing::info!(
            "Valve {} at {:.2}C (setpoint {:.2}C)",
            command,
            sample.temperature_dut,
            self.strategy.setpoint()
        );
        self.note_valve_state().await
    }

    async fn record_failure(&mut self, error: ControlError) -> Result<(), ControlError> {
        self.stats.failed_ticks += 1;
        if error.is_fatal() {
            tracing::error!("Control loop halted: {}", error);
            if !matches!(error, ControlError::Storage(_)) {
                if let Err(e) = self.store.note(&format!("ERR: {}", error)).await {
                    tracing::warn!("Failed to record halt in text log: {}", e);
                }
            }
            return Err(error);
        }
        tracing::warn!("Tick failed: {}", error);
        self.store.note(&format!("tick failed: {}", error)).await?;
        Ok(())
    }

    /// Tick on a fixed cadence until `shutdown` turns true or a fatal error.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<LoopStats, ControlError> {
        let period = self.config.tick_period();
        let watchdog = self.config.tick_timeout();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!("Control loop running every {:?}", period);
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            let outcome = tokio::select! {
                result = tokio::time::timeout(watchdog, self.tick()) => result,
                _ = shutdown.changed() => {
                    tracing::info!("Shutdown requested during tick");
                    break;
                }
            };

            match outcome {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => self.record_failure(e).await?,
                Err(_) => self.record_failure(ControlError::TickTimeout(watchdog)).await?,
            }
        }

        tracing::info!(
            "Control loop stopped after {} ticks ({} failed)",
            self.stats.ticks,
            self.stats.failed_ticks
        );
        Ok(self.stats.clone())
    }

    /// Leave the valve closed and the controller off.
    pub async fn shutdown(&mut self) -> Result<(), ControlError> {
        if !self.config.close_valve_on_exit {
            tracing::info!("Leaving valve in mode {}", self.mode);
            return Ok(());
        }
        tracing::info!("Closing valve");
        self.valve.set_valve_output(VALVE_CLOSED).await?;
        self.last_output = Some(VALVE_CLOSED);
        self.valve.set_control_mode(ControlMode::Off).await?;
        self.mode = ControlMode::Off;
        self.store.note("valve closed, control mode off").await?;
        Ok(())
    }
}
