// src/control/pid.rs - PID valve control with output clamp and anti-windup
use tokio::time::Instant;

use super::{ControlStrategy, StrategyKind, ValveCommand};
use crate::communication::valve_protocol::raw_from_percent;
use crate::config::PidConfig;
use crate::sample::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PidState {
    pub integral: f64,
    pub previous_error: f64,
    pub previous_time: Option<Instant>,
}

/// PID controller producing a valve opening in percent.
///
/// Gains are normally negative: opening the valve lowers the temperature, so
/// a temperature above the setpoint (negative error) must raise the output.
/// The output is clamped to the usable valve band `[output_min, output_max]`
/// and the integral is frozen on every tick the clamped output saturates.
#[derive(Debug, Clone)]
pub struct PidController {
    kp: f64,
    ki: f64,
    kd: f64,
    output_min: f64,
    output_max: f64,
    setpoint: f64,
    state: PidState,
}

impl PidController {
    pub fn new(setpoint: f64, config: &PidConfig) -> Self {
        Self {
            kp: config.kp,
            ki: config.ki,
            kd: config.kd,
            output_min: config.output_min,
            output_max: config.output_max,
            setpoint,
            state: PidState::default(),
        }
    }

    pub fn state(&self) -> PidState {
        self.state
    }

    pub fn output_range(&self) -> (f64, f64) {
        (self.output_min, self.output_max)
    }

    /// Calculate the clamped output in percent for a measured temperature.
    pub fn update(&mut self, temperature: f64, now: Instant) -> f64 {
        let error = self.setpoint - temperature;

        let dt = self
            .state
            .previous_time
            .map(|prev| now.saturating_duration_since(prev).as_secs_f64());

        let (integral, derivative) = match dt {
            Some(dt) if dt > 0.0 => (
                self.state.integral + error * dt,
                (error - self.state.previous_error) / dt,
            ),
            _ => (self.state.integral, 0.0),
        };

        let unclamped = self.kp * error + self.ki * integral + self.kd * derivative;
        let output = unclamped.clamp(self.output_min, self.output_max);

        // Anti-windup: keep the new integral only while the output is unsaturated
        if output == unclamped {
            self.state.integral = integral;
        }
        self.state.previous_error = error;
        self.state.previous_time = Some(now);

        tracing::trace!(
            "PID error={:.3} integral={:.3} derivative={:.3} output={:.2}%",
            error,
            self.state.integral,
            derivative,
            output
        );
        output
    }
}

impl ControlStrategy for PidController {
    fn decide(&mut self, sample: &Sample, now: Instant) -> Option<ValveCommand> {
        if !sample.temperature_dut.is_finite() {
            return None;
        }
        let percent = self.update(sample.temperature_dut, now);
        Some(ValveCommand::SetOutput(raw_from_percent(percent)))
    }

    fn set_setpoint(&mut self, setpoint: f64) {
        self.setpoint = setpoint;
    }

    fn setpoint(&self) -> f64 {
        self.setpoint
    }

    fn reset(&mut self) {
        self.state = PidState::default();
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Pid
    }
}
