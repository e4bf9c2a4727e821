// src/control/mod.rs - Control modes, valve commands and strategy selection
pub mod hysteresis;
pub mod pid;

pub use hysteresis::{HysteresisController, HysteresisState};
pub use pid::{PidController, PidState};

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::ControlConfig;
use crate::sample::Sample;

/// Fully closed valve output.
pub const VALVE_CLOSED: u32 = 0x00_0000;
/// Fully open valve output, the largest 24-bit magnitude.
pub const VALVE_FULLY_OPEN: u32 = 0xFF_FFFF;

/// Operating mode of the flow controller. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    Off,
    Open,
    Closed,
    Feedback,
}

impl ControlMode {
    /// Mode code written to the device. `Off` and `Closed` share code 3.
    pub fn wire_code(self) -> u8 {
        match self {
            ControlMode::Off | ControlMode::Closed => 3,
            ControlMode::Open => 8,
            ControlMode::Feedback => 4,
        }
    }

    /// Code 3 reads back as `Closed`.
    pub fn from_wire(code: u8) -> Option<Self> {
        match code {
            3 => Some(ControlMode::Closed),
            8 => Some(ControlMode::Open),
            4 => Some(ControlMode::Feedback),
            _ => None,
        }
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlMode::Off => "off",
            ControlMode::Open => "open",
            ControlMode::Closed => "closed",
            ControlMode::Feedback => "feedback",
        };
        f.write_str(name)
    }
}

/// A command the control loop sends to the valve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ValveCommand {
    /// Raw 24-bit valve output, 0 closed and `0xFFFFFF` fully open.
    SetOutput(u32),
    SetControlMode(ControlMode),
}

impl ValveCommand {
    pub fn close() -> Self {
        ValveCommand::SetOutput(VALVE_CLOSED)
    }
}

impl fmt::Display for ValveCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValveCommand::SetOutput(raw) => write!(f, "output 0x{:06X}", raw),
            ValveCommand::SetControlMode(mode) => write!(f, "mode {}", mode),
        }
    }
}

/// Operator-facing valve mode: regulate, or pin the valve open/closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackMode {
    #[default]
    On,
    Open,
    Close,
}

impl FeedbackMode {
    pub fn control_mode(self) -> ControlMode {
        match self {
            FeedbackMode::On => ControlMode::Feedback,
            FeedbackMode::Open => ControlMode::Open,
            FeedbackMode::Close => ControlMode::Closed,
        }
    }
}

impl fmt::Display for FeedbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeedbackMode::On => "on",
            FeedbackMode::Open => "open",
            FeedbackMode::Close => "close",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Hysteresis,
    Pid,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Hysteresis => f.write_str("hysteresis"),
            StrategyKind::Pid => f.write_str("pid"),
        }
    }
}

/// A control algorithm deciding the next valve command from the latest sample.
///
/// Strategies are pure state machines: they never touch the device. `None`
/// means the valve keeps its current output this tick.
pub trait ControlStrategy: Send {
    fn decide(&mut self, sample: &Sample, now: Instant) -> Option<ValveCommand>;
    fn set_setpoint(&mut self, setpoint: f64);
    fn setpoint(&self) -> f64;
    /// Forget all accumulated state, as after a restart of the algorithm.
    fn reset(&mut self);
    fn kind(&self) -> StrategyKind;

    /// Valve state as reported by the device, before `decide` runs.
    fn observe_valve(&mut self, _open: bool) {}
}

pub fn build_strategy(kind: StrategyKind, config: &ControlConfig) -> Box<dyn ControlStrategy> {
    match kind {
        StrategyKind::Hysteresis => Box::new(HysteresisController::new(
            config.setpoint,
            config.open_output,
        )),
        StrategyKind::Pid => Box::new(PidController::new(config.setpoint, &config.pid)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_wire_codes() {
        assert_eq!(ControlMode::Off.wire_code(), 3);
        assert_eq!(ControlMode::Closed.wire_code(), 3);
        assert_eq!(ControlMode::Open.wire_code(), 8);
        assert_eq!(ControlMode::Feedback.wire_code(), 4);
        assert_eq!(ControlMode::from_wire(3), Some(ControlMode::Closed));
        assert_eq!(ControlMode::from_wire(18), None);
    }

    #[test]
    fn test_feedback_mode_mapping() {
        assert_eq!(FeedbackMode::On.control_mode(), ControlMode::Feedback);
        assert_eq!(FeedbackMode::Open.control_mode(), ControlMode::Open);
        assert_eq!(FeedbackMode::Close.control_mode(), ControlMode::Closed);
    }

    #[test]
    fn test_build_strategy_kind() {
        let config = ControlConfig::default();
        assert_eq!(build_strategy(StrategyKind::Pid, &config).kind(), StrategyKind::Pid);
        let hysteresis = build_strategy(StrategyKind::Hysteresis, &config);
        assert_eq!(hysteresis.kind(), StrategyKind::Hysteresis);
        assert_eq!(hysteresis.setpoint(), config.setpoint);
    }
}
