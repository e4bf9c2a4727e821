// src/control/hysteresis.rs - Debounced bang-bang valve control
//
// Three thresholds around the setpoint and asymmetric dwell times keep the
// valve from chattering: after opening it stays open for 10 ticks, after a
// close from the settled state it stays closed for 20, after an overshoot
// close for 50.
use tokio::time::Instant;

use super::{ControlStrategy, StrategyKind, ValveCommand, VALVE_CLOSED};
use crate::sample::Sample;

/// Open when the temperature falls this far below the setpoint.
pub const OPEN_BELOW: f64 = 0.2;
/// Close from the settled state when the temperature is above `setpoint - 0.5`.
pub const SETTLED_CLOSE_BELOW: f64 = 0.5;

pub const HOLD_AFTER_OPEN: u32 = 10;
pub const HOLD_AFTER_SETTLED_CLOSE: u32 = 20;
pub const HOLD_AFTER_OVERSHOOT_CLOSE: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HysteresisState {
    pub hold_counter: u32,
    pub valve_open: bool,
}

#[derive(Debug, Clone)]
pub struct HysteresisController {
    setpoint: f64,
    open_output: u32,
    state: HysteresisState,
}

impl HysteresisController {
    /// `open_output` is the raw valve output used when opening.
    pub fn new(setpoint: f64, open_output: u32) -> Self {
        Self {
            setpoint,
            open_output,
            state: HysteresisState::default(),
        }
    }

    pub fn with_state(mut self, state: HysteresisState) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> HysteresisState {
        self.state
    }

    pub fn open_below(&self) -> f64 {
        self.setpoint - OPEN_BELOW
    }

    pub fn close_above_primary(&self) -> f64 {
        self.setpoint
    }

    pub fn close_above_secondary(&self) -> f64 {
        self.setpoint - SETTLED_CLOSE_BELOW
    }

    /// Evaluate the transition rules once. Rules are checked in order; the
    /// first match wins.
    pub fn step(&mut self, temperature: f64) -> Option<ValveCommand> {
        let state = &mut self.state;

        if state.hold_counter > 1 {
            state.hold_counter -= 1;
            return None;
        }

        if state.hold_counter == 1
            && temperature > self.setpoint - SETTLED_CLOSE_BELOW
            && state.valve_open
        {
            state.valve_open = false;
            state.hold_counter = HOLD_AFTER_SETTLED_CLOSE;
            return Some(ValveCommand::SetOutput(VALVE_CLOSED));
        }

        if temperature < self.setpoint - OPEN_BELOW && !state.valve_open {
            state.valve_open = true;
            state.hold_counter = HOLD_AFTER_OPEN;
            return Some(ValveCommand::SetOutput(self.open_output));
        }

        if temperature > self.setpoint && state.valve_open {
            state.valve_open = false;
            state.hold_counter = HOLD_AFTER_OVERSHOOT_CLOSE;
            return Some(ValveCommand::SetOutput(VALVE_CLOSED));
        }

        None
    }
}

impl ControlStrategy for HysteresisController {
    fn decide(&mut self, sample: &Sample, _now: Instant) -> Option<ValveCommand> {
        self.step(sample.temperature_dut)
    }

    fn set_setpoint(&mut self, setpoint: f64) {
        self.setpoint = setpoint;
    }

    fn setpoint(&self) -> f64 {
        self.setpoint
    }

    fn reset(&mut self) {
        self.state = HysteresisState::default();
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Hysteresis
    }

    fn observe_valve(&mut self, open: bool) {
        self.state.valve_open = open;
    }
}
