//! # Cooling Controller Configuration
//!
//! All settings live in a single TOML file. Every field has a default, so an
//! empty file (or no file at all, with `--simulate`) yields a working setup.
//!
//! ## Example
//!
//! ```toml
//! [control]
//! setpoint = -20.0
//! feedback_mode = "on"      # on | open | close
//! strategy = "hysteresis"   # hysteresis | pid
//!
//! [control.pid]
//! kp = -8.0
//! ki = -0.05
//! kd = -20.0
//!
//! [valve]
//! serial = "/dev/ttyUSB0"
//! baud = 38400
//!
//! [telemetry]
//! endpoint = "tcp://*:5000"
//! ```

// src/config.rs - Single configuration file
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::{FeedbackMode, StrategyKind};
use crate::sensors::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub valve: ValveConfig,
    #[serde(default)]
    pub sensors: SensorConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
}

/// Regulation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    /// Target DUT temperature in °C.
    #[serde(default = "default_setpoint")]
    pub setpoint: f64,
    #[serde(default)]
    pub feedback_mode: FeedbackMode,
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default = "default_tick_period_ms")]
    pub tick_period_ms: u64,
    #[serde(default = "default_tick_timeout_ms")]
    pub tick_timeout_ms: u64,
    #[serde(default = "default_sensor_retry_interval_ms")]
    pub sensor_retry_interval_ms: u64,
    #[serde(default = "default_sensor_retry_budget")]
    pub sensor_retry_budget: u32,
    /// Raw valve output used by the hysteresis strategy when opening.
    #[serde(default = "default_open_output")]
    pub open_output: u32,
    /// Raw valve output applied once at startup in feedback mode.
    #[serde(default)]
    pub initial_output: u32,
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    /// Number of recent samples in the logged rolling average.
    #[serde(default = "default_average_window")]
    pub average_window: usize,
    #[serde(default = "default_true")]
    pub close_valve_on_exit: bool,
    #[serde(default)]
    pub pid: PidConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            setpoint: default_setpoint(),
            feedback_mode: FeedbackMode::default(),
            strategy: StrategyKind::default(),
            tick_period_ms: default_tick_period_ms(),
            tick_timeout_ms: default_tick_timeout_ms(),
            sensor_retry_interval_ms: default_sensor_retry_interval_ms(),
            sensor_retry_budget: default_sensor_retry_budget(),
            open_output: default_open_output(),
            initial_output: 0,
            history_len: default_history_len(),
            average_window: default_average_window(),
            close_valve_on_exit: true,
            pid: PidConfig::default(),
        }
    }
}

impl ControlConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_millis(self.tick_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.sensor_retry_interval_ms),
            budget: self.sensor_retry_budget,
        }
    }
}

/// PID gains and output band in percent of valve opening.
///
/// Gains are negative when opening the valve cools the enclosure.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PidConfig {
    #[serde(default = "default_kp")]
    pub kp: f64,
    #[serde(default = "default_ki")]
    pub ki: f64,
    #[serde(default = "default_kd")]
    pub kd: f64,
    #[serde(default = "default_output_min")]
    pub output_min: f64,
    #[serde(default = "default_output_max")]
    pub output_max: f64,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: default_kp(),
            ki: default_ki(),
            kd: default_kd(),
            output_min: default_output_min(),
            output_max: default_output_max(),
        }
    }
}

/// Flow controller connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ValveConfig {
    #[serde(default)]
    pub serial: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_node")]
    pub node: u8,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Full-scale flow. Read from the device at startup when unset.
    #[serde(default)]
    pub capacity: Option<f64>,
}

impl Default for ValveConfig {
    fn default() -> Self {
        Self {
            serial: String::new(),
            baud: default_baud(),
            node: default_node(),
            response_timeout_ms: default_response_timeout_ms(),
            capacity: None,
        }
    }
}

impl ValveConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// hwmon attribute files of the thermal sensors.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SensorConfig {
    #[serde(default = "default_dut_temperature")]
    pub dut_temperature: String,
    #[serde(default = "default_enclosure_temperature")]
    pub enclosure_temperature: String,
    #[serde(default = "default_dut_humidity")]
    pub dut_humidity: Option<String>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            dut_temperature: default_dut_temperature(),
            enclosure_temperature: default_enclosure_temperature(),
            dut_humidity: default_dut_humidity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// `tcp://host:port`; no network fan-out when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_telemetry_name")]
    pub name: String,
    #[serde(default = "default_telemetry_buffer")]
    pub buffer: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            name: default_telemetry_name(),
            buffer: default_telemetry_buffer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_text_log")]
    pub text_log: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            text_log: default_text_log(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HardwareConfig {
    /// Run against the simulated rig instead of real hardware.
    #[serde(default)]
    pub simulate: bool,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let control = &self.control;
        if !control.setpoint.is_finite() {
            return Err(ConfigError::Invalid("setpoint must be a finite number".to_string()));
        }
        if control.tick_period_ms == 0 {
            return Err(ConfigError::Invalid("tick_period_ms must be > 0".to_string()));
        }
        if control.tick_timeout_ms == 0 {
            return Err(ConfigError::Invalid("tick_timeout_ms must be > 0".to_string()));
        }
        if control.sensor_retry_budget == 0 {
            return Err(ConfigError::Invalid("sensor_retry_budget must be > 0".to_string()));
        }
        if control.open_output > crate::control::VALVE_FULLY_OPEN
            || control.initial_output > crate::control::VALVE_FULLY_OPEN
        {
            return Err(ConfigError::Invalid(
                "valve outputs must not exceed 0xFFFFFF".to_string(),
            ));
        }
        if control.history_len == 0 || control.average_window == 0 {
            return Err(ConfigError::Invalid(
                "history_len and average_window must be > 0".to_string(),
            ));
        }

        let pid = &control.pid;
        if !(pid.output_min < pid.output_max) {
            return Err(ConfigError::Invalid(format!(
                "PID output band [{}, {}] is empty",
                pid.output_min, pid.output_max
            )));
        }
        if pid.output_min < 0.0 || pid.output_max > 100.0 {
            return Err(ConfigError::Invalid(
                "PID output band must lie within 0..100 %".to_string(),
            ));
        }

        if !self.hardware.simulate && self.valve.serial.is_empty() {
            return Err(ConfigError::Invalid(
                "valve.serial is required unless hardware.simulate is set".to_string(),
            ));
        }
        if self.valve.response_timeout_ms == 0 {
            return Err(ConfigError::Invalid("response_timeout_ms must be > 0".to_string()));
        }
        if let Some(capacity) = self.valve.capacity {
            if !(capacity > 0.0) {
                return Err(ConfigError::Invalid("valve capacity must be > 0".to_string()));
            }
        }
        if self.telemetry.buffer == 0 {
            return Err(ConfigError::Invalid("telemetry buffer must be > 0".to_string()));
        }
        Ok(())
    }
}

// Default value functions
fn default_setpoint() -> f64 { -20.0 }
fn default_tick_period_ms() -> u64 { 1000 }
fn default_tick_timeout_ms() -> u64 { 10_000 }
fn default_sensor_retry_interval_ms() -> u64 { 100 }
fn default_sensor_retry_budget() -> u32 { 50 }
fn default_open_output() -> u32 { 0x80_0000 }
fn default_history_len() -> usize { 10_000 }
fn default_average_window() -> usize { 180 }
fn default_true() -> bool { true }
fn default_kp() -> f64 { -8.0 }
fn default_ki() -> f64 { -0.05 }
fn default_kd() -> f64 { -20.0 }
fn default_output_min() -> f64 { 5.0 }
fn default_output_max() -> f64 { 60.0 }
fn default_baud() -> u32 { 38400 }
fn default_node() -> u8 { 0x80 }
fn default_response_timeout_ms() -> u64 { 1000 }
fn default_dut_temperature() -> String { "/sys/class/hwmon/hwmon0/temp1_input".to_string() }
fn default_enclosure_temperature() -> String { "/sys/class/hwmon/hwmon1/temp1_input".to_string() }
fn default_dut_humidity() -> Option<String> { Some("/sys/class/hwmon/hwmon0/humidity1_input".to_string()) }
fn default_telemetry_name() -> String { "CoolingData".to_string() }
fn default_telemetry_buffer() -> usize { 16 }
fn default_table() -> String { "cooling.n2t".to_string() }
fn default_text_log() -> String { "temperature.log".to_string() }

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                Err(ConfigError::Toml(e))
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            Err(ConfigError::Io(e))
        }
    }
}
