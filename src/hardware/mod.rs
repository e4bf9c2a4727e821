// src/hardware/mod.rs - Device channel and thermal probe abstractions
pub mod hwmon;
pub mod serial;
pub mod sim;

pub use hwmon::HwmonProbe;
pub use serial::SerialChannel;
pub use sim::{RigOptions, SimulatedProbe, SimulatedRig, SimulatedValve};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Timeout after {0}ms waiting for device")]
    Timeout(u64),
    #[error("Device channel closed")]
    Closed,
    #[error("Sensor channel '{channel}' unavailable: {reason}")]
    Unavailable { channel: String, reason: String },
}

/// Byte-stream transport to a single serial device.
///
/// Every method takes `&mut self`: a channel has exactly one owner and at most
/// one request/response exchange in flight.
#[async_trait]
pub trait DeviceChannel: Send {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), HardwareError>;

    /// Read the bytes currently available, waiting until at least one arrives.
    /// Returns `Ok(0)` only when the device went away.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, HardwareError>;

    /// Drop unread input left behind by an abandoned exchange.
    async fn discard_input(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }
}

/// One poll of the two primary temperature channels, in °C.
/// A channel that did not deliver a valid value is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TemperatureReading {
    pub dut: Option<f64>,
    pub enclosure: Option<f64>,
}

impl TemperatureReading {
    pub fn is_complete(&self) -> bool {
        self.dut.is_some() && self.enclosure.is_some()
    }
}

#[async_trait]
pub trait ThermalProbe: Send {
    async fn read_temperatures(&mut self) -> TemperatureReading;

    /// Relative humidity next to the DUT in %.
    async fn read_humidity(&mut self) -> Result<f64, HardwareError>;
}
