// src/communication/mod.rs - Valve wire protocol and telemetry fan-out
pub mod flow_controller;
pub mod telemetry;
pub mod valve_protocol;

pub use flow_controller::{ExchangeStats, FlowController, ValveError};
pub use telemetry::{TelemetryMessage, TelemetryPublisher, TelemetryServer};
pub use valve_protocol::{Parameter, ProtocolError};
