// src/communication/flow_controller.rs - Request/response driver for the flow controller
use std::time::Duration;

use thiserror::Error;

use super::valve_protocol::{
    capacity_fraction, decode_answer, decode_float, decode_status, encode_command,
    encode_request, encode_write, raw_from_fraction, valve_percent, Parameter, ProtocolError,
};
use crate::control::{ControlMode, ValveCommand};
use crate::hardware::{DeviceChannel, HardwareError};

const READ_CHUNK: usize = 64;
/// Longest line a well-behaved device sends; anything longer is garbage.
const MAX_LINE: usize = 256;

#[derive(Debug, Error)]
pub enum ValveError {
    #[error("Valve channel error: {0}")]
    Channel(#[from] HardwareError),
    #[error("Valve protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Valve rejected mode {requested}: read back code {reported}")]
    ModeRejected { requested: ControlMode, reported: u8 },
}

/// Exchange statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
}

/// Drives the valve codec over an exclusively owned device channel.
///
/// One exchange at a time: stale input is discarded, the request written,
/// and bytes accumulated until a CRLF-terminated line arrives or the response
/// timeout expires.
#[derive(Debug)]
pub struct FlowController<C> {
    channel: C,
    node: u8,
    response_timeout: Duration,
    buffer: Vec<u8>,
    stats: ExchangeStats,
}

impl<C: DeviceChannel> FlowController<C> {
    pub fn new(channel: C, node: u8, response_timeout: Duration) -> Self {
        Self {
            channel,
            node,
            response_timeout,
            buffer: Vec::with_capacity(MAX_LINE),
            stats: ExchangeStats::default(),
        }
    }

    pub fn node(&self) -> u8 {
        self.node
    }

    pub fn stats(&self) -> &ExchangeStats {
        &self.stats
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Write one frame and return the response line including CRLF.
    pub async fn exchange(&mut self, request: &str) -> Result<String, ValveError> {
        let result = self.exchange_inner(request).await;
        match &result {
            Ok(_) => self.stats.responses_received += 1,
            Err(ValveError::Channel(HardwareError::Timeout(_))) => {
                self.stats.timeouts += 1;
                self.stats.errors += 1;
            }
            Err(_) => self.stats.errors += 1,
        }
        result
    }

    async fn exchange_inner(&mut self, request: &str) -> Result<String, ValveError> {
        self.channel.discard_input().await?;
        self.buffer.clear();

        tracing::debug!("valve <- {}", request.trim_end());
        self.channel.write_all(request.as_bytes()).await?;
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += request.len() as u64;

        let timeout_ms = self.response_timeout.as_millis() as u64;
        let line = tokio::time::timeout(self.response_timeout, self.read_line())
            .await
            .map_err(|_| HardwareError::Timeout(timeout_ms))??;

        tracing::debug!("valve -> {}", line.trim_end());
        Ok(line)
    }

    async fn read_line(&mut self) -> Result<String, ValveError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(end) = self.buffer.windows(2).position(|w| w == b"\r\n") {
                let line: Vec<u8> = self.buffer.drain(..end + 2).collect();
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            if self.buffer.len() > MAX_LINE {
                let garbage = String::from_utf8_lossy(&self.buffer).into_owned();
                self.buffer.clear();
                return Err(ProtocolError::Truncated {
                    expected: MAX_LINE,
                    actual: garbage.len(),
                }
                .into());
            }

            let n = self.channel.read(&mut chunk).await?;
            if n == 0 {
                return Err(HardwareError::Closed.into());
            }
            self.stats.bytes_received += n as u64;
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Write `raw` to a parameter and require a zero status.
    pub async fn write_parameter(&mut self, parameter: Parameter, raw: u32) -> Result<(), ValveError> {
        let request = encode_write(self.node, parameter, raw)?;
        let response = self.exchange(&request).await?;
        decode_status(&response)?;
        Ok(())
    }

    pub async fn read_parameter(&mut self, parameter: Parameter) -> Result<u32, ValveError> {
        let request = encode_request(self.node, parameter);
        let response = self.exchange(&request).await?;
        Ok(decode_answer(&response, parameter)?)
    }

    /// Send a valve command. Mode changes are confirmed by read-back.
    pub async fn apply(&mut self, command: &ValveCommand) -> Result<(), ValveError> {
        match command {
            ValveCommand::SetOutput(raw) => self.set_valve_output(*raw).await,
            ValveCommand::SetControlMode(mode) => self.set_control_mode(*mode).await,
        }
    }

    pub async fn set_valve_output(&mut self, raw: u32) -> Result<(), ValveError> {
        let request = encode_command(self.node, &ValveCommand::SetOutput(raw))?;
        let response = self.exchange(&request).await?;
        decode_status(&response)?;
        Ok(())
    }

    pub async fn valve_output_raw(&mut self) -> Result<u32, ValveError> {
        self.read_parameter(Parameter::ValveOutput).await
    }

    /// Valve opening in percent.
    pub async fn valve_position(&mut self) -> Result<f64, ValveError> {
        Ok(valve_percent(self.valve_output_raw().await?))
    }

    /// Switch the control mode and confirm it by reading the mode code back.
    pub async fn set_control_mode(&mut self, mode: ControlMode) -> Result<(), ValveError> {
        let request = encode_command(self.node, &ValveCommand::SetControlMode(mode))?;
        let response = self.exchange(&request).await?;
        decode_status(&response)?;

        let reported = self.control_mode_code().await?;
        if reported != mode.wire_code() {
            tracing::error!(
                "Valve mode {} not confirmed: device reports code {}",
                mode,
                reported
            );
            return Err(ValveError::ModeRejected {
                requested: mode,
                reported,
            });
        }
        tracing::info!("Valve control mode {} confirmed", mode);
        Ok(())
    }

    pub async fn control_mode_code(&mut self) -> Result<u8, ValveError> {
        let raw = self.read_parameter(Parameter::ControlMode).await?;
        Ok(raw as u8)
    }

    pub async fn control_mode(&mut self) -> Result<ControlMode, ValveError> {
        let code = self.control_mode_code().await?;
        ControlMode::from_wire(code).ok_or_else(|| ProtocolError::UnknownMode(code).into())
    }

    /// Raw measured flow, 32000 at full capacity.
    pub async fn measure_raw(&mut self) -> Result<u32, ValveError> {
        self.read_parameter(Parameter::Measure).await
    }

    /// Measured flow as a fraction of capacity.
    pub async fn measure(&mut self) -> Result<f64, ValveError> {
        Ok(capacity_fraction(self.measure_raw().await?))
    }

    /// Flow setpoint as a fraction of capacity.
    pub async fn set_setpoint(&mut self, fraction: f64) -> Result<(), ValveError> {
        self.write_parameter(Parameter::Setpoint, raw_from_fraction(fraction))
            .await
    }

    pub async fn setpoint(&mut self) -> Result<f64, ValveError> {
        Ok(capacity_fraction(
            self.read_parameter(Parameter::Setpoint).await?,
        ))
    }

    /// Totalized flow in capacity units.
    pub async fn counter_value(&mut self) -> Result<f64, ValveError> {
        Ok(decode_float(
            self.read_parameter(Parameter::CounterValue).await?,
        ))
    }

    /// Full-scale flow of the instrument.
    pub async fn capacity(&mut self) -> Result<f64, ValveError> {
        Ok(decode_float(self.read_parameter(Parameter::Capacity).await?))
    }
}

impl ValveError {
    pub fn is_protocol(&self) -> bool {
        matches!(self, ValveError::Protocol(_))
    }
}
