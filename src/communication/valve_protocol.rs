// src/communication/valve_protocol.rs - ASCII-hex codec for the flow controller
//
// Frame layout, all fields upper-case hex:
//
//   ':' LEN NODE CMD PROC PARAM VALUE... "\r\n"
//
// LEN counts the bytes following it. Answers carry the value at character
// offset 11 (13 for the capacity parameter, which is preceded by one pad
// byte). The codec is pure: no retries, no state.
use thiserror::Error;

use crate::control::{ValveCommand, VALVE_FULLY_OPEN};

pub const START_MARKER: char = ':';
pub const TERMINATOR: &str = "\r\n";
pub const DEFAULT_NODE: u8 = 0x80;

pub const CMD_STATUS: u8 = 0x00;
pub const CMD_WRITE: u8 = 0x01;
pub const CMD_ANSWER: u8 = 0x02;
pub const CMD_REQUEST: u8 = 0x04;

/// Largest valve output magnitude, 24 bits.
pub const MAX_VALVE_OUTPUT: u32 = VALVE_FULLY_OPEN;
/// Percent of full opening per raw valve output count.
pub const VALVE_OUTPUT_SCALE: f64 = 5.963_686_849_79e-6;
/// Raw measure/setpoint value corresponding to 100 % of capacity.
pub const MEASURE_FULL_SCALE: f64 = 32000.0;

/// Characters before the first payload byte of an answer: marker, length,
/// node, command, process and parameter.
const HEADER_LEN: usize = 11;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Frame truncated: expected at least {expected} characters, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Frame does not start with ':'")]
    MissingStartMarker,
    #[error("Frame is not terminated by CRLF")]
    MissingTerminator,
    #[error("Invalid hex in frame: {0:?}")]
    InvalidHex(String),
    #[error("Declared length {declared} does not match {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Unexpected command 0x{actual:02X}, expected 0x{expected:02X}")]
    UnexpectedCommand { expected: u8, actual: u8 },
    #[error("Answer for parameter {actual_process:02X}/{actual_parameter:02X}, expected {expected_process:02X}/{expected_parameter:02X}")]
    ParameterMismatch {
        expected_process: u8,
        expected_parameter: u8,
        actual_process: u8,
        actual_parameter: u8,
    },
    #[error("Unknown parameter {process:02X}/{parameter:02X}")]
    UnknownParameter { process: u8, parameter: u8 },
    #[error("Device reported status 0x{status:02X} at byte {index}")]
    DeviceStatus { status: u8, index: u8 },
    #[error("Value 0x{value:X} exceeds maximum 0x{max:X}")]
    ValueOutOfRange { value: u32, max: u32 },
    #[error("Unknown control mode code {0}")]
    UnknownMode(u8),
}

/// Device parameters the controller reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parameter {
    ValveOutput,
    Measure,
    Setpoint,
    ControlMode,
    CounterValue,
    Capacity,
}

impl Parameter {
    pub const ALL: [Parameter; 6] = [
        Parameter::ValveOutput,
        Parameter::Measure,
        Parameter::Setpoint,
        Parameter::ControlMode,
        Parameter::CounterValue,
        Parameter::Capacity,
    ];

    pub fn process(self) -> u8 {
        match self {
            Parameter::ValveOutput => 0x72,
            Parameter::Measure | Parameter::Setpoint | Parameter::ControlMode => 0x01,
            Parameter::CounterValue => 0x68,
            Parameter::Capacity => 0x01,
        }
    }

    /// Parameter byte, including the type bits.
    pub fn index(self) -> u8 {
        match self {
            Parameter::ValveOutput => 0x41,
            Parameter::Measure => 0x20,
            Parameter::Setpoint => 0x21,
            Parameter::ControlMode => 0x04,
            Parameter::CounterValue => 0x41,
            Parameter::Capacity => 0x4D,
        }
    }

    /// Value width in bytes.
    pub fn width(self) -> usize {
        match self {
            Parameter::ValveOutput | Parameter::CounterValue | Parameter::Capacity => 4,
            Parameter::Measure | Parameter::Setpoint => 2,
            Parameter::ControlMode => 1,
        }
    }

    /// Character offset of the value in an answer frame.
    pub fn offset(self) -> usize {
        match self {
            Parameter::Capacity => 13,
            _ => HEADER_LEN,
        }
    }

    /// Shortest answer line (without CRLF) that still holds the whole value.
    pub fn min_answer_len(self) -> usize {
        self.offset() + 2 * self.width()
    }

    pub fn max_raw(self) -> u32 {
        match self {
            Parameter::ValveOutput => MAX_VALVE_OUTPUT,
            Parameter::Measure | Parameter::Setpoint => 0xFFFF,
            Parameter::ControlMode => 0xFF,
            Parameter::CounterValue | Parameter::Capacity => u32::MAX,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Parameter::CounterValue | Parameter::Capacity)
    }

    pub fn from_wire(process: u8, parameter: u8) -> Result<Self, ProtocolError> {
        Self::ALL
            .into_iter()
            .find(|p| p.process() == process && p.index() == parameter)
            .ok_or(ProtocolError::UnknownParameter { process, parameter })
    }
}

/// A decoded frame: everything between the length byte and CRLF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub node: u8,
    pub command: u8,
    /// Bytes after the command byte.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Write { parameter: Parameter, raw: u32 },
    Read { parameter: Parameter },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub node: u8,
    pub kind: RequestKind,
}

fn check_range(parameter: Parameter, raw: u32) -> Result<(), ProtocolError> {
    let max = parameter.max_raw();
    if raw > max {
        return Err(ProtocolError::ValueOutOfRange { value: raw, max });
    }
    Ok(())
}

fn hex_value(raw: u32, width: usize) -> String {
    format!("{:0w$X}", raw, w = 2 * width)
}

/// Encode a write of `raw` to `parameter`.
pub fn encode_write(node: u8, parameter: Parameter, raw: u32) -> Result<String, ProtocolError> {
    check_range(parameter, raw)?;
    Ok(format!(
        ":{:02X}{:02X}{:02X}{:02X}{:02X}{}{}",
        4 + parameter.width(),
        node,
        CMD_WRITE,
        parameter.process(),
        parameter.index(),
        hex_value(raw, parameter.width()),
        TERMINATOR
    ))
}

/// Encode a read request. Process and parameter are repeated as the device
/// expects: once to address, once to select the answer layout.
pub fn encode_request(node: u8, parameter: Parameter) -> String {
    let (p, i) = (parameter.process(), parameter.index());
    format!(
        ":06{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}{}",
        node, CMD_REQUEST, p, i, p, i, TERMINATOR
    )
}

pub fn encode_command(node: u8, command: &ValveCommand) -> Result<String, ProtocolError> {
    match command {
        ValveCommand::SetOutput(raw) => encode_write(node, Parameter::ValveOutput, *raw),
        ValveCommand::SetControlMode(mode) => {
            encode_write(node, Parameter::ControlMode, u32::from(mode.wire_code()))
        }
    }
}

/// Encode the device's answer to a read request.
pub fn encode_answer(node: u8, parameter: Parameter, raw: u32) -> Result<String, ProtocolError> {
    check_range(parameter, raw)?;
    let pad_bytes = (parameter.offset() - HEADER_LEN) / 2;
    Ok(format!(
        ":{:02X}{:02X}{:02X}{:02X}{:02X}{}{}{}",
        4 + pad_bytes + parameter.width(),
        node,
        CMD_ANSWER,
        parameter.process(),
        parameter.index(),
        "00".repeat(pad_bytes),
        hex_value(raw, parameter.width()),
        TERMINATOR
    ))
}

/// Encode a status frame. Status 0 acknowledges a write.
pub fn encode_status(node: u8, status: u8, index: u8) -> String {
    format!(
        ":04{:02X}{:02X}{:02X}{:02X}{}",
        node, CMD_STATUS, status, index, TERMINATOR
    )
}

fn strip_line(line: &str) -> Result<&str, ProtocolError> {
    let body = line
        .strip_suffix(TERMINATOR)
        .ok_or(ProtocolError::MissingTerminator)?;
    if !body.starts_with(START_MARKER) {
        return Err(ProtocolError::MissingStartMarker);
    }
    Ok(body)
}

fn decode_hex(hex: &str) -> Result<Vec<u8>, ProtocolError> {
    if hex.len() % 2 != 0 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ProtocolError::InvalidHex(hex.to_string()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| ProtocolError::InvalidHex(hex.to_string()))
        })
        .collect()
}

/// Parse a complete line including CRLF into a frame.
pub fn decode_frame(line: &str) -> Result<Frame, ProtocolError> {
    let body = strip_line(line)?;
    let bytes = decode_hex(&body[1..])?;
    if bytes.len() < 3 {
        return Err(ProtocolError::Truncated {
            expected: 7,
            actual: body.len(),
        });
    }
    let declared = usize::from(bytes[0]);
    if declared != bytes.len() - 1 {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: bytes.len() - 1,
        });
    }
    Ok(Frame {
        node: bytes[1],
        command: bytes[2],
        payload: bytes[3..].to_vec(),
    })
}

fn be_value(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}

fn status_of(frame: &Frame) -> Result<(u8, u8), ProtocolError> {
    match frame.payload.as_slice() {
        [status, index] => Ok((*status, *index)),
        other => Err(ProtocolError::LengthMismatch {
            declared: 4,
            actual: other.len() + 2,
        }),
    }
}

/// Decode a status frame, failing on a non-zero status byte.
pub fn decode_status(line: &str) -> Result<(), ProtocolError> {
    let frame = decode_frame(line)?;
    if frame.command != CMD_STATUS {
        return Err(ProtocolError::UnexpectedCommand {
            expected: CMD_STATUS,
            actual: frame.command,
        });
    }
    match status_of(&frame)? {
        (0, _) => Ok(()),
        (status, index) => Err(ProtocolError::DeviceStatus { status, index }),
    }
}

/// Decode the raw value of an answer to a read of `parameter`.
pub fn decode_answer(line: &str, parameter: Parameter) -> Result<u32, ProtocolError> {
    let body = strip_line(line)?;
    let frame = decode_frame(line)?;

    // A device that cannot serve the read answers with a status frame
    if frame.command == CMD_STATUS {
        let (status, index) = status_of(&frame)?;
        if status != 0 {
            return Err(ProtocolError::DeviceStatus { status, index });
        }
    }
    if frame.command != CMD_ANSWER {
        return Err(ProtocolError::UnexpectedCommand {
            expected: CMD_ANSWER,
            actual: frame.command,
        });
    }

    if body.len() < parameter.min_answer_len() {
        return Err(ProtocolError::Truncated {
            expected: parameter.min_answer_len(),
            actual: body.len(),
        });
    }

    let (process, index) = (frame.payload[0], frame.payload[1]);
    if process != parameter.process() || index != parameter.index() {
        return Err(ProtocolError::ParameterMismatch {
            expected_process: parameter.process(),
            expected_parameter: parameter.index(),
            actual_process: process,
            actual_parameter: index,
        });
    }

    let start = (parameter.offset() - 7) / 2;
    Ok(be_value(&frame.payload[start..start + parameter.width()]))
}

/// Decode a request as the device sees it.
pub fn decode_request(line: &str) -> Result<Request, ProtocolError> {
    let frame = decode_frame(line)?;
    if frame.payload.len() < 2 {
        return Err(ProtocolError::Truncated {
            expected: HEADER_LEN,
            actual: 7 + 2 * frame.payload.len(),
        });
    }
    let parameter = Parameter::from_wire(frame.payload[0], frame.payload[1])?;
    let rest = &frame.payload[2..];

    let kind = match frame.command {
        CMD_WRITE => {
            if rest.len() != parameter.width() {
                return Err(ProtocolError::LengthMismatch {
                    declared: 4 + parameter.width(),
                    actual: 4 + rest.len(),
                });
            }
            let raw = be_value(rest);
            check_range(parameter, raw)?;
            RequestKind::Write { parameter, raw }
        }
        CMD_REQUEST => {
            if rest != [parameter.process(), parameter.index()] {
                return Err(ProtocolError::LengthMismatch {
                    declared: 6,
                    actual: frame.payload.len() + 2,
                });
            }
            RequestKind::Read { parameter }
        }
        actual => {
            return Err(ProtocolError::UnexpectedCommand {
                expected: CMD_REQUEST,
                actual,
            })
        }
    };

    Ok(Request {
        node: frame.node,
        kind,
    })
}

/// Valve opening in percent for a raw output value.
pub fn valve_percent(raw: u32) -> f64 {
    f64::from(raw) * VALVE_OUTPUT_SCALE
}

/// Raw output for an opening in percent, saturating at the 24-bit range.
pub fn raw_from_percent(percent: f64) -> u32 {
    if !percent.is_finite() || percent <= 0.0 {
        return 0;
    }
    let raw = (percent / VALVE_OUTPUT_SCALE).round();
    if raw >= f64::from(MAX_VALVE_OUTPUT) {
        MAX_VALVE_OUTPUT
    } else {
        raw as u32
    }
}

/// Fraction of capacity for a raw measure or setpoint value.
pub fn capacity_fraction(raw: u32) -> f64 {
    f64::from(raw) / MEASURE_FULL_SCALE
}

/// Raw setpoint for a fraction of capacity, saturating at the 16-bit range.
pub fn raw_from_fraction(fraction: f64) -> u32 {
    if !fraction.is_finite() || fraction <= 0.0 {
        return 0;
    }
    (fraction * MEASURE_FULL_SCALE).round().min(f64::from(0xFFFF_u32)) as u32
}

/// Float parameters travel as IEEE-754 single precision, big-endian.
pub fn decode_float(raw: u32) -> f64 {
    f64::from(f32::from_bits(raw))
}

pub fn encode_float(value: f64) -> u32 {
    (value as f32).to_bits()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlMode;
    use proptest::prelude::*;

    #[test]
    fn test_encode_valve_output() {
        assert_eq!(
            encode_command(DEFAULT_NODE, &ValveCommand::SetOutput(0x80_0000)).unwrap(),
            ":088001724100800000\r\n"
        );
        assert_eq!(
            encode_command(DEFAULT_NODE, &ValveCommand::SetOutput(0)).unwrap(),
            ":088001724100000000\r\n"
        );
    }

    #[test]
    fn test_encode_control_mode() {
        let cmd = ValveCommand::SetControlMode(ControlMode::Feedback);
        assert_eq!(encode_command(DEFAULT_NODE, &cmd).unwrap(), ":058001010404\r\n");
        let cmd = ValveCommand::SetControlMode(ControlMode::Off);
        assert_eq!(encode_command(DEFAULT_NODE, &cmd).unwrap(), ":058001010403\r\n");
    }

    #[test]
    fn test_encode_request_matches_device_format() {
        assert_eq!(
            encode_request(DEFAULT_NODE, Parameter::Setpoint),
            ":06800401210121\r\n"
        );
        assert_eq!(
            encode_request(DEFAULT_NODE, Parameter::ValveOutput),
            ":06800472417241\r\n"
        );
    }

    #[test]
    fn test_reject_out_of_range_output() {
        let err = encode_command(DEFAULT_NODE, &ValveCommand::SetOutput(0x100_0000)).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::ValueOutOfRange {
                value: 0x100_0000,
                max: 0xFF_FFFF
            }
        );
    }

    #[test]
    fn test_decode_answers() {
        assert_eq!(
            decode_answer(":0880027241007FFFFF\r\n", Parameter::ValveOutput).unwrap(),
            0x7F_FFFF
        );
        assert_eq!(
            decode_answer(":068002012031A5\r\n", Parameter::Measure).unwrap(),
            0x31A5
        );
        assert_eq!(
            decode_answer(":05800201040C\r\n", Parameter::ControlMode).unwrap(),
            0x0C
        );
    }

    #[test]
    fn test_capacity_answer_is_padded() {
        let line = encode_answer(DEFAULT_NODE, Parameter::Capacity, encode_float(20.0)).unwrap();
        assert_eq!(line, ":09800201 4D0041A00000\r\n".replace(' ', ""));
        let raw = decode_answer(&line, Parameter::Capacity).unwrap();
        assert_eq!(decode_float(raw), 20.0);
    }

    #[test]
    fn test_short_answer_is_truncated() {
        let err = decode_answer(":0680027241\r\n", Parameter::ValveOutput).unwrap_err();
        assert!(matches!(err, ProtocolError::LengthMismatch { .. } | ProtocolError::Truncated { .. }));

        // Declared length agrees with the bytes but the value is too short
        let err = decode_answer(":058002724100\r\n", Parameter::ValveOutput).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Truncated {
                expected: 19,
                actual: 13
            }
        );
    }

    #[test]
    fn test_malformed_frames() {
        assert_eq!(
            decode_answer("0880027241007FFFFF\r\n", Parameter::ValveOutput).unwrap_err(),
            ProtocolError::MissingStartMarker
        );
        assert_eq!(
            decode_answer(":0880027241007FFFFF", Parameter::ValveOutput).unwrap_err(),
            ProtocolError::MissingTerminator
        );
        assert!(matches!(
            decode_answer(":0880027241007FFFZZ\r\n", Parameter::ValveOutput).unwrap_err(),
            ProtocolError::InvalidHex(_)
        ));
        assert!(matches!(
            decode_answer(":0880027241007FFFF\r\n", Parameter::ValveOutput).unwrap_err(),
            ProtocolError::InvalidHex(_)
        ));
    }

    #[test]
    fn test_parameter_echo_checked() {
        let err = decode_answer(":068002012131A5\r\n", Parameter::Measure).unwrap_err();
        assert!(matches!(err, ProtocolError::ParameterMismatch { .. }));
    }

    #[test]
    fn test_status_frames() {
        assert_eq!(encode_status(DEFAULT_NODE, 0, 5), ":0480000005\r\n");
        assert!(decode_status(":0480000005\r\n").is_ok());
        assert_eq!(
            decode_status(":0480000304\r\n").unwrap_err(),
            ProtocolError::DeviceStatus { status: 3, index: 4 }
        );
        // A read the device refused surfaces as the device status
        assert_eq!(
            decode_answer(":0480000304\r\n", Parameter::Measure).unwrap_err(),
            ProtocolError::DeviceStatus { status: 3, index: 4 }
        );
    }

    #[test]
    fn test_decode_requests() {
        let req = decode_request(":06800401210121\r\n").unwrap();
        assert_eq!(req.node, 0x80);
        assert_eq!(req.kind, RequestKind::Read { parameter: Parameter::Setpoint });

        let req = decode_request(":058001010408\r\n").unwrap();
        assert_eq!(
            req.kind,
            RequestKind::Write { parameter: Parameter::ControlMode, raw: 8 }
        );

        assert!(matches!(
            decode_request(":058001FF0408\r\n").unwrap_err(),
            ProtocolError::UnknownParameter { process: 0xFF, parameter: 0x04 }
        ));
    }

    #[test]
    fn test_percent_conversion() {
        assert_eq!(raw_from_percent(0.0), 0);
        assert_eq!(raw_from_percent(-3.0), 0);
        assert_eq!(raw_from_percent(1000.0), MAX_VALVE_OUTPUT);
        let raw = raw_from_percent(50.0);
        assert!((valve_percent(raw) - 50.0).abs() < 1e-4);
        assert_eq!(capacity_fraction(32000), 1.0);
        assert_eq!(raw_from_fraction(0.5), 16000);
    }

    proptest! {
        #[test]
        fn prop_set_output_roundtrip(raw in 0u32..=MAX_VALVE_OUTPUT) {
            let line = encode_command(0x80, &ValveCommand::SetOutput(raw)).unwrap();
            let req = decode_request(&line).unwrap();
            prop_assert_eq!(req.kind, RequestKind::Write { parameter: Parameter::ValveOutput, raw });

            let answer = encode_answer(0x80, Parameter::ValveOutput, raw).unwrap();
            prop_assert_eq!(decode_answer(&answer, Parameter::ValveOutput).unwrap(), raw);
        }

        #[test]
        fn prop_set_output_out_of_range_fails(raw in (MAX_VALVE_OUTPUT + 1)..=u32::MAX) {
            let is_out_of_range = matches!(
                encode_command(0x80, &ValveCommand::SetOutput(raw)),
                Err(ProtocolError::ValueOutOfRange { .. })
            );
            prop_assert!(is_out_of_range);
        }
    }
}
