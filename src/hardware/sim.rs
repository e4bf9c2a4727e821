// src/hardware/sim.rs - Simulated cooling rig: thermal enclosure plus flow controller
//
// The flow controller emulator speaks the real wire protocol, so everything
// above the device channel runs unchanged against it. Plant state advances
// lazily on every access, using the tokio clock (paused time in tests).
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::time::Instant;

use super::{DeviceChannel, HardwareError, TemperatureReading, ThermalProbe};
use crate::communication::valve_protocol::{
    decode_request, encode_answer, encode_float, encode_status, valve_percent, Parameter,
    RequestKind, MEASURE_FULL_SCALE,
};
use crate::control::ControlMode;

/// Status byte the emulator returns for requests it cannot serve.
const STATUS_PARAMETER_ERROR: u8 = 0x03;
/// Longest integration step in seconds.
const MAX_STEP: f64 = 1.0;

/// Thermal and device parameters of the simulated rig.
///
/// Couplings are first-order rate constants per second.
#[derive(Debug, Clone)]
pub struct RigOptions {
    pub node: u8,
    pub ambient: f64,
    pub initial_temperature: f64,
    /// Dry ice sublimation temperature and its coupling to the enclosure.
    pub ice_temperature: f64,
    pub ice_coupling: f64,
    /// Purge gas temperature and its coupling at a fully open valve.
    pub gas_temperature: f64,
    pub flow_coupling: f64,
    pub leak_coupling: f64,
    /// DUT lag behind the enclosure air.
    pub dut_coupling: f64,
    /// Full-scale flow in l/min.
    pub capacity: f64,
    pub ambient_humidity: f64,
    /// Peak amplitude of uniform sensor noise in °C.
    pub noise: f64,
    /// Bytes delivered per read; small values exercise line reassembly.
    pub reply_chunk: usize,
    /// Hold temperatures where `set_temperatures` put them.
    pub frozen: bool,
}

impl RigOptions {
    /// Dry-ice box with a warm nitrogen purge: opening the valve warms.
    pub fn dry_ice() -> Self {
        Self {
            node: 0x80,
            ambient: 20.0,
            initial_temperature: 20.0,
            ice_temperature: -78.5,
            ice_coupling: 0.004,
            gas_temperature: 20.0,
            flow_coupling: 0.02,
            leak_coupling: 0.001,
            dut_coupling: 0.05,
            capacity: 20.0,
            ambient_humidity: 40.0,
            noise: 0.02,
            reply_chunk: 64,
            frozen: false,
        }
    }

    /// Cold nitrogen boil-off, no ice: opening the valve cools.
    pub fn cold_gas() -> Self {
        Self {
            ice_coupling: 0.0,
            gas_temperature: -150.0,
            leak_coupling: 0.003,
            ..Self::dry_ice()
        }
    }
}

impl Default for RigOptions {
    fn default() -> Self {
        Self::dry_ice()
    }
}

/// Point-in-time view of the plant, for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigSnapshot {
    pub box_temperature: f64,
    pub dut_temperature: f64,
    pub humidity: f64,
    pub output_raw: u32,
    pub mode_code: u8,
    pub setpoint_raw: u32,
    pub counter: f64,
    pub writes: u64,
}

#[derive(Debug)]
struct Plant {
    options: RigOptions,
    box_temperature: f64,
    dut_temperature: f64,
    humidity: f64,
    output_raw: u32,
    mode_code: u8,
    setpoint_raw: u32,
    counter: f64,
    writes: u64,
    last_step: Instant,
    injected: VecDeque<Option<String>>,
    temperature_dropouts: u32,
    humidity_faults: u32,
    forced_mode: Option<u8>,
}

impl Plant {
    /// Valve opening as a fraction, honouring the control mode.
    fn opening(&self) -> f64 {
        match ControlMode::from_wire(self.mode_code) {
            Some(ControlMode::Open) => 1.0,
            Some(ControlMode::Feedback) => (valve_percent(self.output_raw) / 100.0).min(1.0),
            _ => 0.0,
        }
    }

    fn advance(&mut self, now: Instant) {
        let mut remaining = now.saturating_duration_since(self.last_step).as_secs_f64();
        self.last_step = now;

        let o = &self.options;
        let opening = self.opening();
        while remaining > 0.0 {
            let dt = remaining.min(MAX_STEP);
            remaining -= dt;

            self.counter += o.capacity * opening * dt / 60.0;
            if o.frozen {
                continue;
            }
            let d_box = o.ice_coupling * (o.ice_temperature - self.box_temperature)
                + o.flow_coupling * opening * (o.gas_temperature - self.box_temperature)
                + o.leak_coupling * (o.ambient - self.box_temperature);
            self.box_temperature += d_box * dt;
            self.dut_temperature += o.dut_coupling * (self.box_temperature - self.dut_temperature) * dt;

            // Dry purge gas displaces moist air
            let target = o.ambient_humidity * (1.0 - opening).max(0.02);
            self.humidity += 0.01 * (target - self.humidity) * dt;
        }
    }

    fn measure_raw(&self) -> u32 {
        (self.opening() * MEASURE_FULL_SCALE).round() as u32
    }

    fn read_raw(&self, parameter: Parameter) -> u32 {
        match parameter {
            Parameter::ValveOutput => self.output_raw,
            Parameter::Measure => self.measure_raw(),
            Parameter::Setpoint => self.setpoint_raw,
            Parameter::ControlMode => u32::from(self.forced_mode.unwrap_or(self.mode_code)),
            Parameter::CounterValue => encode_float(self.counter),
            Parameter::Capacity => encode_float(self.options.capacity),
        }
    }

    fn write_raw(&mut self, parameter: Parameter, raw: u32) -> bool {
        match parameter {
            Parameter::ValveOutput => self.output_raw = raw,
            Parameter::Setpoint => self.setpoint_raw = raw,
            Parameter::ControlMode => self.mode_code = raw as u8,
            Parameter::CounterValue => self.counter = f64::from(f32::from_bits(raw)),
            Parameter::Measure | Parameter::Capacity => return false,
        }
        self.writes += 1;
        true
    }

    /// Answer one request line. `None` means the device stays silent.
    fn handle(&mut self, line: &str) -> Option<String> {
        if let Some(injected) = self.injected.pop_front() {
            return injected;
        }

        let node = self.options.node;
        let request = match decode_request(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("Simulated valve rejects {:?}: {}", line.trim_end(), e);
                return Some(encode_status(node, STATUS_PARAMETER_ERROR, 0));
            }
        };
        if request.node != node {
            return None;
        }

        match request.kind {
            RequestKind::Read { parameter } => {
                let raw = self.read_raw(parameter);
                match encode_answer(node, parameter, raw) {
                    Ok(answer) => Some(answer),
                    Err(_) => Some(encode_status(node, STATUS_PARAMETER_ERROR, 0)),
                }
            }
            RequestKind::Write { parameter, raw } => {
                if self.write_raw(parameter, raw) {
                    Some(encode_status(node, 0, 0))
                } else {
                    Some(encode_status(node, STATUS_PARAMETER_ERROR, 4))
                }
            }
        }
    }
}

/// Shared handle to the simulated plant.
#[derive(Debug, Clone)]
pub struct SimulatedRig {
    plant: Arc<Mutex<Plant>>,
}

impl SimulatedRig {
    pub fn new(options: RigOptions) -> Self {
        let plant = Plant {
            box_temperature: options.initial_temperature,
            dut_temperature: options.initial_temperature,
            humidity: options.ambient_humidity,
            output_raw: 0,
            mode_code: ControlMode::Closed.wire_code(),
            setpoint_raw: 0,
            counter: 0.0,
            writes: 0,
            last_step: Instant::now(),
            injected: VecDeque::new(),
            temperature_dropouts: 0,
            humidity_faults: 0,
            forced_mode: None,
            options,
        };
        Self {
            plant: Arc::new(Mutex::new(plant)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Plant> {
        // The plant holds plain numbers; a panic elsewhere cannot leave it torn
        let mut plant = self.plant.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        plant.advance(Instant::now());
        plant
    }

    pub fn valve(&self) -> SimulatedValve {
        SimulatedValve {
            rig: self.clone(),
            outbox: VecDeque::new(),
        }
    }

    pub fn probe(&self) -> SimulatedProbe {
        SimulatedProbe { rig: self.clone() }
    }

    pub fn options(&self) -> RigOptions {
        self.lock().options.clone()
    }

    pub fn snapshot(&self) -> RigSnapshot {
        let plant = self.lock();
        RigSnapshot {
            box_temperature: plant.box_temperature,
            dut_temperature: plant.dut_temperature,
            humidity: plant.humidity,
            output_raw: plant.output_raw,
            mode_code: plant.mode_code,
            setpoint_raw: plant.setpoint_raw,
            counter: plant.counter,
            writes: plant.writes,
        }
    }

    pub fn set_temperatures(&self, dut: f64, enclosure: f64) {
        let mut plant = self.lock();
        plant.dut_temperature = dut;
        plant.box_temperature = enclosure;
    }

    /// Answer the next request with `line` verbatim instead of the real reply.
    pub fn inject_reply(&self, line: &str) {
        self.lock().injected.push_back(Some(line.to_string()));
    }

    /// Leave the next request unanswered.
    pub fn inject_silence(&self) {
        self.lock().injected.push_back(None);
    }

    /// Make the next `polls` temperature polls report no channel at all.
    pub fn drop_temperature_reads(&self, polls: u32) {
        self.lock().temperature_dropouts = polls;
    }

    pub fn fail_humidity_reads(&self, reads: u32) {
        self.lock().humidity_faults = reads;
    }

    /// Report `code` on every mode read-back regardless of what was written.
    pub fn force_mode_readback(&self, code: Option<u8>) {
        self.lock().forced_mode = code;
    }
}

fn noise(amplitude: f64) -> f64 {
    if amplitude > 0.0 {
        (rand::random::<f64>() - 0.5) * 2.0 * amplitude
    } else {
        0.0
    }
}

/// Device channel backed by the flow controller emulator.
#[derive(Debug)]
pub struct SimulatedValve {
    rig: SimulatedRig,
    outbox: VecDeque<u8>,
}

#[async_trait]
impl DeviceChannel for SimulatedValve {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), HardwareError> {
        let text = String::from_utf8_lossy(buf);
        for line in text.split_inclusive("\r\n") {
            let reply = self.rig.lock().handle(line);
            if let Some(reply) = reply {
                self.outbox.extend(reply.as_bytes());
            }
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, HardwareError> {
        if self.outbox.is_empty() {
            // A silent device: the caller's response timeout decides
            return std::future::pending().await;
        }
        let chunk = self.rig.lock().options.reply_chunk.max(1);
        let n = buf.len().min(chunk).min(self.outbox.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn discard_input(&mut self) -> Result<(), HardwareError> {
        self.outbox.clear();
        Ok(())
    }
}

/// Thermal probe reading the simulated enclosure.
#[derive(Debug, Clone)]
pub struct SimulatedProbe {
    rig: SimulatedRig,
}

#[async_trait]
impl ThermalProbe for SimulatedProbe {
    async fn read_temperatures(&mut self) -> TemperatureReading {
        let mut plant = self.rig.lock();
        if plant.temperature_dropouts > 0 {
            plant.temperature_dropouts -= 1;
            return TemperatureReading::default();
        }
        let amplitude = plant.options.noise;
        TemperatureReading {
            dut: Some(plant.dut_temperature + noise(amplitude)),
            enclosure: Some(plant.box_temperature + noise(amplitude)),
        }
    }

    async fn read_humidity(&mut self) -> Result<f64, HardwareError> {
        let mut plant = self.rig.lock();
        if plant.humidity_faults > 0 {
            plant.humidity_faults -= 1;
            return Err(HardwareError::Unavailable {
                channel: "humidity".to_string(),
                reason: "simulated read fault".to_string(),
            });
        }
        Ok(plant.humidity)
    }
}
