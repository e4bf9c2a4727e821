// src/sensors.rs - Sample acquisition with bounded retry
use std::time::Duration;

use thiserror::Error;

use crate::communication::{FlowController, ValveError};
use crate::hardware::{DeviceChannel, ThermalProbe};
use crate::sample::Sample;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Temperature sensors unavailable after {attempts} attempts")]
    Fault { attempts: u32 },
    #[error("Valve telemetry failed: {0}")]
    Valve(#[from] ValveError),
}

/// Conditions that degrade a sample without failing the tick.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorWarning {
    #[error("Humidity read error: {0}")]
    HumidityUnavailable(String),
    #[error("Temperature channel '{channel}' unavailable after {attempts} attempts")]
    TemperatureChannelMissing { channel: &'static str, attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub budget: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            budget: 50,
        }
    }
}

/// A sample plus everything that went wrong while acquiring it.
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub sample: Sample,
    pub warnings: Vec<SensorWarning>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Temperatures {
    pub dut: f64,
    pub enclosure: f64,
}

#[derive(Debug)]
pub struct SensorReader<P> {
    probe: P,
    policy: RetryPolicy,
}

impl<P: ThermalProbe> SensorReader<P> {
    pub fn new(probe: P, policy: RetryPolicy) -> Self {
        Self { probe, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn probe_mut(&mut self) -> &mut P {
        &mut self.probe
    }

    /// Poll both temperature channels until each has reported once.
    ///
    /// A channel keeps the last value it delivered while the other one is
    /// retried. Fails only when neither channel reported within the budget;
    /// a single silent channel is returned as NaN with a warning.
    pub async fn poll_temperatures(
        &mut self,
        warnings: &mut Vec<SensorWarning>,
    ) -> Result<Temperatures, SensorError> {
        let budget = self.policy.budget.max(1);
        let mut dut = None;
        let mut enclosure = None;

        for attempt in 1..=budget {
            let reading = self.probe.read_temperatures().await;
            dut = reading.dut.or(dut);
            enclosure = reading.enclosure.or(enclosure);
            if dut.is_some() && enclosure.is_some() {
                if attempt > 1 {
                    tracing::debug!("Temperatures complete after {} attempts", attempt);
                }
                break;
            }
            if attempt < budget {
                tokio::time::sleep(self.policy.interval).await;
            }
        }

        if dut.is_none() && enclosure.is_none() {
            return Err(SensorError::Fault { attempts: budget });
        }
        for (channel, value) in [("dut", dut), ("enclosure", enclosure)] {
            if value.is_none() {
                warnings.push(SensorWarning::TemperatureChannelMissing {
                    channel,
                    attempts: budget,
                });
            }
        }

        Ok(Temperatures {
            dut: dut.unwrap_or(f64::NAN),
            enclosure: enclosure.unwrap_or(f64::NAN),
        })
    }

    /// Acquire one sample: temperatures, humidity and valve telemetry.
    pub async fn read_sample<C: DeviceChannel>(
        &mut self,
        valve: &mut FlowController<C>,
        capacity: f64,
    ) -> Result<Acquisition, SensorError> {
        let mut warnings = Vec::new();
        let temperatures = self.poll_temperatures(&mut warnings).await?;

        let humidity_dut = match self.probe.read_humidity().await {
            Ok(rh) if rh.is_finite() => Some(rh),
            Ok(rh) => {
                warnings.push(SensorWarning::HumidityUnavailable(format!("invalid value {}", rh)));
                None
            }
            Err(e) => {
                warnings.push(SensorWarning::HumidityUnavailable(e.to_string()));
                None
            }
        };

        let valve_position = valve.valve_position().await?;
        let flow_rate = valve.measure().await? * capacity;
        let flow_counter = valve.counter_value().await?;

        Ok(Acquisition {
            sample: Sample {
                timestamp: chrono::Utc::now().timestamp(),
                temperature_box: temperatures.enclosure,
                temperature_dut: temperatures.dut,
                humidity_dut,
                valve_position,
                flow_rate,
                flow_counter,
            },
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{HardwareError, TemperatureReading};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct ScriptedProbe {
        readings: VecDeque<TemperatureReading>,
        polls: u32,
    }

    impl ScriptedProbe {
        fn new(readings: Vec<TemperatureReading>) -> Self {
            Self {
                readings: readings.into(),
                polls: 0,
            }
        }
    }

    #[async_trait]
    impl ThermalProbe for ScriptedProbe {
        async fn read_temperatures(&mut self) -> TemperatureReading {
            self.polls += 1;
            self.readings.pop_front().unwrap_or_default()
        }

        async fn read_humidity(&mut self) -> Result<f64, HardwareError> {
            Err(HardwareError::Unavailable {
                channel: "humidity".to_string(),
                reason: "scripted".to_string(),
            })
        }
    }

    fn reading(dut: Option<f64>, enclosure: Option<f64>) -> TemperatureReading {
        TemperatureReading { dut, enclosure }
    }

    fn policy(budget: u32) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(100),
            budget,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_channels_merge_across_attempts() {
        let probe = ScriptedProbe::new(vec![
            reading(Some(-20.0), None),
            reading(None, None),
            reading(None, Some(-40.0)),
        ]);
        let mut reader = SensorReader::new(probe, policy(50));
        let mut warnings = Vec::new();
        let t = reader.poll_temperatures(&mut warnings).await.unwrap();
        assert_eq!(t, Temperatures { dut: -20.0, enclosure: -40.0 });
        assert!(warnings.is_empty());
        assert_eq!(reader.probe_mut().polls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_channels_missing_is_fault() {
        let mut reader = SensorReader::new(ScriptedProbe::new(vec![]), policy(5));
        let mut warnings = Vec::new();
        let start = tokio::time::Instant::now();
        let err = reader.poll_temperatures(&mut warnings).await.unwrap_err();
        assert!(matches!(err, SensorError::Fault { attempts: 5 }));
        assert_eq!(reader.probe_mut().polls, 5);
        // Four backoffs between five attempts
        assert_eq!(start.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_channel_missing_is_nan_with_warning() {
        let probe = ScriptedProbe::new(vec![reading(Some(-19.5), None)]);
        let mut reader = SensorReader::new(probe, policy(3));
        let mut warnings = Vec::new();
        let t = reader.poll_temperatures(&mut warnings).await.unwrap();
        assert_eq!(t.dut, -19.5);
        assert!(t.enclosure.is_nan());
        assert_eq!(
            warnings,
            vec![SensorWarning::TemperatureChannelMissing {
                channel: "enclosure",
                attempts: 3
            }]
        );
    }
}
