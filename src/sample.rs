// src/sample.rs - One acquired sample per control tick
use serde::{Deserialize, Serialize};

/// Everything measured during one tick. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    /// °C, NaN when the channel stayed unavailable.
    #[serde(with = "crate::sample::nan_as_null")]
    pub temperature_box: f64,
    /// °C, NaN when the channel stayed unavailable.
    #[serde(with = "crate::sample::nan_as_null")]
    pub temperature_dut: f64,
    /// Relative humidity in %, `None` after a humidity read fault.
    pub humidity_dut: Option<f64>,
    /// Valve opening in % of full scale.
    #[serde(with = "crate::sample::nan_as_null")]
    pub valve_position: f64,
    /// Flow in the units of the controller capacity.
    #[serde(with = "crate::sample::nan_as_null")]
    pub flow_rate: f64,
    /// Cumulative flow in the units of the controller capacity.
    #[serde(with = "crate::sample::nan_as_null")]
    pub flow_counter: f64,
}

impl Sample {
    /// Dew point next to the DUT (Magnus formula), when humidity is known.
    pub fn dew_point(&self) -> Option<f64> {
        const A: f64 = 17.62;
        const B: f64 = 243.12;
        let rh = self.humidity_dut?;
        let t = self.temperature_dut;
        if !(rh > 0.0) || !t.is_finite() {
            return None;
        }
        let gamma = (rh / 100.0).ln() + A * t / (B + t);
        Some(B * gamma / (A - gamma))
    }
}

/// Serde adapter writing non-finite floats as `null` and reading `null` back as NaN.
pub(crate) mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}
