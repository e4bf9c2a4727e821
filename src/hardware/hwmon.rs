// src/hardware/hwmon.rs - Thermal probe backed by Linux hwmon attributes
//
// Sensor chips bound to a kernel driver (sht3x, sht4x, jc42 for MCP9808)
// expose `temp*_input` in millidegrees Celsius and `humidity*_input` in
// milli-percent. A read error or an unparsable value marks the channel as
// unavailable for this poll.
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{HardwareError, TemperatureReading, ThermalProbe};
use crate::config::SensorConfig;

#[derive(Debug, Clone)]
pub struct HwmonProbe {
    dut_temperature: PathBuf,
    enclosure_temperature: PathBuf,
    dut_humidity: Option<PathBuf>,
}

impl HwmonProbe {
    pub fn new(config: &SensorConfig) -> Self {
        Self {
            dut_temperature: PathBuf::from(&config.dut_temperature),
            enclosure_temperature: PathBuf::from(&config.enclosure_temperature),
            dut_humidity: config.dut_humidity.as_ref().map(PathBuf::from),
        }
    }

    async fn read_milli(path: &Path) -> Result<f64, HardwareError> {
        let raw = tokio::fs::read_to_string(path).await?;
        raw.trim()
            .parse::<i64>()
            .map(|milli| milli as f64 / 1000.0)
            .map_err(|e| HardwareError::Unavailable {
                channel: path.display().to_string(),
                reason: format!("invalid reading {:?}: {}", raw.trim(), e),
            })
    }

    async fn read_channel(path: &Path) -> Option<f64> {
        match Self::read_milli(path).await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!("Temperature channel {} not ready: {}", path.display(), e);
                None
            }
        }
    }
}

#[async_trait]
impl ThermalProbe for HwmonProbe {
    async fn read_temperatures(&mut self) -> TemperatureReading {
        TemperatureReading {
            dut: Self::read_channel(&self.dut_temperature).await,
            enclosure: Self::read_channel(&self.enclosure_temperature).await,
        }
    }

    async fn read_humidity(&mut self) -> Result<f64, HardwareError> {
        match &self.dut_humidity {
            Some(path) => Self::read_milli(path).await,
            None => Err(HardwareError::Unavailable {
                channel: "humidity".to_string(),
                reason: "no humidity sensor configured".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn probe_in(dir: &Path, humidity: bool) -> HwmonProbe {
        HwmonProbe::new(&SensorConfig {
            dut_temperature: dir.join("temp1_input").display().to_string(),
            enclosure_temperature: dir.join("temp2_input").display().to_string(),
            dut_humidity: humidity.then(|| dir.join("humidity1_input").display().to_string()),
        })
    }

    #[tokio::test]
    async fn test_reads_millidegrees() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("temp1_input"), "-20312\n").unwrap();
        std::fs::write(dir.path().join("temp2_input"), "-45000\n").unwrap();
        std::fs::write(dir.path().join("humidity1_input"), "12500\n").unwrap();
        let mut probe = probe_in(dir.path(), true);

        let reading = probe.read_temperatures().await;
        assert_eq!(reading.dut, Some(-20.312));
        assert_eq!(reading.enclosure, Some(-45.0));
        assert_eq!(probe.read_humidity().await.unwrap(), 12.5);
    }

    #[tokio::test]
    async fn test_missing_channel_is_none() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("temp1_input"), "1000").unwrap();
        let mut probe = probe_in(dir.path(), false);

        let reading = probe.read_temperatures().await;
        assert_eq!(reading.dut, Some(1.0));
        assert_eq!(reading.enclosure, None);
        assert!(!reading.is_complete());
        assert!(probe.read_humidity().await.is_err());
    }
}
