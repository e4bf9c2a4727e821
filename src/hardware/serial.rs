// src/hardware/serial.rs - Serial line to the flow controller
use async_trait::async_trait;
use serial2_tokio::SerialPort;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{DeviceChannel, HardwareError};

/// Exclusively owned serial port speaking to one device.
///
/// The port is opened 8N1 at the given baud rate. It is not shared: the
/// flow controller that owns this channel is the only reader and writer.
pub struct SerialChannel {
    port: SerialPort,
    path: String,
    baud: u32,
}

impl SerialChannel {
    pub fn open(path: &str, baud: u32) -> Result<Self, HardwareError> {
        tracing::info!("Opening valve serial port {} at {} baud", path, baud);
        let port = SerialPort::open(path, baud)?;
        Ok(Self {
            port,
            path: path.to_string(),
            baud,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn available_ports() -> Vec<String> {
        match SerialPort::available_ports() {
            Ok(paths) => paths.iter().map(|p| p.display().to_string()).collect(),
            Err(_) => vec![],
        }
    }
}

#[async_trait]
impl DeviceChannel for SerialChannel {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), HardwareError> {
        AsyncWriteExt::write_all(&mut self.port, buf).await?;
        AsyncWriteExt::flush(&mut self.port).await?;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, HardwareError> {
        let n = AsyncReadExt::read(&mut self.port, buf).await?;
        Ok(n)
    }

    async fn discard_input(&mut self) -> Result<(), HardwareError> {
        self.port.discard_input_buffer()?;
        Ok(())
    }
}

impl std::fmt::Debug for SerialChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialChannel")
            .field("path", &self.path)
            .field("baud", &self.baud)
            .finish()
    }
}
