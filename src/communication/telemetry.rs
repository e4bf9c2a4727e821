// src/communication/telemetry.rs - Best-effort sample fan-out to external viewers
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::sample::Sample;

/// One telemetry message: a 2x2 float64 array plus metadata.
///
/// Row 0 holds the DUT and enclosure temperatures, row 1 the DUT humidity
/// and an unused slot. Missing values are `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub data: [[Option<f64>; 2]; 2],
    pub meta: TelemetryMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMeta {
    pub name: String,
    pub dtype: String,
    pub shape: [usize; 2],
    pub timestamp: f64,
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

impl TelemetryMessage {
    pub fn from_sample(name: &str, sample: &Sample) -> Self {
        Self {
            data: [
                [finite(sample.temperature_dut), finite(sample.temperature_box)],
                [sample.humidity_dut.and_then(finite), None],
            ],
            meta: TelemetryMeta {
                name: name.to_string(),
                dtype: "float64".to_string(),
                shape: [2, 2],
                timestamp: sample.timestamp as f64,
            },
        }
    }
}

/// Publishes one JSON line per sample on a bounded broadcast channel.
///
/// Publishing never blocks and never fails: without subscribers the message
/// is dropped, and a subscriber that falls behind loses the oldest lines.
#[derive(Debug)]
pub struct TelemetryPublisher {
    name: String,
    sender: broadcast::Sender<Arc<str>>,
    published: u64,
    dropped: u64,
}

impl TelemetryPublisher {
    pub fn new(name: &str, buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self {
            name: name.to_string(),
            sender,
            published: 0,
            dropped: 0,
        }
    }

    pub fn publish(&mut self, sample: &Sample) {
        let message = TelemetryMessage::from_sample(&self.name, sample);
        let line = match serde_json::to_string(&message) {
            Ok(json) => json + "\n",
            Err(e) => {
                tracing::warn!("Failed to encode telemetry: {}", e);
                self.dropped += 1;
                return;
            }
        };

        match self.sender.send(Arc::from(line)) {
            Ok(receivers) => {
                self.published += 1;
                tracing::trace!("Telemetry sent to {} subscribers", receivers);
            }
            Err(_) => self.dropped += 1,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.sender.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<Arc<str>> {
        self.sender.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Messages that reached at least one subscriber.
    pub fn published(&self) -> u64 {
        self.published
    }

    /// Messages nobody received.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Accept `tcp://host:port` or `host:port`; `*` binds all interfaces.
pub fn parse_endpoint(endpoint: &str) -> String {
    let address = endpoint.strip_prefix("tcp://").unwrap_or(endpoint);
    match address.strip_prefix("*:") {
        Some(port) => format!("0.0.0.0:{}", port),
        None => address.to_string(),
    }
}

/// TCP server forwarding every telemetry line to each connected client.
#[derive(Debug)]
pub struct TelemetryServer {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl TelemetryServer {
    pub async fn bind(endpoint: &str, publisher: &TelemetryPublisher) -> std::io::Result<Self> {
        let address = parse_endpoint(endpoint);
        let listener = TcpListener::bind(&address).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Telemetry server listening on {}", local_addr);

        let sender = publisher.sender();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::info!("Telemetry subscriber connected: {}", peer);
                        tokio::spawn(forward(stream, peer, sender.subscribe()));
                    }
                    Err(e) => {
                        tracing::warn!("Telemetry accept failed: {}", e);
                    }
                }
            }
        });

        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for TelemetryServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn forward(mut stream: TcpStream, peer: SocketAddr, mut rx: broadcast::Receiver<Arc<str>>) {
    loop {
        match rx.recv().await {
            Ok(line) => {
                if let Err(e) = stream.write_all(line.as_bytes()).await {
                    tracing::info!("Telemetry subscriber {} disconnected: {}", peer, e);
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Telemetry subscriber {} skipped {} messages", peer, skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
