// src/storage/mod.rs - Durable sample sink: compressed table plus text log
pub mod table;
pub mod text_log;

pub use table::{read_table, scan_frames, TableWriter, MAGIC};
pub use text_log::{format_line, TextLog};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::control::{ControlMode, ValveCommand};
use crate::sample::Sample;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{path} is not a sample table")]
    BadMagic { path: PathBuf },
    #[error("Corrupt frame at offset {offset}: {reason}")]
    Corrupt { offset: usize, reason: String },
}

/// One persisted tick: the sample, the active mode and the command issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub sample: Sample,
    pub mode: ControlMode,
    pub command: Option<ValveCommand>,
}

impl LogRecord {
    pub fn new(sample: Sample, mode: ControlMode, command: Option<ValveCommand>) -> Self {
        Self {
            sample,
            mode,
            command,
        }
    }

    /// Human-readable line for the text log.
    pub fn summary(&self) -> String {
        let s = &self.sample;
        let humidity = match (s.humidity_dut, s.dew_point()) {
            (Some(rh), Some(dp)) => format!("{:.2} RH dp {:.2}C", rh, dp),
            (Some(rh), None) => format!("{:.2} RH", rh),
            (None, _) => "Humidity read error".to_string(),
        };
        format!(
            "{:.2}C {} box {:.2}C valve {:.2}% flow {:.3}",
            s.temperature_dut, humidity, s.temperature_box, s.valve_position, s.flow_rate
        )
    }
}

/// Append-only sink for every tick, created or reused at startup.
#[derive(Debug)]
pub struct SampleStore {
    table: TableWriter,
    text: TextLog,
    run_id: Uuid,
    records_written: u64,
}

impl SampleStore {
    pub async fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        let table = TableWriter::open(&config.table).await?;
        let text = TextLog::open(&config.text_log).await?;
        let run_id = Uuid::new_v4();

        let mut store = Self {
            table,
            text,
            run_id,
            records_written: 0,
        };
        let existing = store.table.records();
        store
            .note(&format!(
                "run {} started, table {} holds {} records",
                run_id,
                store.table.path().display(),
                existing
            ))
            .await?;
        Ok(store)
    }

    pub async fn append(&mut self, record: &LogRecord) -> Result<(), StorageError> {
        self.table.append(record).await?;
        self.text.write_line(&record.summary()).await?;
        self.records_written += 1;
        Ok(())
    }

    /// Record an event (mode change, valve transition, fault) in the text log.
    pub async fn note(&mut self, message: &str) -> Result<(), StorageError> {
        self.text.write_line(message).await
    }

    /// Records appended by this process.
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Records in the table, including earlier runs.
    pub fn table_records(&self) -> u64 {
        self.table.records()
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}
