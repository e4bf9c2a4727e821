// src/storage/table.rs - Append-only compressed record table
//
// Layout: 8-byte magic, then frames of `u32 LE length` followed by an LZ4
// block (uncompressed size prepended) holding one JSON-encoded record.
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::{LogRecord, StorageError};

pub const MAGIC: &[u8; 8] = b"N2TABLE\x01";
const FRAME_HEADER: usize = 4;

/// Result of walking the frames that follow the magic.
#[derive(Debug)]
pub struct FrameScan {
    pub records: Vec<LogRecord>,
    /// File length up to the end of the last intact frame.
    pub valid_len: usize,
    /// Bytes of a torn trailing frame.
    pub torn_bytes: usize,
}

fn decode_frame(block: &[u8], offset: usize) -> Result<LogRecord, StorageError> {
    let json = lz4_flex::decompress_size_prepended(block).map_err(|e| StorageError::Corrupt {
        offset,
        reason: e.to_string(),
    })?;
    serde_json::from_slice(&json).map_err(|e| StorageError::Corrupt {
        offset,
        reason: e.to_string(),
    })
}

/// Walk the frames of `body`, the file contents after the magic.
///
/// An incomplete frame at the end, or a final frame that does not decode, is
/// a torn tail left by an interrupted append. A frame that fails to decode
/// with intact frames after it is corruption.
pub fn scan_frames(body: &[u8]) -> Result<FrameScan, StorageError> {
    let mut records = Vec::new();
    let mut pos = 0;

    while pos < body.len() {
        let offset = MAGIC.len() + pos;
        let Some(header) = body.get(pos..pos + FRAME_HEADER) else {
            break;
        };
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let start = pos + FRAME_HEADER;
        let Some(block) = body.get(start..start + len) else {
            break;
        };
        let end = start + len;

        match decode_frame(block, offset) {
            Ok(record) => records.push(record),
            Err(_) if end == body.len() => break,
            Err(e) => return Err(e),
        }
        pos = end;
    }

    Ok(FrameScan {
        records,
        valid_len: MAGIC.len() + pos,
        torn_bytes: body.len() - pos,
    })
}

fn check_magic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    if bytes.starts_with(MAGIC) {
        Ok(())
    } else {
        Err(StorageError::BadMagic {
            path: path.to_path_buf(),
        })
    }
}

/// Read every intact record of a table file.
pub async fn read_table(path: impl AsRef<Path>) -> Result<Vec<LogRecord>, StorageError> {
    let path = path.as_ref();
    let bytes = tokio::fs::read(path).await?;
    check_magic(path, &bytes)?;
    Ok(scan_frames(&bytes[MAGIC.len()..])?.records)
}

#[derive(Debug)]
pub struct TableWriter {
    file: File,
    path: PathBuf,
    records: u64,
}

impl TableWriter {
    /// Create the table, or reopen it for append after dropping a torn tail.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        let bytes = tokio::fs::read(&path).await?;

        // Empty, or only part of the magic made it to disk
        let records = if bytes.len() < MAGIC.len() && MAGIC.starts_with(&bytes) {
            file.set_len(0).await?;
            file.seek(SeekFrom::Start(0)).await?;
            file.write_all(MAGIC).await?;
            file.sync_data().await?;
            tracing::info!("Created table {}", path.display());
            0
        } else {
            check_magic(&path, &bytes)?;
            let scan = scan_frames(&bytes[MAGIC.len()..])?;
            if scan.torn_bytes > 0 {
                tracing::warn!(
                    "Table {}: dropping {} bytes of a torn trailing frame",
                    path.display(),
                    scan.torn_bytes
                );
                file.set_len(scan.valid_len as u64).await?;
                file.sync_data().await?;
            }
            file.seek(SeekFrom::Start(scan.valid_len as u64)).await?;
            tracing::info!(
                "Reopened table {} with {} records",
                path.display(),
                scan.records.len()
            );
            scan.records.len() as u64
        };

        Ok(Self {
            file,
            path,
            records,
        })
    }

    /// Append one record and sync it to disk.
    pub async fn append(&mut self, record: &LogRecord) -> Result<(), StorageError> {
        let json = serde_json::to_vec(record)?;
        let block = lz4_flex::compress_prepend_size(&json);

        let mut frame = Vec::with_capacity(FRAME_HEADER + block.len());
        frame.extend_from_slice(&(block.len() as u32).to_le_bytes());
        frame.extend_from_slice(&block);

        self.file.write_all(&frame).await?;
        self.file.flush().await?;
        self.file.sync_data().await?;
        self.records += 1;
        Ok(())
    }

    /// Records in the table, including those from earlier runs.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
