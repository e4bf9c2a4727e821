// src/storage/text_log.rs - Plain-text operator log, one timestamped line per event
use std::fmt::Display;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, TimeZone};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::StorageError;

/// ctime(3) layout, e.g. `Mon Aug 10 14:03:05 2020`.
pub const CTIME_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

pub fn format_line<Tz: TimeZone>(time: &DateTime<Tz>, message: &str) -> String
where
    Tz::Offset: Display,
{
    format!("{} {}\n", time.format(CTIME_FORMAT), message)
}

#[derive(Debug)]
pub struct TextLog {
    file: File,
    path: PathBuf,
}

impl TextLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self { file, path })
    }

    pub async fn write_line(&mut self, message: &str) -> Result<(), StorageError> {
        let line = format_line(&Local::now(), message);
        self.file.write_all(line.as_bytes()).await?;
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_ctime_format() {
        let time = Utc.with_ymd_and_hms(2020, 8, 3, 14, 3, 5).unwrap();
        assert_eq!(
            format_line(&time, "valve 0x800000,0x1f40"),
            "Mon Aug  3 14:03:05 2020 valve 0x800000,0x1f40\n"
        );
    }

    #[tokio::test]
    async fn test_lines_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temperature.log");
        let mut log = TextLog::open(&path).await.unwrap();
        log.write_line("first").await.unwrap();
        drop(log);
        let mut log = TextLog::open(&path).await.unwrap();
        log.write_line("second").await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" first"));
        assert!(lines[1].ends_with(" second"));
    }
}
