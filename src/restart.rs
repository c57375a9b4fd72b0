//! Per-transfer restart journal.
//!
//! A jsonl file records each file completed within a bulk transfer so
//! a rerun of the same transfer can skip work already done. The
//! journal lives beside the local side of the transfer and is removed
//! once the whole transfer completes.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{IrodsError, Result};

pub const JOURNAL_FILE_NAME: &str = ".irods_transfer.jsonl";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RestartLogEntry {
    pub timestamp: String,
    pub operation: String,
    /// Path on the side being read
    pub source: String,
    /// Path on the side being written
    pub destination: String,
    pub status: RestartStatus,
    pub bytes: u64,
}

/// Append-only journal of per-file outcomes for one bulk transfer
pub struct RestartLog {
    path: PathBuf,
}

impl RestartLog {
    /// Journal location for a transfer rooted at the given local
    /// directory (the source of a put, the destination of a get)
    pub fn for_local_root(local_root: &Path) -> RestartLog {
        let dir = if local_root.is_dir() {
            local_root.to_path_buf()
        } else {
            local_root
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        };
        RestartLog {
            path: dir.join(JOURNAL_FILE_NAME),
        }
    }

    pub fn record(&self, operation: &str, source: &str, destination: &str, status: RestartStatus, bytes: u64) -> Result<()> {
        let entry = RestartLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            operation: operation.to_string(),
            source: source.to_string(),
            destination: destination.to_string(),
            status,
            bytes,
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &entry)
            .map_err(|e| IrodsError::Internal(format!("journal encode: {}", e)))?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_entries(&self) -> Result<Vec<RestartLogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            // A torn final line from an interrupted run is not fatal
            match serde_json::from_str::<RestartLogEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(_) => continue,
            }
        }
        Ok(entries)
    }

    /// Sources recorded Completed, with the byte count each finished at
    pub fn completed(&self) -> Result<HashMap<String, u64>> {
        let mut done = HashMap::new();
        for entry in self.read_entries()? {
            match entry.status {
                RestartStatus::Completed => {
                    done.insert(entry.source, entry.bytes);
                }
                // A later failure for the same source voids the skip
                RestartStatus::Failed | RestartStatus::InProgress => {
                    done.remove(&entry.source);
                }
            }
        }
        Ok(done)
    }

    /// Remove the journal after a clean overall completion
    pub fn clear(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
