//! Append-only JSON-lines worker log.
//!
//! Every run writes one log file. Each line is a self-contained JSON
//! object with a `timestamp` and an `event` discriminator, so the file can
//! be tailed live or replayed after the run.

use crate::errors::CardError;
use crate::run::WorkerRunResult;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// One decoded log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerLogEntry {
    WorkerReady {
        timestamp: String,
    },
    Progress {
        timestamp: String,
        percent: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Log {
        timestamp: String,
        message: String,
    },
    WorkerFinished {
        timestamp: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        duration_ms: u64,
        bytes_read: u64,
        bytes_written: u64,
        summary: String,
    },
}

/// Appending writer for one run's log. Tracks bytes written so the final
/// result can report them.
#[derive(Debug)]
pub struct WorkerLog {
    path: PathBuf,
    file: File,
    bytes_written: u64,
}

impl WorkerLog {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            bytes_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn worker_ready(&mut self) {
        self.append(json!({ "event": "workerReady" }));
    }

    pub fn progress(&mut self, percent: u8, message: Option<&str>) {
        let mut value = json!({ "event": "progress", "percent": percent.min(100) });
        if let Some(message) = message {
            value["message"] = json!(message);
        }
        self.append(value);
    }

    pub fn log(&mut self, message: &str) {
        self.append(json!({ "event": "log", "message": message }));
    }

    pub fn worker_finished(&mut self, result: &WorkerRunResult) {
        self.append(json!({
            "event": "workerFinished",
            "status": result.status.as_str(),
            "exitCode": result.exit_code,
            "durationMs": result.duration_ms,
            "bytesRead": result.bytes_read,
            "bytesWritten": result.bytes_written,
            "summary": result.summary,
        }));
    }

    fn append(&mut self, mut value: serde_json::Value) {
        value["timestamp"] = json!(Utc::now().to_rfc3339());
        let mut line = value.to_string();
        line.push('\n');
        // A log write failure must not take the run down with it.
        if let Err(err) = self.file.write_all(line.as_bytes()) {
            tracing::warn!(path = %self.path.display(), %err, "worker log write failed");
            return;
        }
        self.bytes_written += line.len() as u64;
    }
}

/// Decode a worker log back into entries. Lines that fail to decode are
/// skipped; a partially written trailing line is normal after a crash.
pub fn replay(path: &Path) -> Result<Vec<WorkerLogEntry>, CardError> {
    let file = File::open(path).map_err(|source| CardError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| CardError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WorkerLogEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                tracing::debug!(path = %path.display(), %err, "skipping undecodable log line");
            }
        }
    }
    Ok(entries)
}
