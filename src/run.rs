//! Shared run domain types: flows, run identifiers, requests and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// The kind of agent run. Closed set: each flow maps to one executor
/// registration and one serialization boundary per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flow {
    Implement,
    Review,
    Research,
    Plan,
}

impl Flow {
    pub const ALL: [Flow; 4] = [Flow::Implement, Flow::Review, Flow::Research, Flow::Plan];

    pub fn as_str(&self) -> &'static str {
        match self {
            Flow::Implement => "implement",
            Flow::Review => "review",
            Flow::Research => "research",
            Flow::Plan => "plan",
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Flow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "implement" => Ok(Flow::Implement),
            "review" => Ok(Flow::Review),
            "research" => Ok(Flow::Research),
            "plan" => Ok(Flow::Plan),
            other => Err(format!(
                "unknown flow {:?} (expected implement, review, research or plan)",
                other
            )),
        }
    }
}

/// Unique identifier for a scheduled run. Stable across retry attempts of
/// the same request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex chars, used in log lines and file names.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A request to run an agent against one card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub run_id: RunId,
    pub card_path: PathBuf,
    pub flow: Flow,
    /// Copied from the card's frontmatter; parallelizable runs never take a
    /// (phase, flow) lock.
    pub parallelizable: bool,
    /// First `phase-*` component of the card path, if any.
    pub phase: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

/// Terminal status of a single worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a worker run produced, reported exactly once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRunResult {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub summary: String,
}

impl WorkerRunResult {
    pub fn succeeded(summary: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Succeeded,
            exit_code: Some(0),
            duration_ms: 0,
            bytes_read: 0,
            bytes_written: 0,
            summary: summary.into(),
        }
    }

    pub fn failed(exit_code: Option<i32>, summary: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            exit_code,
            duration_ms: 0,
            bytes_read: 0,
            bytes_written: 0,
            summary: summary.into(),
        }
    }

    pub fn canceled() -> Self {
        Self {
            status: RunStatus::Canceled,
            exit_code: None,
            duration_ms: 0,
            bytes_read: 0,
            bytes_written: 0,
            summary: "canceled".to_string(),
        }
    }
}
