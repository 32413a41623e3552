//! Run lifecycle bookkeeping: card status fields, history entries, and
//! crash-recoverable lock records.
//!
//! Every scheduler transition is mirrored into two places. The card's own
//! frontmatter (`agent_flow`, `agent_status`) plus a History line, written
//! through the conflict-checked store, and a small JSON lock record under
//! the runtime locks directory that survives a crash and lets the next
//! startup tell a live run from a stale one.

use crate::card::{CardSnapshot, CardStore};
use crate::errors::CardError;
use crate::run::{Flow, RunId, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// On-disk evidence that a card has a queued or running agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub card_path: PathBuf,
    pub run_id: RunId,
    pub flow: Flow,
    pub locked_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.locked_at
    }
}

/// Writes card-side and lock-side state for every run transition.
#[derive(Debug, Clone)]
pub struct RunLifecycleCoordinator {
    store: CardStore,
    locks_dir: PathBuf,
}

impl RunLifecycleCoordinator {
    pub fn new(store: CardStore, locks_dir: PathBuf) -> Self {
        Self { store, locks_dir }
    }

    pub fn locks_dir(&self) -> &Path {
        &self.locks_dir
    }

    /// Card admitted to the queue. Writes the lock record first so a crash
    /// between the two writes leaves evidence, not a silent orphan. If the
    /// card write itself fails the run never starts, so the record is taken
    /// back out rather than left to block the card until it goes stale.
    pub fn mark_queued(
        &self,
        card_path: &Path,
        run_id: RunId,
        flow: Flow,
    ) -> Result<(), CardError> {
        self.write_record(&LockRecord {
            card_path: card_path.to_path_buf(),
            run_id,
            flow,
            locked_at: Utc::now(),
        })?;
        if let Err(err) = self.update_card(card_path, flow, "queued", format!("{flow} run queued")) {
            if let Err(cleanup) = self.remove_record(card_path) {
                tracing::warn!(card = %card_path.display(), %cleanup, "orphan lock record left behind");
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn mark_running(
        &self,
        card_path: &Path,
        flow: Flow,
        attempt: u32,
    ) -> Result<(), CardError> {
        let entry = if attempt > 1 {
            format!("{flow} run started (attempt {attempt})")
        } else {
            format!("{flow} run started")
        };
        self.update_card(card_path, flow, "running", entry)
    }

    pub fn mark_retrying(
        &self,
        card_path: &Path,
        flow: Flow,
        attempt: u32,
        delay_ms: u64,
    ) -> Result<(), CardError> {
        self.update_card(
            card_path,
            flow,
            "queued",
            format!("{flow} run retry {attempt} scheduled in {delay_ms}ms"),
        )
    }

    /// Terminal transition. Removes the lock record; the card keeps the
    /// final status and history even on failure.
    pub fn mark_finished(
        &self,
        card_path: &Path,
        flow: Flow,
        status: RunStatus,
        summary: &str,
    ) -> Result<(), CardError> {
        let entry = if summary.is_empty() {
            format!("{flow} run {status}")
        } else {
            format!("{flow} run {status}: {summary}")
        };
        self.update_card(card_path, flow, status.as_str(), entry)?;
        self.remove_record(card_path)
    }

    /// All lock records currently on disk. Undecodable files are skipped
    /// with a warning; they are removed by `remove_record` on recovery.
    pub fn load_lock_records(&self) -> Result<Vec<LockRecord>, CardError> {
        let mut records = Vec::new();
        let entries = match fs::read_dir(&self.locks_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(source) => {
                return Err(CardError::Read {
                    path: self.locks_dir.clone(),
                    source,
                })
            }
        };
        for entry in entries {
            let entry = entry.map_err(|source| CardError::Read {
                path: self.locks_dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = fs::read_to_string(&path).map_err(|source| CardError::Read {
                path: path.clone(),
                source,
            })?;
            match serde_json::from_str::<LockRecord>(&text) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "skipping undecodable lock record");
                }
            }
        }
        Ok(records)
    }

    pub fn remove_record(&self, card_path: &Path) -> Result<(), CardError> {
        let path = self.record_path(card_path);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CardError::Write { path, source }),
        }
    }

    pub fn record_for(&self, card_path: &Path) -> Option<LockRecord> {
        let text = fs::read_to_string(self.record_path(card_path)).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn write_record(&self, record: &LockRecord) -> Result<(), CardError> {
        fs::create_dir_all(&self.locks_dir).map_err(|source| CardError::Write {
            path: self.locks_dir.clone(),
            source,
        })?;
        let path = self.record_path(&record.card_path);
        let json = serde_json::to_string_pretty(record)
            .map_err(std::io::Error::other)
            .and_then(|json| fs::write(&path, json));
        json.map_err(|source| CardError::Write { path, source })
    }

    fn record_path(&self, card_path: &Path) -> PathBuf {
        let digest = Sha256::digest(card_path.display().to_string().as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        self.locks_dir.join(format!("{}.json", &hex[..16]))
    }

    /// Frontmatter plus history update through the conflict-checked store.
    /// A lost race against an editor is retried against a fresh snapshot a
    /// few times before giving up.
    fn update_card(
        &self,
        card_path: &Path,
        flow: Flow,
        status: &str,
        history: String,
    ) -> Result<(), CardError> {
        const MAX_TRIES: u32 = 3;
        let mut last_err = None;
        for _ in 0..MAX_TRIES {
            let snapshot = self.store.load_snapshot(card_path)?;
            match self.apply_update(&snapshot, flow, status, &history) {
                Ok(()) => return Ok(()),
                Err(err @ CardError::Conflict { .. }) => {
                    tracing::debug!(card = %card_path.display(), "lifecycle write raced, retrying");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or(CardError::Conflict {
            path: card_path.to_path_buf(),
        }))
    }

    fn apply_update(
        &self,
        snapshot: &CardSnapshot,
        flow: Flow,
        status: &str,
        history: &str,
    ) -> Result<(), CardError> {
        let mut document = snapshot.document.clone();
        document.set_field("agent_flow", flow.as_str());
        document.set_field("agent_status", status);
        document.append_history(std::slice::from_ref(&history.to_string()));
        self.store.save_raw(&document.render(), snapshot)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = "---\nowner: alice\n---\n\n# 1.1 Wire the store\n\nSummary:\ntext\n";

    fn setup(dir: &Path) -> (RunLifecycleCoordinator, PathBuf) {
        let board = dir.join("board").join("phase-1-a").join("backlog");
        fs::create_dir_all(&board).unwrap();
        let card = board.join("1.1-wire-the-store.md");
        fs::write(&card, SAMPLE).unwrap();
        let coordinator = RunLifecycleCoordinator::new(CardStore::new(), dir.join("locks"));
        (coordinator, card)
    }

    #[test]
    fn queued_writes_record_and_card_state() {
        let dir = tempdir().unwrap();
        let (coordinator, card) = setup(dir.path());
        let run_id = RunId::new();

        coordinator.mark_queued(&card, run_id, Flow::Implement).unwrap();

        let record = coordinator.record_for(&card).unwrap();
        assert_eq!(record.run_id, run_id);
        assert_eq!(record.flow, Flow::Implement);

        let text = fs::read_to_string(&card).unwrap();
        assert!(text.contains("agent_flow: implement"));
        assert!(text.contains("agent_status: queued"));
        assert!(text.contains("implement run queued"));
    }

    #[test]
    fn finished_removes_record_but_keeps_card_history() {
        let dir = tempdir().unwrap();
        let (coordinator, card) = setup(dir.path());
        let run_id = RunId::new();

        coordinator.mark_queued(&card, run_id, Flow::Review).unwrap();
        coordinator.mark_running(&card, Flow::Review, 1).unwrap();
        coordinator
            .mark_finished(&card, Flow::Review, RunStatus::Failed, "tests failed")
            .unwrap();

        assert!(coordinator.record_for(&card).is_none());
        let text = fs::read_to_string(&card).unwrap();
        assert!(text.contains("agent_status: failed"));
        assert!(text.contains("review run started"));
        assert!(text.contains("review run failed: tests failed"));
    }

    #[test]
    fn failed_queue_transition_leaves_no_lock_record() {
        let dir = tempdir().unwrap();
        let (coordinator, card) = setup(dir.path());

        // Frontmatter never closes, so the card write path fails outright.
        fs::write(&card, "---\nowner: alice\n\n# 1.1 Wire the store\n").unwrap();
        let result = coordinator.mark_queued(&card, RunId::new(), Flow::Implement);

        assert!(result.is_err());
        assert!(coordinator.record_for(&card).is_none());
        assert!(coordinator.load_lock_records().unwrap().is_empty());
    }

    #[test]
    fn retry_transition_records_attempt_and_delay() {
        let dir = tempdir().unwrap();
        let (coordinator, card) = setup(dir.path());

        coordinator
            .mark_retrying(&card, Flow::Implement, 2, 4000)
            .unwrap();
        let text = fs::read_to_string(&card).unwrap();
        assert!(text.contains("agent_status: queued"));
        assert!(text.contains("implement run retry 2 scheduled in 4000ms"));
    }

    #[test]
    fn load_lock_records_round_trips() {
        let dir = tempdir().unwrap();
        let (coordinator, card) = setup(dir.path());
        coordinator.mark_queued(&card, RunId::new(), Flow::Plan).unwrap();

        let records = coordinator.load_lock_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].card_path, card);

        coordinator.remove_record(&card).unwrap();
        assert!(coordinator.load_lock_records().unwrap().is_empty());
    }

    #[test]
    fn load_from_missing_dir_is_empty() {
        let dir = tempdir().unwrap();
        let coordinator =
            RunLifecycleCoordinator::new(CardStore::new(), dir.path().join("never-created"));
        assert!(coordinator.load_lock_records().unwrap().is_empty());
    }

    #[test]
    fn lifecycle_write_survives_external_edit_race() {
        let dir = tempdir().unwrap();
        let (coordinator, card) = setup(dir.path());

        // External edit between transitions is picked up on reload.
        coordinator.mark_queued(&card, RunId::new(), Flow::Implement).unwrap();
        let edited = fs::read_to_string(&card).unwrap().replace("text", "edited");
        fs::write(&card, edited).unwrap();
        coordinator.mark_running(&card, Flow::Implement, 1).unwrap();

        let text = fs::read_to_string(&card).unwrap();
        assert!(text.contains("edited"));
        assert!(text.contains("agent_status: running"));
    }

    #[test]
    fn remove_record_is_idempotent() {
        let dir = tempdir().unwrap();
        let (coordinator, card) = setup(dir.path());
        coordinator.remove_record(&card).unwrap();
        coordinator.remove_record(&card).unwrap();
    }
}
