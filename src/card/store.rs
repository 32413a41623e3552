//! Loading and saving card documents with optimistic concurrency.
//!
//! All writes funnel through one path: re-parse the candidate content (a
//! write is never attempted with content that fails to parse), compare the
//! current on-disk bytes against the snapshot baseline, then write to a
//! temp file and rename into place.
//!
//! The conflict check is advisory, not a filesystem lock: it detects
//! concurrent external edits, it does not prevent them.

use crate::card::document::{CardDocument, CardDraft};
use crate::errors::CardError;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A card plus the raw bytes and mtime it was loaded from. The baseline for
/// conflict detection; consumed by a successful save.
#[derive(Debug, Clone)]
pub struct CardSnapshot {
    pub document: CardDocument,
    pub baseline: String,
    pub modified: SystemTime,
}

/// Parses and persists card files.
#[derive(Debug, Clone, Default)]
pub struct CardStore;

impl CardStore {
    pub fn new() -> Self {
        Self
    }

    /// Read and parse a card, capturing the conflict-detection baseline.
    pub fn load_snapshot(&self, path: &Path) -> Result<CardSnapshot, CardError> {
        let baseline = fs::read_to_string(path).map_err(|source| CardError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|source| CardError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let document = CardDocument::parse(path, &baseline)?;
        Ok(CardSnapshot {
            document,
            baseline,
            modified,
        })
    }

    /// Apply a form draft plus history entries and save. Returns the fresh
    /// snapshot to use for subsequent edits.
    pub fn save_form_draft(
        &self,
        draft: &CardDraft,
        append_history: &[String],
        snapshot: &CardSnapshot,
    ) -> Result<CardSnapshot, CardError> {
        let mut document = snapshot.document.clone();
        document.apply_draft(draft, append_history);
        self.write_validated(document.render(), snapshot)
    }

    /// Save raw text as-is (after validation).
    pub fn save_raw(&self, text: &str, snapshot: &CardSnapshot) -> Result<CardSnapshot, CardError> {
        self.write_validated(text.to_string(), snapshot)
    }

    fn write_validated(
        &self,
        candidate: String,
        snapshot: &CardSnapshot,
    ) -> Result<CardSnapshot, CardError> {
        let path = snapshot.document.path().to_path_buf();

        // Validate before touching disk.
        let document = CardDocument::parse(&path, &candidate)?;

        // Conflict check against the on-disk bytes, not the mtime: editors
        // that rewrite unchanged content must not trip a false conflict.
        let on_disk = fs::read_to_string(&path).map_err(|source| CardError::Read {
            path: path.clone(),
            source,
        })?;
        if on_disk != snapshot.baseline {
            return Err(CardError::Conflict { path });
        }

        atomic_write(&path, &candidate)?;

        let modified = fs::metadata(&path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        Ok(CardSnapshot {
            document,
            baseline: candidate,
            modified,
        })
    }
}

/// Write-to-temp plus rename in the target directory.
fn atomic_write(path: &Path, content: &str) -> Result<(), CardError> {
    let tmp = temp_path(path);
    let write_err = |source| CardError::Write {
        path: path.to_path_buf(),
        source,
    };
    fs::write(&tmp, content).map_err(write_err)?;
    fs::rename(&tmp, path).map_err(|source| {
        let _ = fs::remove_file(&tmp);
        write_err(source)
    })
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("card.md");
    path.with_file_name(format!(".{name}.tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::document::AcceptanceItem;
    use std::fs;
    use tempfile::tempdir;

    const SAMPLE: &str = "---\nowner: alice\n---\n\n# 1.1 Store card\n\nSummary:\noriginal\n";

    fn card_file(dir: &Path) -> PathBuf {
        let backlog = dir.join("phase-1-x").join("backlog");
        fs::create_dir_all(&backlog).unwrap();
        let path = backlog.join("1.1-store-card.md");
        fs::write(&path, SAMPLE).unwrap();
        path
    }

    #[test]
    fn load_captures_baseline() {
        let dir = tempdir().unwrap();
        let path = card_file(dir.path());
        let store = CardStore::new();
        let snapshot = store.load_snapshot(&path).unwrap();
        assert_eq!(snapshot.baseline, SAMPLE);
        assert_eq!(snapshot.document.summary().as_deref(), Some("original"));
    }

    #[test]
    fn save_draft_writes_and_returns_fresh_snapshot() {
        let dir = tempdir().unwrap();
        let path = card_file(dir.path());
        let store = CardStore::new();
        let snapshot = store.load_snapshot(&path).unwrap();

        let draft = CardDraft {
            summary: Some("updated".into()),
            ..Default::default()
        };
        let fresh = store.save_form_draft(&draft, &[], &snapshot).unwrap();

        let on_disk = fs::read_to_string(&path).unwrap();
        assert!(on_disk.contains("Summary:\nupdated"));
        assert_eq!(fresh.baseline, on_disk);
        // The stale snapshot now conflicts.
        let err = store.save_form_draft(&draft, &[], &snapshot).unwrap_err();
        assert!(matches!(err, CardError::Conflict { .. }));
    }

    #[test]
    fn external_edit_is_detected_as_conflict_without_writing() {
        let dir = tempdir().unwrap();
        let path = card_file(dir.path());
        let store = CardStore::new();
        let snapshot = store.load_snapshot(&path).unwrap();

        let external = SAMPLE.replace("original", "edited elsewhere");
        fs::write(&path, &external).unwrap();

        let err = store
            .save_raw(&SAMPLE.replace("original", "mine"), &snapshot)
            .unwrap_err();
        assert!(matches!(err, CardError::Conflict { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), external);
    }

    #[test]
    fn invalid_candidate_never_touches_disk() {
        let dir = tempdir().unwrap();
        let path = card_file(dir.path());
        let store = CardStore::new();
        let snapshot = store.load_snapshot(&path).unwrap();

        let err = store.save_raw("---\nbroken frontmatter\n", &snapshot).unwrap_err();
        assert!(matches!(err, CardError::FrontmatterLine { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), SAMPLE);
    }

    #[test]
    fn identical_save_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = card_file(dir.path());
        let store = CardStore::new();
        let snapshot = store.load_snapshot(&path).unwrap();

        let draft = CardDraft {
            summary: snapshot.document.summary(),
            acceptance: Some(snapshot.document.acceptance_items()),
            ..Default::default()
        };
        let fresh = store.save_form_draft(&draft, &[], &snapshot).unwrap();
        assert_eq!(fresh.baseline, SAMPLE);
        assert_eq!(fs::read_to_string(&path).unwrap(), SAMPLE);
    }

    #[test]
    fn draft_with_acceptance_and_history_round_trips() {
        let dir = tempdir().unwrap();
        let path = card_file(dir.path());
        let store = CardStore::new();
        let snapshot = store.load_snapshot(&path).unwrap();

        let draft = CardDraft {
            acceptance: Some(vec![AcceptanceItem {
                title: "works".into(),
                complete: true,
            }]),
            fields: vec![("agent_status".into(), "running".into())],
            ..Default::default()
        };
        let fresh = store
            .save_form_draft(&draft, &["started".to_string()], &snapshot)
            .unwrap();
        assert!(fresh.baseline.contains("- [x] works"));
        assert!(fresh.baseline.contains("agent_status: running"));
        assert!(fresh.document.history_entries().last().unwrap().ends_with("started"));
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempdir().unwrap();
        let path = card_file(dir.path());
        let store = CardStore::new();
        let snapshot = store.load_snapshot(&path).unwrap();
        store
            .save_raw(&SAMPLE.replace("original", "new"), &snapshot)
            .unwrap();
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
