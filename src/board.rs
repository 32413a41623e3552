//! The kanban folder convention: where cards live and what their paths mean.
//!
//! Layout consumed (never produced) by the coordinator:
//!
//! ```text
//! <root>/project/phase-<n>-<slug>/{backlog,in-progress,done}/<phase>.<task>-<slug>.md
//! ```
//!
//! A card's status is derived solely from its containing folder; it is never
//! stored redundantly inside the file.

use crate::errors::CardError;
use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Card status, derived from the containing folder name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CardStatus {
    Backlog,
    InProgress,
    Done,
}

impl CardStatus {
    pub fn from_dir_name(name: &str) -> Option<Self> {
        match name {
            "backlog" => Some(CardStatus::Backlog),
            "in-progress" => Some(CardStatus::InProgress),
            "done" => Some(CardStatus::Done),
            _ => None,
        }
    }

    pub fn dir_name(&self) -> &'static str {
        match self {
            CardStatus::Backlog => "backlog",
            CardStatus::InProgress => "in-progress",
            CardStatus::Done => "done",
        }
    }
}

impl fmt::Display for CardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Everything the folder convention says about one card file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardLocation {
    pub path: PathBuf,
    /// `<phase>.<task>`, e.g. `1.2`.
    pub code: String,
    pub slug: String,
    pub status: CardStatus,
    /// First path component beginning with `phase-`, if any.
    pub phase: Option<String>,
}

impl CardLocation {
    /// Parse a card path against the folder convention.
    pub fn parse(path: &Path) -> Result<Self, CardError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CardError::BadFileName {
                name: path.display().to_string(),
            })?;

        let (code, slug) = split_card_name(name).ok_or_else(|| CardError::BadFileName {
            name: name.to_string(),
        })?;

        let folder = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or("");
        let status =
            CardStatus::from_dir_name(folder).ok_or_else(|| CardError::BadStatusFolder {
                path: path.to_path_buf(),
                folder: folder.to_string(),
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            code: code.to_string(),
            slug: slug.to_string(),
            status,
            phase: phase_for_path(path),
        })
    }
}

/// The phase identifier a card belongs to: the first path component that
/// begins with `phase-`.
pub fn phase_for_path(path: &Path) -> Option<String> {
    path.components()
        .filter_map(|c| c.as_os_str().to_str())
        .find(|c| c.starts_with("phase-"))
        .map(|c| c.to_string())
}

/// Split `<phase>.<task>-<slug>.md` into (`<phase>.<task>`, `<slug>`).
fn split_card_name(name: &str) -> Option<(&str, &str)> {
    let stem = name.strip_suffix(".md")?;
    let dash = stem.find('-')?;
    let (code, rest) = stem.split_at(dash);
    let slug = &rest[1..];
    if slug.is_empty() || !is_card_code(code) {
        return None;
    }
    Some((code, slug))
}

/// A card code is `<digits>.<digits>`.
pub fn is_card_code(code: &str) -> bool {
    let mut parts = code.split('.');
    let (Some(phase), Some(task), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    !phase.is_empty()
        && !task.is_empty()
        && phase.chars().all(|c| c.is_ascii_digit())
        && task.chars().all(|c| c.is_ascii_digit())
}

/// Scan the board for card files, sorted by code then path.
///
/// Files that do not match the folder convention are skipped; the board may
/// legitimately contain roadmap documents and notes alongside cards.
pub fn scan_cards(root: &Path) -> Vec<CardLocation> {
    let mut cards: Vec<CardLocation> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().is_some_and(|e| e == "md"))
        .filter_map(|entry| CardLocation::parse(entry.path()).ok())
        .collect();
    cards.sort_by(|a, b| {
        code_sort_key(&a.code)
            .cmp(&code_sort_key(&b.code))
            .then_with(|| a.path.cmp(&b.path))
    });
    cards
}

fn code_sort_key(code: &str) -> (u64, u64) {
    let mut parts = code.split('.');
    let phase = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let task = parts.next().and_then(|t| t.parse().ok()).unwrap_or(0);
    (phase, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn parses_conventional_card_path() {
        let path = Path::new("/work/project/phase-1-setup/backlog/1.2-parse-cards.md");
        let loc = CardLocation::parse(path).unwrap();
        assert_eq!(loc.code, "1.2");
        assert_eq!(loc.slug, "parse-cards");
        assert_eq!(loc.status, CardStatus::Backlog);
        assert_eq!(loc.phase.as_deref(), Some("phase-1-setup"));
    }

    #[test]
    fn status_comes_from_folder_name() {
        for (dir, status) in [
            ("backlog", CardStatus::Backlog),
            ("in-progress", CardStatus::InProgress),
            ("done", CardStatus::Done),
        ] {
            let path = PathBuf::from(format!("/b/phase-2-core/{dir}/2.1-thing.md"));
            assert_eq!(CardLocation::parse(&path).unwrap().status, status);
        }
    }

    #[test]
    fn rejects_unknown_status_folder() {
        let path = Path::new("/b/phase-1-x/archive/1.1-thing.md");
        let err = CardLocation::parse(path).unwrap_err();
        assert!(matches!(err, CardError::BadStatusFolder { .. }));
    }

    #[test]
    fn rejects_bad_file_names() {
        for name in ["notes.md", "1-thing.md", "1.2.md", "1.2-.md", "a.b-x.md"] {
            let path = PathBuf::from(format!("/b/phase-1-x/backlog/{name}"));
            assert!(
                CardLocation::parse(&path).is_err(),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn slug_may_contain_dashes() {
        let path = Path::new("/b/phase-1-x/done/10.42-multi-word-slug.md");
        let loc = CardLocation::parse(path).unwrap();
        assert_eq!(loc.code, "10.42");
        assert_eq!(loc.slug, "multi-word-slug");
    }

    #[test]
    fn phase_for_path_finds_first_phase_component() {
        assert_eq!(
            phase_for_path(Path::new("/r/project/phase-3-api/backlog/3.1-a.md")).as_deref(),
            Some("phase-3-api")
        );
        assert_eq!(phase_for_path(Path::new("/r/project/misc/3.1-a.md")), None);
    }

    #[test]
    fn scan_finds_cards_sorted_by_code() {
        let dir = tempdir().unwrap();
        for (phase, card) in [
            ("phase-2-core", "2.1-store.md"),
            ("phase-1-setup", "1.10-late.md"),
            ("phase-1-setup", "1.2-early.md"),
        ] {
            let d = dir.path().join("project").join(phase).join("backlog");
            fs::create_dir_all(&d).unwrap();
            fs::write(d.join(card), "# x Title\n").unwrap();
        }
        // A stray non-card markdown file is skipped.
        fs::write(dir.path().join("project").join("ROADMAP.md"), "# Roadmap\n").unwrap();

        let cards = scan_cards(dir.path());
        let codes: Vec<&str> = cards.iter().map(|c| c.code.as_str()).collect();
        assert_eq!(codes, vec!["1.2", "1.10", "2.1"]);
    }
}
