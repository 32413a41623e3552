//! The card file format: markdown with optional `---` frontmatter, a
//! `# <code> <title>` heading, and colon-terminated sections.
//!
//! Parsing is lossless: every original line is kept verbatim (frontmatter
//! lines, blank runs, unknown sections), so rendering a document with no
//! edits reproduces the input byte for byte. Draft edits replace only the
//! regions they touch.
//!
//! The grammar is simple enough that a line-oriented pass beats a regex:
//! a section header is a line of one leading capital, letters/spaces, and a
//! trailing colon; a frontmatter line is `key: value`.

use crate::errors::CardError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Frontmatter keys with typed accessors. Unknown keys are preserved in
/// their original order alongside these.
pub const KNOWN_FIELDS: [&str; 7] = [
    "owner",
    "agent_flow",
    "agent_status",
    "branch",
    "risk",
    "review",
    "parallelizable",
];

const CANONICAL_SECTIONS: [&str; 4] = ["Summary", "Acceptance Criteria", "Notes", "History"];

/// One checklist entry from the Acceptance Criteria section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceItem {
    pub title: String,
    pub complete: bool,
}

#[derive(Debug, Clone)]
struct FieldEntry {
    key: String,
    value: String,
    /// Original line, emitted verbatim unless the value was replaced.
    raw: String,
}

#[derive(Debug, Clone, Default)]
struct Frontmatter {
    entries: Vec<FieldEntry>,
}

impl Frontmatter {
    fn get(&self, key: &str) -> Option<&str> {
        let value = self
            .entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())?;
        if value.is_empty() || value == "null" {
            None
        } else {
            Some(value)
        }
    }

    fn set(&mut self, key: &str, value: &str) {
        let raw = format!("{key}: {value}");
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) => {
                if entry.value != value {
                    entry.value = value.to_string();
                    entry.raw = raw;
                }
            }
            None => self.entries.push(FieldEntry {
                key: key.to_string(),
                value: value.to_string(),
                raw,
            }),
        }
    }
}

#[derive(Debug, Clone)]
struct Section {
    name: String,
    /// Original header line, e.g. `Acceptance Criteria:`.
    header: String,
    /// Raw body lines up to the next header, trailing blanks included.
    body: Vec<String>,
}

/// A parsed card file. Field edits and section edits mutate the stored raw
/// regions in place; `render` reassembles them.
#[derive(Debug, Clone)]
pub struct CardDocument {
    path: PathBuf,
    frontmatter: Option<Frontmatter>,
    /// Blank lines between the closing `---` (or file start) and the title.
    lead: Vec<String>,
    title_line: String,
    code: Option<String>,
    title: String,
    /// Lines between the title and the first section header.
    preamble: Vec<String>,
    sections: Vec<Section>,
    ends_with_newline: bool,
}

impl CardDocument {
    /// Parse raw card file contents.
    pub fn parse(path: &Path, raw: &str) -> Result<Self, CardError> {
        let ends_with_newline = raw.ends_with('\n');
        let mut lines: Vec<&str> = raw.split('\n').collect();
        if ends_with_newline {
            lines.pop();
        }

        let mut idx = 0;
        let frontmatter = match lines.first() {
            Some(&"---") => {
                let mut fm = Frontmatter::default();
                idx = 1;
                loop {
                    let Some(&line) = lines.get(idx) else {
                        return Err(CardError::UnterminatedFrontmatter {
                            path: path.to_path_buf(),
                        });
                    };
                    if line == "---" {
                        idx += 1;
                        break;
                    }
                    let Some(colon) = line.find(':') else {
                        return Err(CardError::FrontmatterLine {
                            path: path.to_path_buf(),
                            line: idx + 1,
                            text: line.to_string(),
                        });
                    };
                    fm.entries.push(FieldEntry {
                        key: line[..colon].trim().to_string(),
                        value: line[colon + 1..].trim().to_string(),
                        raw: line.to_string(),
                    });
                    idx += 1;
                }
                Some(fm)
            }
            Some(first) if first.trim() == "---" => {
                return Err(CardError::MalformedDelimiter {
                    path: path.to_path_buf(),
                    text: first.to_string(),
                });
            }
            _ => None,
        };

        let mut lead = Vec::new();
        while idx < lines.len() && lines[idx].trim().is_empty() {
            lead.push(lines[idx].to_string());
            idx += 1;
        }

        let title_line = match lines.get(idx) {
            Some(line) if line.starts_with("# ") => line.to_string(),
            other => {
                return Err(CardError::MissingTitle {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    text: other.unwrap_or(&"").to_string(),
                });
            }
        };
        idx += 1;

        let heading = title_line[2..].trim();
        let (code, title) = match heading.split_once(' ') {
            Some((first, rest)) if crate::board::is_card_code(first) => {
                (Some(first.to_string()), rest.trim().to_string())
            }
            _ => (None, heading.to_string()),
        };

        let mut preamble = Vec::new();
        while idx < lines.len() && !is_section_header(lines[idx]) {
            preamble.push(lines[idx].to_string());
            idx += 1;
        }

        let mut sections: Vec<Section> = Vec::new();
        while idx < lines.len() {
            let header = lines[idx].to_string();
            let name = header[..header.len() - 1].to_string();
            idx += 1;
            let mut body = Vec::new();
            while idx < lines.len() && !is_section_header(lines[idx]) {
                body.push(lines[idx].to_string());
                idx += 1;
            }
            sections.push(Section { name, header, body });
        }

        Ok(Self {
            path: path.to_path_buf(),
            frontmatter,
            lead,
            title_line,
            code,
            title,
            preamble,
            sections,
            ends_with_newline,
        })
    }

    /// Reassemble the document. With no edits applied this reproduces the
    /// parsed input exactly.
    pub fn render(&self) -> String {
        let mut lines: Vec<&str> = Vec::new();
        if let Some(fm) = &self.frontmatter {
            lines.push("---");
            for entry in &fm.entries {
                lines.push(&entry.raw);
            }
            lines.push("---");
        }
        for line in &self.lead {
            lines.push(line);
        }
        lines.push(&self.title_line);
        for line in &self.preamble {
            lines.push(line);
        }
        for section in &self.sections {
            lines.push(&section.header);
            for line in &section.body {
                lines.push(line);
            }
        }
        let mut out = lines.join("\n");
        if self.ends_with_newline {
            out.push('\n');
        }
        out
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<phase>.<task>` from the heading, if present.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Frontmatter value for `key`; `null` and empty values read as absent.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.frontmatter.as_ref()?.get(key)
    }

    pub fn parallelizable(&self) -> bool {
        self.field("parallelizable") == Some("true")
    }

    pub fn section_names(&self) -> Vec<&str> {
        self.sections.iter().map(|s| s.name.as_str()).collect()
    }

    /// Section body with surrounding blank lines stripped.
    pub fn section_text(&self, name: &str) -> Option<String> {
        let section = self.sections.iter().find(|s| s.name == name)?;
        Some(section.body.join("\n").trim().to_string())
    }

    pub fn summary(&self) -> Option<String> {
        self.section_text("Summary")
    }

    pub fn notes(&self) -> Option<String> {
        self.section_text("Notes")
    }

    pub fn acceptance_items(&self) -> Vec<AcceptanceItem> {
        let Some(section) = self.sections.iter().find(|s| s.name == "Acceptance Criteria") else {
            return Vec::new();
        };
        section
            .body
            .iter()
            .filter_map(|line| parse_checklist_line(line))
            .collect()
    }

    pub fn history_entries(&self) -> Vec<String> {
        let Some(section) = self.sections.iter().find(|s| s.name == "History") else {
            return Vec::new();
        };
        section
            .body
            .iter()
            .filter_map(|line| line.trim().strip_prefix("- "))
            .map(|entry| entry.to_string())
            .collect()
    }

    /// Replace the heading title, keeping the card code.
    pub fn set_title(&mut self, title: &str) {
        let title = title.trim();
        if title == self.title {
            return;
        }
        self.title = title.to_string();
        self.title_line = match &self.code {
            Some(code) => format!("# {code} {title}"),
            None => format!("# {title}"),
        };
    }

    /// Set a frontmatter field, creating the frontmatter block if the file
    /// had none.
    pub fn set_field(&mut self, key: &str, value: &str) {
        self.frontmatter
            .get_or_insert_with(Frontmatter::default)
            .set(key, value);
    }

    /// Replace a section's content. Creates the section at the end of the
    /// document if it is missing; keeps the original trailing blank run so
    /// untouched neighbours are unaffected. A no-op when the content is
    /// already identical.
    pub fn set_section_text(&mut self, name: &str, text: &str) {
        if self.section_text(name).as_deref() == Some(text.trim()) {
            return;
        }
        let content: Vec<String> = text.trim_end().lines().map(|l| l.to_string()).collect();
        match self.sections.iter_mut().find(|s| s.name == name) {
            Some(section) => {
                let trailing_blanks = section
                    .body
                    .iter()
                    .rev()
                    .take_while(|l| l.trim().is_empty())
                    .count();
                let mut body = content;
                body.extend(std::iter::repeat_n(String::new(), trailing_blanks));
                section.body = body;
            }
            None => self.append_section(name, content),
        }
    }

    pub fn set_acceptance(&mut self, items: &[AcceptanceItem]) {
        if self.acceptance_items() == items {
            return;
        }
        let text = items
            .iter()
            .map(|item| {
                let mark = if item.complete { "x" } else { " " };
                format!("- [{mark}] {}", item.title)
            })
            .collect::<Vec<_>>()
            .join("\n");
        self.set_section_text("Acceptance Criteria", &text);
    }

    /// Append history entries as `- ` bullets. An entry already shaped like
    /// `YYYY-MM-DD - <text>` is kept verbatim; anything else gets today's
    /// date prefixed.
    pub fn append_history(&mut self, entries: &[String]) {
        if entries.is_empty() {
            return;
        }
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let bullets: Vec<String> = entries
            .iter()
            .map(|entry| format!("- {}", normalize_history_entry(entry, &today)))
            .collect();

        if !self.sections.iter().any(|s| s.name == "History") {
            self.append_section("History", Vec::new());
        }
        let section = self
            .sections
            .iter_mut()
            .find(|s| s.name == "History")
            .expect("History section exists");
        let insert_at = section
            .body
            .iter()
            .rposition(|l| !l.trim().is_empty())
            .map(|i| i + 1)
            .unwrap_or(0);
        for (offset, bullet) in bullets.into_iter().enumerate() {
            section.body.insert(insert_at + offset, bullet);
        }
    }

    /// Apply a form draft: canonical sections in order, then history.
    /// Untouched regions keep their original bytes.
    pub fn apply_draft(&mut self, draft: &CardDraft, history: &[String]) {
        if let Some(title) = &draft.title {
            self.set_title(title);
        }
        for (key, value) in &draft.fields {
            self.set_field(key, value);
        }
        if let Some(summary) = &draft.summary {
            self.set_section_text("Summary", summary);
        }
        if let Some(items) = &draft.acceptance {
            self.set_acceptance(items);
        }
        if let Some(notes) = &draft.notes {
            self.set_section_text("Notes", notes);
        }
        self.append_history(history);
    }

    fn append_section(&mut self, name: &str, body: Vec<String>) {
        debug_assert!(CANONICAL_SECTIONS.contains(&name) || !name.is_empty());
        // Separate from whatever currently ends the document.
        let last_line_blank = match self.sections.last() {
            Some(section) => section
                .body
                .last()
                .map(|l| l.trim().is_empty())
                .unwrap_or(false),
            None => self
                .preamble
                .last()
                .map(|l| l.trim().is_empty())
                .unwrap_or(self.preamble.is_empty()),
        };
        if !last_line_blank {
            match self.sections.last_mut() {
                Some(section) => section.body.push(String::new()),
                None => self.preamble.push(String::new()),
            }
        }
        self.sections.push(Section {
            name: name.to_string(),
            header: format!("{name}:"),
            body,
        });
    }
}

/// Edits to apply through the single validated write path. `None` fields
/// leave the corresponding region untouched.
#[derive(Debug, Clone, Default)]
pub struct CardDraft {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub acceptance: Option<Vec<AcceptanceItem>>,
    pub notes: Option<String>,
    /// Frontmatter updates, applied in order.
    pub fields: Vec<(String, String)>,
}

/// A section header is a line of a leading capital letter, letters and
/// spaces, with a trailing colon.
fn is_section_header(line: &str) -> bool {
    let Some(name) = line.strip_suffix(':') else {
        return false;
    };
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_uppercase() && chars.all(|c| c.is_ascii_alphabetic() || c == ' ')
}

fn parse_checklist_line(line: &str) -> Option<AcceptanceItem> {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix("- [ ]") {
        return Some(AcceptanceItem {
            title: rest.trim().to_string(),
            complete: false,
        });
    }
    for done in ["- [x]", "- [X]"] {
        if let Some(rest) = trimmed.strip_prefix(done) {
            return Some(AcceptanceItem {
                title: rest.trim().to_string(),
                complete: true,
            });
        }
    }
    None
}

fn normalize_history_entry(entry: &str, today: &str) -> String {
    if is_dated_history_entry(entry) {
        entry.to_string()
    } else {
        format!("{today} - {entry}")
    }
}

/// `YYYY-MM-DD - <text>` with non-empty text.
fn is_dated_history_entry(entry: &str) -> bool {
    let bytes = entry.as_bytes();
    if bytes.len() < 14 {
        return false;
    }
    let date_ok = bytes[..10]
        .iter()
        .enumerate()
        .all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        });
    date_ok && &entry[10..13] == " - " && !entry[13..].trim().is_empty()
}
