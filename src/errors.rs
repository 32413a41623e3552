//! Typed error hierarchy for the deckhand coordinator.
//!
//! Three enums cover the three subsystems:
//! - `CardError`: card parsing, validation and save failures
//! - `LaunchError`: executor registration and subprocess spawn failures
//! - `SchedulerError`: scheduler handle and run bookkeeping failures
//!
//! Admission outcomes (already-running, backpressure) are deliberately not
//! errors; they are ordinary `Admission` values returned by `enqueue`.

use crate::run::{Flow, RunId};
use std::path::PathBuf;
use thiserror::Error;

/// Errors from parsing, validating or persisting card documents.
#[derive(Debug, Error)]
pub enum CardError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "{path}:{line}: frontmatter line has no `key: value` separator: {text:?} \
         (add a colon or remove the line)"
    )]
    FrontmatterLine {
        path: PathBuf,
        line: usize,
        text: String,
    },

    #[error("{path}:1: malformed frontmatter delimiter {text:?} (the opening line must be exactly `---`)")]
    MalformedDelimiter { path: PathBuf, text: String },

    #[error("{path}: frontmatter opened with `---` but never closed")]
    UnterminatedFrontmatter { path: PathBuf },

    #[error("{path}:{line}: expected a `# <code> <title>` heading, found {text:?}")]
    MissingTitle {
        path: PathBuf,
        line: usize,
        text: String,
    },

    #[error("card file name {name:?} does not match `<phase>.<task>-<slug>.md`")]
    BadFileName { name: String },

    #[error("{path}: containing folder {folder:?} is not backlog, in-progress or done")]
    BadStatusFolder { path: PathBuf, folder: String },

    #[error("{path}: file changed on disk since it was loaded; reload before saving")]
    Conflict { path: PathBuf },
}

/// Errors raised while trying to start a run. These are treated as run
/// failures by the scheduler and enter the retry path.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no executor registered for flow {0}")]
    MissingExecutor(Flow),

    #[error("failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the scheduler handle.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is no longer running")]
    Closed,

    #[error("run {0} is not active")]
    UnknownRun(RunId),

    #[error(transparent)]
    Card(#[from] CardError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontmatter_line_error_names_the_line() {
        let err = CardError::FrontmatterLine {
            path: PathBuf::from("/board/1.1-setup.md"),
            line: 3,
            text: "owner alice".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains(":3:"));
        assert!(msg.contains("owner alice"));
        assert!(msg.contains("add a colon"));
    }

    #[test]
    fn conflict_error_is_matchable() {
        let err = CardError::Conflict {
            path: PathBuf::from("/board/1.1-setup.md"),
        };
        assert!(matches!(err, CardError::Conflict { .. }));
        assert!(err.to_string().contains("reload"));
    }

    #[test]
    fn launch_error_missing_executor_names_flow() {
        let err = LaunchError::MissingExecutor(Flow::Review);
        assert!(err.to_string().contains("review"));
    }

    #[test]
    fn scheduler_error_wraps_card_error() {
        let inner = CardError::UnterminatedFrontmatter {
            path: PathBuf::from("/board/1.1-setup.md"),
        };
        let err: SchedulerError = inner.into();
        assert!(matches!(err, SchedulerError::Card(_)));
    }

    #[test]
    fn all_error_types_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&CardError::BadFileName {
            name: "x.md".into(),
        });
        assert_std_error(&LaunchError::MissingExecutor(Flow::Plan));
        assert_std_error(&SchedulerError::Closed);
    }
}
