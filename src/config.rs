use anyhow::{Context, Result};
use std::path::PathBuf;

/// Runtime configuration: the board root plus the `.deckhand` runtime
/// directory layout and the agent command.
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub runtime_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub locks_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub agent_cmd: String,
    pub verbose: bool,
}

impl Config {
    pub fn new(root: PathBuf, verbose: bool) -> Result<Self> {
        let root = root
            .canonicalize()
            .context("failed to resolve project directory")?;
        let runtime_dir = root.join(".deckhand");
        let agent_cmd =
            std::env::var("DECKHAND_AGENT_CMD").unwrap_or_else(|_| "claude".to_string());
        Ok(Self {
            logs_dir: runtime_dir.join("logs"),
            locks_dir: runtime_dir.join("locks"),
            runs_dir: runtime_dir.join("runs"),
            root,
            runtime_dir,
            agent_cmd,
            verbose,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.runtime_dir,
            &self.logs_dir,
            &self.locks_dir,
            &self.runs_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// The board directory holding phase folders, `<root>/board` if it
    /// exists, otherwise the root itself.
    pub fn board_dir(&self) -> PathBuf {
        let board = self.root.join("board");
        if board.is_dir() { board } else { self.root.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn layout_hangs_off_runtime_dir() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        assert_eq!(config.logs_dir, config.runtime_dir.join("logs"));
        assert_eq!(config.locks_dir, config.runtime_dir.join("locks"));
        assert_eq!(config.runs_dir, config.runtime_dir.join("runs"));
        assert!(config.runtime_dir.ends_with(".deckhand"));
    }

    #[test]
    fn ensure_directories_creates_the_tree() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.logs_dir.is_dir());
        assert!(config.locks_dir.is_dir());
        assert!(config.runs_dir.is_dir());
    }

    #[test]
    fn board_dir_prefers_board_subdirectory() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        assert_eq!(config.board_dir(), config.root);
        std::fs::create_dir(config.root.join("board")).unwrap();
        assert_eq!(config.board_dir(), config.root.join("board"));
    }

    #[test]
    fn missing_root_is_an_error() {
        let err = Config::new(PathBuf::from("/definitely/not/here"), false).unwrap_err();
        assert!(err.to_string().contains("project directory"));
    }
}
