//! Pluggable agent execution backends.
//!
//! The scheduler never spawns processes itself. It resolves an
//! [`AgentExecutor`] for the run's flow from the [`ExecutorRegistry`] and
//! hands it the request together with an event sink and a cancellation
//! signal. Every backend must emit exactly one terminal
//! [`ExecEvent::Finished`] per run, on success, failure, and cancellation
//! alike.

pub mod cli_backend;
pub mod simulated;
pub mod supervisor;
pub mod worklog;

use crate::errors::LaunchError;
use crate::run::{Flow, RunRequest, WorkerRunResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub use cli_backend::CliAgentBackend;
pub use simulated::SimulatedExecutor;
pub use supervisor::ProcessSupervisor;
pub use worklog::WorkerLog;

/// Progress emitted by a backend while a run executes.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecEvent {
    Log { message: String },
    Progress { fraction: f64, message: Option<String> },
    Finished(WorkerRunResult),
}

/// Sending half handed to backends. Drops of the receiving side are
/// tolerated; a backend keeps running to completion regardless.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ExecEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExecEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn log(&self, message: impl Into<String>) {
        let _ = self.tx.send(ExecEvent::Log {
            message: message.into(),
        });
    }

    pub fn progress(&self, fraction: f64, message: Option<String>) {
        let _ = self.tx.send(ExecEvent::Progress {
            fraction: fraction.clamp(0.0, 1.0),
            message,
        });
    }

    pub fn finished(&self, result: WorkerRunResult) {
        let _ = self.tx.send(ExecEvent::Finished(result));
    }
}

/// A backend that can execute one run of a given flow.
///
/// Contract: honor `cancel` promptly, write a replayable log under
/// `log_path`, and emit exactly one `Finished` event on every path out.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn run(
        &self,
        request: &RunRequest,
        log_path: &Path,
        output_dir: &Path,
        cancel: watch::Receiver<bool>,
        sink: EventSink,
    ) -> Result<(), LaunchError>;
}

/// Flow-to-backend routing with an optional fallback.
#[derive(Default)]
pub struct ExecutorRegistry {
    by_flow: HashMap<Flow, Arc<dyn AgentExecutor>>,
    fallback: Option<Arc<dyn AgentExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, flow: Flow, executor: Arc<dyn AgentExecutor>) {
        self.by_flow.insert(flow, executor);
    }

    /// Backend used for any flow without a dedicated registration.
    pub fn set_fallback(&mut self, executor: Arc<dyn AgentExecutor>) {
        self.fallback = Some(executor);
    }

    pub fn get(&self, flow: Flow) -> Result<Arc<dyn AgentExecutor>, LaunchError> {
        self.by_flow
            .get(&flow)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or(LaunchError::MissingExecutor(flow))
    }

    /// Registry routing every flow to the standard CLI agent backend.
    pub fn with_cli_backend(agent_cmd: String) -> Self {
        let mut registry = Self::new();
        registry.set_fallback(Arc::new(CliAgentBackend::new(agent_cmd)));
        registry
    }
}

/// Per-run working paths derived from the runtime directory layout.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub log_path: PathBuf,
    pub output_dir: PathBuf,
}

impl RunPaths {
    pub fn for_run(logs_dir: &Path, runs_dir: &Path, run_id: &crate::run::RunId) -> Self {
        Self {
            log_path: logs_dir.join(format!("{}.jsonl", run_id.short())),
            output_dir: runs_dir.join(run_id.short()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{RunId, RunStatus};

    struct NoopExecutor;

    #[async_trait]
    impl AgentExecutor for NoopExecutor {
        async fn run(
            &self,
            _request: &RunRequest,
            _log_path: &Path,
            _output_dir: &Path,
            _cancel: watch::Receiver<bool>,
            sink: EventSink,
        ) -> Result<(), LaunchError> {
            sink.finished(WorkerRunResult::succeeded("done"));
            Ok(())
        }
    }

    #[test]
    fn registry_resolves_registered_flow() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Flow::Implement, Arc::new(NoopExecutor));
        assert!(registry.get(Flow::Implement).is_ok());
        assert!(matches!(
            registry.get(Flow::Review),
            Err(LaunchError::MissingExecutor(Flow::Review))
        ));
    }

    #[test]
    fn registry_falls_back() {
        let mut registry = ExecutorRegistry::new();
        registry.set_fallback(Arc::new(NoopExecutor));
        assert!(registry.get(Flow::Research).is_ok());
    }

    #[tokio::test]
    async fn sink_delivers_events_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.log("hello");
        sink.progress(0.5, Some("half".into()));
        sink.finished(WorkerRunResult::succeeded("done"));
        drop(sink);

        assert!(matches!(rx.recv().await, Some(ExecEvent::Log { .. })));
        assert!(matches!(rx.recv().await, Some(ExecEvent::Progress { .. })));
        match rx.recv().await {
            Some(ExecEvent::Finished(result)) => assert_eq!(result.status, RunStatus::Succeeded),
            other => panic!("expected finished, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn progress_fraction_is_clamped() {
        let (sink, mut rx) = EventSink::channel();
        sink.progress(3.0, None);
        match rx.try_recv() {
            Ok(ExecEvent::Progress { fraction, .. }) => assert_eq!(fraction, 1.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn run_paths_use_short_id() {
        let id = RunId::new();
        let paths = RunPaths::for_run(Path::new("/tmp/logs"), Path::new("/tmp/runs"), &id);
        assert_eq!(
            paths.log_path,
            Path::new("/tmp/logs").join(format!("{}.jsonl", id.short()))
        );
        assert_eq!(paths.output_dir, Path::new("/tmp/runs").join(id.short()));
    }
}
