//! Bridges the scheduler to executor backends.

use crate::errors::LaunchError;
use crate::executor::{EventSink, ExecEvent, ExecutorRegistry, RunPaths};
use crate::run::{RunId, RunRequest, WorkerRunResult};
use crate::scheduler::{CompletionSender, RunCompletion, RunLauncher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Launches each run on its own task, pumping executor events into
/// tracing and delivering the terminal result back to the scheduler.
pub struct AgentLauncher {
    registry: Arc<ExecutorRegistry>,
    logs_dir: PathBuf,
    runs_dir: PathBuf,
    cancels: Arc<Mutex<HashMap<RunId, watch::Sender<bool>>>>,
}

impl AgentLauncher {
    pub fn new(registry: Arc<ExecutorRegistry>, logs_dir: PathBuf, runs_dir: PathBuf) -> Self {
        Self {
            registry,
            logs_dir,
            runs_dir,
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl RunLauncher for AgentLauncher {
    fn launch(
        &self,
        request: &RunRequest,
        attempt: u32,
        completions: CompletionSender,
    ) -> Result<(), LaunchError> {
        let executor = self.registry.get(request.flow)?;
        let paths = RunPaths::for_run(&self.logs_dir, &self.runs_dir, &request.run_id);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancels
            .lock()
            .expect("cancel map lock poisoned")
            .insert(request.run_id, cancel_tx);

        let request = request.clone();
        let run_id = request.run_id;
        let card = request.card_path.clone();
        let cancels = Arc::clone(&self.cancels);
        tokio::spawn(async move {
            let (sink, mut events) = EventSink::channel();
            let exec = {
                let request = request.clone();
                let executor = executor.clone();
                let paths = paths.clone();
                tokio::spawn(async move {
                    executor
                        .run(&request, &paths.log_path, &paths.output_dir, cancel_rx, sink)
                        .await
                })
            };

            let mut terminal: Option<WorkerRunResult> = None;
            while let Some(event) = events.recv().await {
                match event {
                    ExecEvent::Log { message } => {
                        tracing::info!(run = %run_id.short(), card = %card.display(), attempt, "{message}");
                    }
                    ExecEvent::Progress { fraction, message } => {
                        tracing::debug!(
                            run = %run_id.short(),
                            percent = (fraction * 100.0) as u32,
                            message = message.as_deref().unwrap_or(""),
                            "progress"
                        );
                    }
                    ExecEvent::Finished(result) => terminal = Some(result),
                }
            }

            let result = match exec.await {
                Ok(Ok(())) => terminal.unwrap_or_else(|| {
                    WorkerRunResult::failed(None, "executor ended without a terminal event")
                }),
                Ok(Err(err)) => {
                    terminal.unwrap_or_else(|| WorkerRunResult::failed(None, err.to_string()))
                }
                Err(join_err) => WorkerRunResult::failed(
                    None,
                    format!("executor task panicked: {join_err}"),
                ),
            };

            cancels.lock().expect("cancel map lock poisoned").remove(&run_id);
            let _ = completions.send(RunCompletion { run_id, result });
        });

        Ok(())
    }

    fn cancel(&self, run_id: RunId) {
        let sender = self
            .cancels
            .lock()
            .expect("cancel map lock poisoned")
            .remove(&run_id);
        match sender {
            Some(sender) => {
                let _ = sender.send(true);
            }
            None => tracing::debug!(%run_id, "cancel for run with no live worker"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SimulatedExecutor;
    use crate::run::{Flow, RunStatus};
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    fn request(flow: Flow) -> RunRequest {
        RunRequest {
            run_id: RunId::new(),
            card_path: "board/phase-1-a/backlog/1.1-demo.md".into(),
            flow,
            parallelizable: false,
            phase: Some("phase-1-a".into()),
            enqueued_at: Utc::now(),
        }
    }

    fn launcher(dir: &std::path::Path) -> AgentLauncher {
        let mut registry = ExecutorRegistry::new();
        registry.set_fallback(Arc::new(SimulatedExecutor::new(Duration::from_millis(5))));
        AgentLauncher::new(
            Arc::new(registry),
            dir.join("logs"),
            dir.join("runs"),
        )
    }

    #[tokio::test]
    async fn delivers_exactly_one_completion() {
        let dir = tempdir().unwrap();
        let launcher = launcher(dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let request = request(Flow::Implement);
        launcher.launch(&request, 1, tx).unwrap();

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.run_id, request.run_id);
        assert_eq!(completion.result.status, RunStatus::Succeeded);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err(),
            "second completion arrived"
        );
    }

    #[tokio::test]
    async fn cancel_reaches_the_executor() {
        let dir = tempdir().unwrap();
        let mut registry = ExecutorRegistry::new();
        registry.set_fallback(Arc::new(SimulatedExecutor::new(Duration::from_secs(30))));
        let launcher = AgentLauncher::new(
            Arc::new(registry),
            dir.path().join("logs"),
            dir.path().join("runs"),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        let request = request(Flow::Review);
        launcher.launch(&request, 1, tx).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        launcher.cancel(request.run_id);

        let completion = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completion.result.status, RunStatus::Canceled);
    }

    #[tokio::test]
    async fn missing_executor_is_a_launch_error() {
        let dir = tempdir().unwrap();
        let launcher = AgentLauncher::new(
            Arc::new(ExecutorRegistry::new()),
            dir.path().join("logs"),
            dir.path().join("runs"),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = launcher.launch(&request(Flow::Plan), 1, tx).unwrap_err();
        assert!(matches!(err, LaunchError::MissingExecutor(Flow::Plan)));
    }
}
