//! In-process scripted backend for tests and dry runs.

use crate::errors::LaunchError;
use crate::executor::{AgentExecutor, EventSink, WorkerLog};
use crate::run::{RunRequest, RunStatus, WorkerRunResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Executes runs without spawning a process. Each run pops the next
/// scripted outcome (defaulting to success once the script is exhausted),
/// sleeps for the configured duration, and honors cancellation.
pub struct SimulatedExecutor {
    outcomes: Mutex<VecDeque<RunStatus>>,
    run_duration: Duration,
}

impl SimulatedExecutor {
    pub fn new(run_duration: Duration) -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            run_duration,
        }
    }

    /// Script the outcome of the next unscripted run. Calls queue up.
    pub fn push_outcome(&self, status: RunStatus) {
        self.outcomes
            .lock()
            .expect("outcome queue lock poisoned")
            .push_back(status);
    }

    fn next_outcome(&self) -> RunStatus {
        self.outcomes
            .lock()
            .expect("outcome queue lock poisoned")
            .pop_front()
            .unwrap_or(RunStatus::Succeeded)
    }
}

#[async_trait]
impl AgentExecutor for SimulatedExecutor {
    async fn run(
        &self,
        request: &RunRequest,
        log_path: &Path,
        _output_dir: &Path,
        mut cancel: watch::Receiver<bool>,
        sink: EventSink,
    ) -> Result<(), LaunchError> {
        let started = Instant::now();
        let mut log = WorkerLog::create(log_path).map_err(LaunchError::SpawnFailed)?;
        log.worker_ready();
        sink.log(format!(
            "simulated {} run for {}",
            request.flow,
            request.card_path.display()
        ));

        let canceled = tokio::select! {
            _ = tokio::time::sleep(self.run_duration) => false,
            changed = cancel.changed() => changed.is_ok() && *cancel.borrow(),
        };

        let mut result = if canceled {
            WorkerRunResult::canceled()
        } else {
            sink.progress(1.0, None);
            log.progress(100, None);
            match self.next_outcome() {
                RunStatus::Succeeded => WorkerRunResult::succeeded("simulated run succeeded"),
                RunStatus::Failed => WorkerRunResult::failed(Some(1), "simulated run failed"),
                RunStatus::Canceled => WorkerRunResult::canceled(),
            }
        };
        result.duration_ms = started.elapsed().as_millis() as u64;

        log.worker_finished(&result);
        result.bytes_written = log.bytes_written();
        sink.finished(result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecEvent;
    use crate::run::{Flow, RunId};
    use chrono::Utc;
    use tempfile::tempdir;

    fn request() -> RunRequest {
        RunRequest {
            run_id: RunId::new(),
            card_path: "board/phase-1-a/backlog/1.1-demo.md".into(),
            flow: Flow::Implement,
            parallelizable: false,
            phase: Some("phase-1-a".into()),
            enqueued_at: Utc::now(),
        }
    }

    async fn run_once(executor: &SimulatedExecutor) -> WorkerRunResult {
        let dir = tempdir().unwrap();
        let (sink, mut rx) = EventSink::channel();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        executor
            .run(
                &request(),
                &dir.path().join("run.jsonl"),
                dir.path(),
                cancel_rx,
                sink,
            )
            .await
            .unwrap();
        loop {
            match rx.recv().await {
                Some(ExecEvent::Finished(result)) => return result,
                Some(_) => continue,
                None => panic!("no terminal event emitted"),
            }
        }
    }

    #[tokio::test]
    async fn scripted_outcomes_pop_in_order() {
        let executor = SimulatedExecutor::new(Duration::from_millis(1));
        executor.push_outcome(RunStatus::Failed);
        executor.push_outcome(RunStatus::Succeeded);

        assert_eq!(run_once(&executor).await.status, RunStatus::Failed);
        assert_eq!(run_once(&executor).await.status, RunStatus::Succeeded);
        // Exhausted script defaults to success.
        assert_eq!(run_once(&executor).await.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_the_run() {
        let executor = SimulatedExecutor::new(Duration::from_secs(30));
        let dir = tempdir().unwrap();
        let (sink, mut rx) = EventSink::channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let log_path = dir.path().join("run.jsonl");
        let output_dir = dir.path().to_path_buf();
        let started = Instant::now();
        let run = tokio::spawn(async move {
            executor
                .run(&request(), &log_path, &output_dir, cancel_rx, sink)
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_tx.send(true).unwrap();
        run.await.unwrap().unwrap();

        let result = loop {
            match rx.recv().await {
                Some(ExecEvent::Finished(result)) => break result,
                Some(_) => continue,
                None => panic!("no terminal event emitted"),
            }
        };
        assert_eq!(result.status, RunStatus::Canceled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
