//! Standard backend: one agent CLI process per run.

use crate::errors::LaunchError;
use crate::executor::{AgentExecutor, EventSink, ProcessSupervisor, WorkerLog};
use crate::run::RunRequest;
use async_trait::async_trait;
use std::path::Path;
use tokio::sync::watch;

/// Spawns the configured agent command for each run and supervises it.
///
/// The card path and flow travel both as arguments and as environment
/// variables, so agent wrappers can pick whichever is convenient.
pub struct CliAgentBackend {
    agent_cmd: String,
}

impl CliAgentBackend {
    pub fn new(agent_cmd: impl Into<String>) -> Self {
        Self {
            agent_cmd: agent_cmd.into(),
        }
    }
}

#[async_trait]
impl AgentExecutor for CliAgentBackend {
    async fn run(
        &self,
        request: &RunRequest,
        log_path: &Path,
        output_dir: &Path,
        cancel: watch::Receiver<bool>,
        sink: EventSink,
    ) -> Result<(), LaunchError> {
        std::fs::create_dir_all(output_dir).map_err(LaunchError::SpawnFailed)?;
        let mut log = WorkerLog::create(log_path).map_err(LaunchError::SpawnFailed)?;

        let supervisor = ProcessSupervisor::new(&self.agent_cmd)
            .arg("--flow")
            .arg(request.flow.as_str())
            .arg(request.card_path.display().to_string())
            .env("DECKHAND_CARD", request.card_path.display().to_string())
            .env("DECKHAND_FLOW", request.flow.as_str())
            .env("DECKHAND_RUN_ID", request.run_id.to_string())
            .env("DECKHAND_OUTPUT_DIR", output_dir.display().to_string())
            .current_dir(output_dir);

        let result = supervisor.run(&mut log, cancel, &sink).await;
        sink.finished(result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecEvent;
    use crate::run::{Flow, RunId, RunStatus};
    use chrono::Utc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn exposes_run_context_via_environment() {
        let dir = tempdir().unwrap();
        let request = RunRequest {
            run_id: RunId::new(),
            card_path: "board/phase-1-a/backlog/1.1-demo.md".into(),
            flow: Flow::Review,
            parallelizable: false,
            phase: Some("phase-1-a".into()),
            enqueued_at: Utc::now(),
        };

        let script = dir.path().join("agent.sh");
        std::fs::write(&script, "#!/bin/sh\necho \"DECKHAND_FLOW=$DECKHAND_FLOW\"\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let backend = CliAgentBackend::new(script.display().to_string());
        let (sink, mut rx) = EventSink::channel();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        backend
            .run(
                &request,
                &dir.path().join("run.jsonl"),
                &dir.path().join("out"),
                cancel_rx,
                sink,
            )
            .await
            .unwrap();

        let mut saw_flow = false;
        let mut terminal = None;
        while let Some(event) = rx.recv().await {
            match event {
                ExecEvent::Log { message } if message == "DECKHAND_FLOW=review" => {
                    saw_flow = true;
                }
                ExecEvent::Finished(result) => terminal = Some(result),
                _ => {}
            }
        }
        assert!(saw_flow, "worker did not see DECKHAND_FLOW");
        assert_eq!(terminal.unwrap().status, RunStatus::Succeeded);
    }
}
