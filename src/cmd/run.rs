//! `deckhand run`: enqueue one card and follow the run to completion.

use crate::card::CardStore;
use crate::config::Config;
use crate::executor::ExecutorRegistry;
use crate::lifecycle::RunLifecycleCoordinator;
use crate::run::{Flow, RunStatus};
use crate::scheduler::events::SchedulerEvent;
use crate::scheduler::launcher::AgentLauncher;
use crate::scheduler::{Admission, RunScheduler, SchedulerConfig};
use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::sync::Arc;

pub async fn cmd_run(config: &Config, card: PathBuf, flow: &str) -> Result<()> {
    let flow: Flow = flow.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let card = card
        .canonicalize()
        .with_context(|| format!("card not found: {}", card.display()))?;
    config.ensure_directories()?;

    let store = CardStore::new();
    let lifecycle = RunLifecycleCoordinator::new(store.clone(), config.locks_dir.clone());
    let registry = Arc::new(ExecutorRegistry::with_cli_backend(config.agent_cmd.clone()));
    let launcher = Arc::new(AgentLauncher::new(
        registry,
        config.logs_dir.clone(),
        config.runs_dir.clone(),
    ));
    let scheduler = RunScheduler::spawn(SchedulerConfig::default(), store, lifecycle, launcher);

    let mut events = scheduler.subscribe();
    let run_id = match scheduler.enqueue(&card, flow).await? {
        Admission::Enqueued {
            run_id,
            position,
            backpressure,
        } => {
            println!("run {} enqueued at position {position}", run_id.short());
            if let Some(notice) = backpressure {
                println!(
                    "warning: queue depth {} at or past soft limit {}",
                    notice.depth, notice.limit
                );
            }
            run_id
        }
        Admission::AlreadyRunning { run_id } => {
            bail!("card already has an active run ({})", run_id.short());
        }
        Admission::Deferred { depth, limit } => {
            bail!("queue is full ({depth}/{limit}); try again later");
        }
    };

    loop {
        let event = events.recv().await.context("scheduler stopped")?;
        match event {
            SchedulerEvent::Started { run_id: id, attempt, .. } if id == run_id => {
                if attempt > 1 {
                    println!("run {} started (attempt {attempt})", run_id.short());
                } else {
                    println!("run {} started", run_id.short());
                }
            }
            SchedulerEvent::RetryScheduled {
                run_id: id,
                attempt,
                delay_ms,
                ..
            } if id == run_id => {
                println!(
                    "run {} failed, retry {attempt} in {delay_ms}ms",
                    run_id.short()
                );
            }
            SchedulerEvent::Finished { run_id: id, status, .. } if id == run_id => {
                println!("run {} {status}", run_id.short());
                if status == RunStatus::Failed {
                    bail!("run failed; see {}", config.logs_dir.display());
                }
                return Ok(());
            }
            _ => {}
        }
    }
}
