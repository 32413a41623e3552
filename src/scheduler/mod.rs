//! The run scheduler: a single-owner actor that admits, dispatches,
//! retries and cancels agent runs.
//!
//! All mutable state (queue, card locks, phase locks, retry timers) lives
//! inside one task; the public [`RunScheduler`] handle talks to it over a
//! command channel and completion results arrive on a second channel, so
//! there is no shared-state locking anywhere in the scheduling path.

pub mod backoff;
pub mod events;
pub mod launcher;

use crate::card::CardStore;
use crate::errors::SchedulerError;
use crate::lifecycle::RunLifecycleCoordinator;
use crate::run::{Flow, RunId, RunRequest, RunStatus, WorkerRunResult};
use backoff::BackoffPolicy;
use chrono::Utc;
use events::{EventBus, SchedulerEvent};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Terminal report for one launched run.
#[derive(Debug)]
pub struct RunCompletion {
    pub run_id: RunId,
    pub result: WorkerRunResult,
}

pub type CompletionSender = mpsc::UnboundedSender<RunCompletion>;

/// Starts and cancels the actual run execution. The scheduler owns the
/// policy; the launcher owns the mechanics.
pub trait RunLauncher: Send + Sync {
    /// Begin executing `request`. Must eventually deliver exactly one
    /// [`RunCompletion`] for the run id, unless this call returns an error.
    fn launch(
        &self,
        request: &RunRequest,
        attempt: u32,
        completions: CompletionSender,
    ) -> Result<(), crate::errors::LaunchError>;

    /// Ask a launched run to stop. Best effort; completion may still
    /// arrive and will be ignored by the scheduler.
    fn cancel(&self, run_id: RunId);
}

/// Scheduling limits and retry policy.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    /// Per-flow concurrency caps. Flows without an entry default to
    /// `max_concurrent`.
    pub flow_limits: HashMap<Flow, usize>,
    /// Queue depth at which admission starts carrying a backpressure
    /// notice.
    pub soft_limit: usize,
    /// Queue depth at which admission is refused outright.
    pub hard_limit: usize,
    pub backoff: BackoffPolicy,
    /// Lock records older than this are treated as leftovers from a
    /// crashed process.
    pub stale_lock_timeout: Duration,
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            flow_limits: HashMap::new(),
            soft_limit: 16,
            hard_limit: 64,
            backoff: BackoffPolicy::default(),
            stale_lock_timeout: Duration::from_secs(30 * 60),
            event_capacity: 256,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrent(mut self, limit: usize) -> Self {
        self.max_concurrent = limit.max(1);
        self
    }

    pub fn with_flow_limit(mut self, flow: Flow, limit: usize) -> Self {
        self.flow_limits.insert(flow, limit.max(1));
        self
    }

    pub fn with_queue_limits(mut self, soft: usize, hard: usize) -> Self {
        self.soft_limit = soft;
        self.hard_limit = hard.max(soft);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_stale_lock_timeout(mut self, timeout: Duration) -> Self {
        self.stale_lock_timeout = timeout;
        self
    }

    fn flow_limit(&self, flow: Flow) -> usize {
        self.flow_limits
            .get(&flow)
            .copied()
            .unwrap_or(self.max_concurrent)
    }
}

/// Outcome of an enqueue request.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Enqueued {
        run_id: RunId,
        /// 1-based queue depth at admission time.
        position: usize,
        backpressure: Option<BackpressureNotice>,
    },
    /// The card already has a live run (in this process or, judging by a
    /// fresh lock record, in another one).
    AlreadyRunning { run_id: RunId },
    /// Queue is at the hard limit; try again later.
    Deferred { depth: usize, limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackpressureNotice {
    pub depth: usize,
    pub limit: usize,
}

/// Point-in-time view of scheduler state, card and phase locks included.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub queued: Vec<RunEntry>,
    pub running: Vec<RunEntry>,
    pub pending_retries: Vec<RunEntry>,
    /// Every card currently holding a run lock (queued, running, or
    /// waiting out a backoff window). At most one entry per card.
    pub locked_cards: Vec<CardLockEntry>,
    pub phase_locks: Vec<PhaseLockEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CardLockEntry {
    pub card_path: PathBuf,
    pub run_id: RunId,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseLockEntry {
    pub phase: String,
    pub flow: Flow,
    pub run_id: RunId,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunEntry {
    pub run_id: RunId,
    pub card_path: PathBuf,
    pub flow: Flow,
    pub attempt: u32,
}

enum Command {
    Enqueue {
        card_path: PathBuf,
        flow: Flow,
        reply: oneshot::Sender<Result<Admission, SchedulerError>>,
    },
    Cancel {
        run_id: RunId,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SchedulerSnapshot>,
    },
    RetryFire {
        card_path: PathBuf,
    },
}

/// Public handle. Cloneable; dropping every clone shuts the actor down
/// once in-flight completions drain.
#[derive(Clone)]
pub struct RunScheduler {
    tx: mpsc::UnboundedSender<Command>,
    bus: EventBus,
}

impl RunScheduler {
    pub fn spawn(
        config: SchedulerConfig,
        store: CardStore,
        lifecycle: RunLifecycleCoordinator,
        launcher: Arc<dyn RunLauncher>,
    ) -> Self {
        let bus = EventBus::new(config.event_capacity);
        let (tx, rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            config,
            store,
            lifecycle,
            launcher,
            bus: bus.clone(),
            commands: rx,
            command_tx: tx.clone(),
            completions: completion_rx,
            completion_tx,
            queue: Vec::new(),
            running: HashMap::new(),
            card_locks: HashMap::new(),
            phase_locks: HashMap::new(),
            retries: HashMap::new(),
            canceled_inflight: HashSet::new(),
        };
        tokio::spawn(actor.run());
        Self { tx, bus }
    }

    pub async fn enqueue(
        &self,
        card_path: impl Into<PathBuf>,
        flow: Flow,
    ) -> Result<Admission, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Enqueue {
                card_path: card_path.into(),
                flow,
                reply,
            })
            .map_err(|_| SchedulerError::Closed)?;
        rx.await.map_err(|_| SchedulerError::Closed)?
    }

    pub async fn cancel(&self, run_id: RunId) -> Result<(), SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Cancel { run_id, reply })
            .map_err(|_| SchedulerError::Closed)?;
        rx.await.map_err(|_| SchedulerError::Closed)?
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .map_err(|_| SchedulerError::Closed)?;
        rx.await.map_err(|_| SchedulerError::Closed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.bus.subscribe()
    }

    pub fn event_history(&self) -> Vec<SchedulerEvent> {
        self.bus.history()
    }
}

struct QueuedRun {
    request: RunRequest,
    attempt: u32,
}

struct ActiveRun {
    request: RunRequest,
    attempt: u32,
}

struct PendingRetry {
    request: RunRequest,
    attempt: u32,
    timer: JoinHandle<()>,
}

struct Actor {
    config: SchedulerConfig,
    store: CardStore,
    lifecycle: RunLifecycleCoordinator,
    launcher: Arc<dyn RunLauncher>,
    bus: EventBus,
    commands: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    completions: mpsc::UnboundedReceiver<RunCompletion>,
    completion_tx: CompletionSender,
    queue: Vec<QueuedRun>,
    running: HashMap<RunId, ActiveRun>,
    card_locks: HashMap<PathBuf, RunId>,
    phase_locks: HashMap<(String, Flow), RunId>,
    retries: HashMap<PathBuf, PendingRetry>,
    /// Runs canceled while executing; their eventual completion is dropped.
    canceled_inflight: HashSet<RunId>,
}

impl Actor {
    async fn run(mut self) {
        self.sweep_stale_locks();
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                completion = self.completions.recv() => {
                    // The actor holds a sender clone, so this never closes.
                    if let Some(completion) = completion {
                        self.handle_completion(completion);
                    }
                }
            }
        }
        tracing::debug!("scheduler actor stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Enqueue {
                card_path,
                flow,
                reply,
            } => {
                let result = self.enqueue(card_path, flow);
                let _ = reply.send(result);
                self.dispatch();
            }
            Command::Cancel { run_id, reply } => {
                let result = self.cancel(run_id);
                let _ = reply.send(result);
                self.dispatch();
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::RetryFire { card_path } => {
                self.retry_fire(&card_path);
                self.dispatch();
            }
        }
    }

    /// Startup recovery: lock records with no live owner. Fresh ones are
    /// kept (another process may own them); stale ones are cleared and the
    /// card is marked failed so it shows up for operators.
    fn sweep_stale_locks(&mut self) {
        let records = match self.lifecycle.load_lock_records() {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(%err, "lock sweep failed");
                return;
            }
        };
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.config.stale_lock_timeout)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        for record in records {
            if record.age(now) <= timeout {
                continue;
            }
            tracing::warn!(
                card = %record.card_path.display(),
                run_id = %record.run_id,
                "recovering stale run lock"
            );
            if let Err(err) = self.lifecycle.mark_finished(
                &record.card_path,
                record.flow,
                RunStatus::Failed,
                "stale lock recovered at startup",
            ) {
                tracing::warn!(%err, "stale lock recovery write failed");
                let _ = self.lifecycle.remove_record(&record.card_path);
            }
        }
    }

    fn enqueue(&mut self, card_path: PathBuf, flow: Flow) -> Result<Admission, SchedulerError> {
        // Duplicate admission is answered, not queued.
        if let Some(run_id) = self.card_locks.get(&card_path) {
            return Ok(Admission::AlreadyRunning { run_id: *run_id });
        }

        // A lock record without in-memory state belongs to a previous or
        // concurrent process. Fresh: respect it. Stale: reclaim lazily.
        if let Some(record) = self.lifecycle.record_for(&card_path) {
            let timeout = chrono::Duration::from_std(self.config.stale_lock_timeout)
                .unwrap_or_else(|_| chrono::Duration::minutes(30));
            if record.age(Utc::now()) <= timeout {
                return Ok(Admission::AlreadyRunning {
                    run_id: record.run_id,
                });
            }
            tracing::warn!(card = %card_path.display(), "reclaiming stale run lock");
            self.lifecycle.remove_record(&card_path)?;
        }

        let depth = self.queue.len();
        if depth >= self.config.hard_limit {
            self.bus.emit(SchedulerEvent::Deferred {
                card_path,
                depth,
                limit: self.config.hard_limit,
            });
            return Ok(Admission::Deferred {
                depth,
                limit: self.config.hard_limit,
            });
        }

        let snapshot = self.store.load_snapshot(&card_path)?;
        let parallelizable = snapshot.document.parallelizable();
        let phase = crate::board::phase_for_path(&card_path);

        let request = RunRequest {
            run_id: RunId::new(),
            card_path: card_path.clone(),
            flow,
            parallelizable,
            phase,
            enqueued_at: Utc::now(),
        };
        let run_id = request.run_id;

        self.lifecycle.mark_queued(&card_path, run_id, flow)?;
        self.card_locks.insert(card_path.clone(), run_id);
        self.queue.push(QueuedRun {
            request,
            attempt: 1,
        });

        let position = self.queue.len();
        self.bus.emit(SchedulerEvent::Enqueued {
            run_id,
            card_path,
            flow,
            position,
        });

        let backpressure = if position >= self.config.soft_limit {
            let notice = BackpressureNotice {
                depth: position,
                limit: self.config.soft_limit,
            };
            self.bus.emit(SchedulerEvent::BackpressureSoft {
                depth: notice.depth,
                limit: notice.limit,
            });
            Some(notice)
        } else {
            None
        };

        Ok(Admission::Enqueued {
            run_id,
            position,
            backpressure,
        })
    }

    /// Launch every eligible queued run, oldest admission first, until a
    /// limit binds.
    fn dispatch(&mut self) {
        while self.running.len() < self.config.max_concurrent {
            let Some(index) = self.next_eligible() else {
                break;
            };
            let queued = self.queue.remove(index);
            self.launch(queued);
        }
    }

    fn next_eligible(&self) -> Option<usize> {
        let mut best: Option<(usize, chrono::DateTime<Utc>)> = None;
        for (index, queued) in self.queue.iter().enumerate() {
            let request = &queued.request;
            if self.running_for_flow(request.flow) >= self.config.flow_limit(request.flow) {
                continue;
            }
            if let Some(key) = phase_key(request) {
                if self.phase_locks.contains_key(&key) {
                    continue;
                }
            }
            match best {
                Some((_, at)) if request.enqueued_at >= at => {}
                _ => best = Some((index, request.enqueued_at)),
            }
        }
        best.map(|(index, _)| index)
    }

    fn running_for_flow(&self, flow: Flow) -> usize {
        self.running
            .values()
            .filter(|active| active.request.flow == flow)
            .count()
    }

    fn launch(&mut self, queued: QueuedRun) {
        let QueuedRun { request, attempt } = queued;
        let run_id = request.run_id;

        if let Some(key) = phase_key(&request) {
            self.phase_locks.insert(key, run_id);
        }

        // A failed status write must not strand an otherwise healthy run.
        if let Err(err) = self
            .lifecycle
            .mark_running(&request.card_path, request.flow, attempt)
        {
            tracing::warn!(card = %request.card_path.display(), %err, "mark running failed");
        }

        self.bus.emit(SchedulerEvent::Started {
            run_id,
            card_path: request.card_path.clone(),
            flow: request.flow,
            attempt,
        });

        match self
            .launcher
            .launch(&request, attempt, self.completion_tx.clone())
        {
            Ok(()) => {
                self.running.insert(run_id, ActiveRun { request, attempt });
            }
            Err(err) => {
                tracing::error!(card = %request.card_path.display(), %err, "launch failed");
                // Same path as a runtime failure, completion included.
                self.running.insert(
                    run_id,
                    ActiveRun {
                        request,
                        attempt,
                    },
                );
                self.handle_completion(RunCompletion {
                    run_id,
                    result: WorkerRunResult::failed(None, format!("launch failed: {err}")),
                });
            }
        }
    }

    fn handle_completion(&mut self, completion: RunCompletion) {
        let RunCompletion { run_id, result } = completion;

        if self.canceled_inflight.remove(&run_id) {
            tracing::debug!(%run_id, "dropping completion of canceled run");
            return;
        }
        let Some(active) = self.running.remove(&run_id) else {
            tracing::warn!(%run_id, "completion for unknown run");
            return;
        };
        self.release_phase_lock(&active.request);

        match result.status {
            RunStatus::Succeeded | RunStatus::Canceled => {
                self.finish(&active, result.status, &result.summary);
            }
            RunStatus::Failed => self.handle_failure(active, result),
        }
        self.dispatch();
    }

    fn handle_failure(&mut self, active: ActiveRun, result: WorkerRunResult) {
        let card_path = active.request.card_path.clone();
        let attempt = active.attempt;

        if attempt >= self.config.backoff.max_attempts {
            tracing::warn!(
                card = %card_path.display(),
                attempt,
                "run abandoned after final attempt"
            );
            self.finish(&active, RunStatus::Failed, &result.summary);
            return;
        }

        let next_attempt = attempt + 1;
        let delay = self.config.backoff.delay_for(attempt);
        let delay_ms = delay.as_millis() as u64;

        if let Err(err) = self.lifecycle.mark_retrying(
            &card_path,
            active.request.flow,
            next_attempt,
            delay_ms,
        ) {
            tracing::warn!(card = %card_path.display(), %err, "mark retrying failed");
        }
        self.bus.emit(SchedulerEvent::RetryScheduled {
            run_id: active.request.run_id,
            card_path: card_path.clone(),
            attempt: next_attempt,
            delay_ms,
        });

        let command_tx = self.command_tx.clone();
        let timer_path = card_path.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = command_tx.send(Command::RetryFire {
                card_path: timer_path,
            });
        });
        // Card lock stays held across the backoff window.
        self.retries.insert(
            card_path,
            PendingRetry {
                request: active.request,
                attempt: next_attempt,
                timer,
            },
        );
    }

    fn retry_fire(&mut self, card_path: &Path) {
        let Some(retry) = self.retries.remove(card_path) else {
            return;
        };
        self.queue.push(QueuedRun {
            request: retry.request,
            attempt: retry.attempt,
        });
    }

    fn cancel(&mut self, run_id: RunId) -> Result<(), SchedulerError> {
        // Running: kill, release synchronously, ignore the late completion.
        if let Some(active) = self.running.remove(&run_id) {
            self.launcher.cancel(run_id);
            self.canceled_inflight.insert(run_id);
            self.release_phase_lock(&active.request);
            self.finish(&active, RunStatus::Canceled, "canceled by operator");
            return Ok(());
        }

        // Still queued.
        if let Some(index) = self
            .queue
            .iter()
            .position(|queued| queued.request.run_id == run_id)
        {
            let queued = self.queue.remove(index);
            let active = ActiveRun {
                request: queued.request,
                attempt: queued.attempt,
            };
            self.finish(&active, RunStatus::Canceled, "canceled while queued");
            return Ok(());
        }

        // Waiting out a backoff window.
        if let Some(card_path) = self
            .retries
            .iter()
            .find(|(_, retry)| retry.request.run_id == run_id)
            .map(|(path, _)| path.clone())
        {
            if let Some(retry) = self.retries.remove(&card_path) {
                retry.timer.abort();
                let active = ActiveRun {
                    request: retry.request,
                    attempt: retry.attempt,
                };
                self.finish(&active, RunStatus::Canceled, "canceled during backoff");
            }
            return Ok(());
        }

        Err(SchedulerError::UnknownRun(run_id))
    }

    /// Terminal bookkeeping shared by success, abandonment and
    /// cancellation: card lock released, lifecycle and event bus told
    /// exactly once.
    fn finish(&mut self, active: &ActiveRun, status: RunStatus, summary: &str) {
        let card_path = &active.request.card_path;
        self.card_locks.remove(card_path);
        if let Err(err) =
            self.lifecycle
                .mark_finished(card_path, active.request.flow, status, summary)
        {
            tracing::warn!(card = %card_path.display(), %err, "mark finished failed");
            let _ = self.lifecycle.remove_record(card_path);
        }
        self.bus.emit(SchedulerEvent::Finished {
            run_id: active.request.run_id,
            card_path: card_path.clone(),
            status,
        });
    }

    fn release_phase_lock(&mut self, request: &RunRequest) {
        if let Some(key) = phase_key(request) {
            if self.phase_locks.get(&key) == Some(&request.run_id) {
                self.phase_locks.remove(&key);
            }
        }
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        let entry = |request: &RunRequest, attempt: u32| RunEntry {
            run_id: request.run_id,
            card_path: request.card_path.clone(),
            flow: request.flow,
            attempt,
        };
        let mut locked_cards: Vec<CardLockEntry> = self
            .card_locks
            .iter()
            .map(|(card_path, run_id)| CardLockEntry {
                card_path: card_path.clone(),
                run_id: *run_id,
            })
            .collect();
        locked_cards.sort_by(|a, b| a.card_path.cmp(&b.card_path));
        let mut phase_locks: Vec<PhaseLockEntry> = self
            .phase_locks
            .iter()
            .map(|((phase, flow), run_id)| PhaseLockEntry {
                phase: phase.clone(),
                flow: *flow,
                run_id: *run_id,
            })
            .collect();
        phase_locks.sort_by(|a, b| a.phase.cmp(&b.phase));
        SchedulerSnapshot {
            queued: self
                .queue
                .iter()
                .map(|q| entry(&q.request, q.attempt))
                .collect(),
            running: self
                .running
                .values()
                .map(|a| entry(&a.request, a.attempt))
                .collect(),
            pending_retries: self
                .retries
                .values()
                .map(|r| entry(&r.request, r.attempt))
                .collect(),
            locked_cards,
            phase_locks,
        }
    }
}

/// Non-parallelizable runs serialize per (phase, flow).
fn phase_key(request: &RunRequest) -> Option<(String, Flow)> {
    if request.parallelizable {
        return None;
    }
    request
        .phase
        .as_ref()
        .map(|phase| (phase.clone(), request.flow))
}
