//! Child process supervision for CLI agent workers.
//!
//! The supervisor owns the full lifetime of one worker process: spawn,
//! stream its stdout line by line, decode JSON progress where present,
//! honor cancellation by killing the child, and always produce exactly one
//! [`WorkerRunResult`].

use crate::executor::{EventSink, WorkerLog};
use crate::run::WorkerRunResult;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

/// Builder for one supervised worker invocation.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    program: String,
    args: Vec<String>,
    envs: HashMap<String, String>,
    cwd: Option<PathBuf>,
}

impl ProcessSupervisor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: HashMap::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Run the worker to completion. Never returns an error: spawn
    /// failures and kills are folded into the returned result, and the
    /// terminal entry is always appended to the log.
    pub async fn run(
        &self,
        log: &mut WorkerLog,
        mut cancel: watch::Receiver<bool>,
        sink: &EventSink,
    ) -> WorkerRunResult {
        let started = Instant::now();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let message = format!("failed to spawn {}: {err}", self.program);
                tracing::error!(program = %self.program, %err, "worker spawn failed");
                log.log(&message);
                let mut result = WorkerRunResult::failed(None, message);
                result.duration_ms = started.elapsed().as_millis() as u64;
                result.bytes_written = log.bytes_written();
                log.worker_finished(&result);
                return result;
            }
        };

        log.worker_ready();
        sink.log(format!("worker started: {}", self.program));

        let stdout = child.stdout.take();
        let mut lines = stdout.map(|out| BufReader::new(out).lines());

        let mut bytes_read: u64 = 0;
        let mut summary: Option<String> = None;
        let mut killed = false;
        let mut cancel_open = true;

        loop {
            tokio::select! {
                line = next_line(&mut lines) => {
                    match line {
                        Some(line) => {
                            bytes_read += line.len() as u64 + 1;
                            self.handle_line(&line, log, sink, &mut summary);
                        }
                        None => break,
                    }
                }
                changed = cancel.changed(), if cancel_open => {
                    // A closed sender means no cancellation can arrive.
                    cancel_open = changed.is_ok();
                    if *cancel.borrow() {
                        if let Err(err) = child.kill().await {
                            tracing::warn!(%err, "failed to kill worker");
                        }
                        killed = true;
                        break;
                    }
                }
            }
        }

        let status = child.wait().await;

        let mut result = if killed {
            WorkerRunResult::canceled()
        } else {
            match status {
                Ok(status) if status.success() => {
                    WorkerRunResult::succeeded(summary.unwrap_or_else(|| "worker completed".into()))
                }
                Ok(status) => {
                    let code = status.code();
                    WorkerRunResult::failed(
                        code,
                        summary.unwrap_or_else(|| match code {
                            Some(code) => format!("worker exited with code {code}"),
                            None => "worker terminated by signal".to_string(),
                        }),
                    )
                }
                Err(err) => WorkerRunResult::failed(None, format!("wait failed: {err}")),
            }
        };
        result.duration_ms = started.elapsed().as_millis() as u64;
        result.bytes_read = bytes_read;

        log.worker_finished(&result);
        result.bytes_written = log.bytes_written();
        result
    }

    /// One stdout line. Structured lines carry a `type` (or legacy `event`)
    /// discriminator; anything else is forwarded verbatim as a log line.
    fn handle_line(
        &self,
        line: &str,
        log: &mut WorkerLog,
        sink: &EventSink,
        summary: &mut Option<String>,
    ) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }

        let value: serde_json::Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(_) => {
                log.log(trimmed);
                sink.log(trimmed);
                return;
            }
        };

        let kind = value["type"]
            .as_str()
            .or_else(|| value["event"].as_str())
            .unwrap_or("");
        match kind {
            "progress" => {
                let fraction = value["fraction"]
                    .as_f64()
                    .or_else(|| value["percent"].as_f64().map(|p| p / 100.0))
                    .unwrap_or(0.0);
                let message = value["message"].as_str().map(str::to_string);
                log.progress((fraction * 100.0).round() as u8, message.as_deref());
                sink.progress(fraction, message);
            }
            "log" => {
                let message = value["message"].as_str().unwrap_or(trimmed);
                log.log(message);
                sink.log(message);
            }
            "result" => {
                if let Some(text) = value["summary"].as_str().or_else(|| value["result"].as_str())
                {
                    *summary = Some(text.to_string());
                }
            }
            _ => {
                log.log(trimmed);
                sink.log(trimmed);
            }
        }
    }
}

async fn next_line(
    lines: &mut Option<tokio::io::Lines<BufReader<tokio::process::ChildStdout>>>,
) -> Option<String> {
    match lines {
        Some(lines) => match lines.next_line().await {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(%err, "worker stdout read failed");
                None
            }
        },
        None => None,
    }
}
