//! Dev server child process - spawning with stdio capture
//!
//! A `DevServerProcess` owns nothing but channels; the `tokio::process::Child`
//! lives inside a waiter task so exit is observed exactly once. Output lines
//! are logged, buffered, and scanned for readiness markers.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use super::process::{signal_process_tree, StopSignal};
use crate::utils::strip_ansi;

/// Wait after a force kill before giving up on exit confirmation.
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(3);

/// Consecutive read errors after which an output reader gives up on its pipe.
const MAX_READ_ERRORS: u32 = 16;

// ─── Log Types ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// Sequential ID for polling (`GET /api/apps/:name/logs?since=<id>`)
    pub id: u64,
    pub timestamp: u64,
    pub source: LogSource,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Messages from the host itself
    System,
}

/// How the process ended.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExitSummary {
    pub code: Option<i32>,
    pub description: String,
}

// ─── Log Buffer ──────────────────────────────────────────────

/// Ring buffer that stores recent log lines with sequential IDs.
struct LogBuffer {
    lines: VecDeque<LogLine>,
    next_id: u64,
    max_size: usize,
}

impl LogBuffer {
    fn with_capacity(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            lines: VecDeque::with_capacity(max_size.min(4096)),
            next_id: 0,
            max_size,
        }
    }

    fn push(&mut self, source: LogSource, content: String) -> LogLine {
        let line = LogLine {
            id: self.next_id,
            timestamp: current_timestamp(),
            source,
            content,
        };
        self.next_id += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }

    /// All lines with id > `since_id`.
    fn get_since(&self, since_id: u64) -> Vec<LogLine> {
        self.lines.iter().filter(|l| l.id > since_id).cloned().collect()
    }

    fn get_recent(&self, count: usize) -> Vec<LogLine> {
        self.lines.iter().rev().take(count).rev().cloned().collect()
    }
}

// ─── Process ─────────────────────────────────────────────────

/// What to run for one dev server.
#[derive(Debug, Clone)]
pub struct DevCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

pub struct DevServerProcess {
    pub pid: u32,
    module: String,
    log_buffer: Arc<Mutex<LogBuffer>>,
    kill_tx: mpsc::Sender<()>,
    exit_rx: watch::Receiver<Option<ExitSummary>>,
}

impl DevServerProcess {
    /// Spawn the dev command inside `working_dir`.
    ///
    /// Returns the process and a receiver that fires with the first stdout
    /// line containing one of `ready_markers`.
    pub fn spawn(
        module: &str,
        command: &DevCommand,
        working_dir: &Path,
        ready_markers: &[String],
        log_capacity: usize,
    ) -> Result<(Self, oneshot::Receiver<String>)> {
        let mut cmd = TokioCommand::new(&command.program);
        cmd.args(&command.args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!("Failed to spawn '{}': {}", command.program, e)
        })?;

        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("Failed to get PID of spawned process"))?;

        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(4);
        let (exit_tx, exit_rx) = watch::channel::<Option<ExitSummary>>(None);
        let (ready_tx, ready_rx) = oneshot::channel::<String>();
        let log_buffer = Arc::new(Mutex::new(LogBuffer::with_capacity(log_capacity)));

        // ── stdout reader ────────────────────────────────────
        if let Some(stdout) = child.stdout.take() {
            let buf = log_buffer.clone();
            let name = module.to_string();
            let markers = ready_markers.to_vec();
            tokio::spawn(async move {
                let mut ready_tx = Some(ready_tx);
                let mut reader = BufReader::new(stdout);
                let mut raw = Vec::new();
                while let Some(line) = next_output_line(&mut reader, &mut raw, &name).await {
                    tracing::info!("[{}] {}", name, line);
                    let is_marker =
                        ready_tx.is_some() && markers.iter().any(|m| line.contains(m.as_str()));
                    buf.lock().await.push(LogSource::Stdout, line.clone());
                    if is_marker {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(line);
                        }
                    }
                }
            });
        }

        // ── stderr reader ────────────────────────────────────
        if let Some(stderr) = child.stderr.take() {
            let buf = log_buffer.clone();
            let name = module.to_string();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut raw = Vec::new();
                while let Some(line) = next_output_line(&mut reader, &mut raw, &name).await {
                    tracing::warn!("[{}] {}", name, line);
                    buf.lock().await.push(LogSource::Stderr, line);
                }
            });
        }

        // ── process waiter ───────────────────────────────────
        {
            let buf = log_buffer.clone();
            let name = module.to_string();
            tokio::spawn(async move {
                let wake = tokio::select! {
                    res = child.wait() => WaiterWake::Exited(res),
                    Some(()) = kill_rx.recv() => WaiterWake::KillRequested,
                };
                let res = match wake {
                    WaiterWake::Exited(res) => res,
                    WaiterWake::KillRequested => {
                        let _ = child.start_kill();
                        child.wait().await
                    }
                };
                let summary = match res {
                    Ok(status) => ExitSummary {
                        code: status.code(),
                        description: status.to_string(),
                    },
                    Err(e) => ExitSummary {
                        code: None,
                        description: format!("failed to wait for process: {}", e),
                    },
                };
                tracing::info!("Dev server for {} exited ({})", name, summary.description);
                buf.lock()
                    .await
                    .push(LogSource::System, format!("Process exited: {}", summary.description));
                let _ = exit_tx.send(Some(summary));
            });
        }

        Ok((
            Self {
                pid,
                module: module.to_string(),
                log_buffer,
                kill_tx,
                exit_rx,
            },
            ready_rx,
        ))
    }

    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit_summary(&self) -> Option<ExitSummary> {
        self.exit_rx.borrow().clone()
    }

    /// Resolve once the process has exited.
    pub async fn wait_for_exit(&self) -> ExitSummary {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(summary) = rx.borrow_and_update().clone() {
                return summary;
            }
            if rx.changed().await.is_err() {
                // waiter task gone without reporting
                return rx.borrow().clone().unwrap_or(ExitSummary {
                    code: None,
                    description: "exit status unknown".to_string(),
                });
            }
        }
    }

    /// Wait at most `timeout` for exit. Returns whether the process is gone.
    pub async fn wait_for_exit_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_for_exit()).await.is_ok()
    }

    /// Take the process down and wait for it.
    ///
    /// Without `force` the tree first gets a polite signal and `grace` to exit;
    /// a survivor (or `force`) is killed outright. Returns whether exit was
    /// confirmed.
    pub async fn terminate(&self, grace: Duration, force: bool) -> bool {
        if !self.is_running() {
            return true;
        }

        if !force {
            if let Err(e) = signal_process_tree(self.pid, StopSignal::Terminate) {
                tracing::warn!("[{}] {}", self.module, e);
            }
            if self.wait_for_exit_timeout(grace).await {
                return true;
            }
            tracing::warn!(
                "[{}] dev server (pid {}) ignored termination for {:?}, killing",
                self.module,
                self.pid,
                grace
            );
        }

        if let Err(e) = signal_process_tree(self.pid, StopSignal::Kill) {
            tracing::warn!("[{}] {}", self.module, e);
        }
        let _ = self.kill_tx.try_send(());

        let exited = self.wait_for_exit_timeout(KILL_CONFIRM_TIMEOUT).await;
        if !exited {
            tracing::error!("[{}] dev server (pid {}) did not exit after kill", self.module, self.pid);
        }
        exited
    }

    pub async fn get_console_since(&self, since_id: u64) -> Vec<LogLine> {
        self.log_buffer.lock().await.get_since(since_id)
    }

    pub async fn get_recent_console(&self, count: usize) -> Vec<LogLine> {
        self.log_buffer.lock().await.get_recent(count)
    }
}

enum WaiterWake {
    Exited(std::io::Result<std::process::ExitStatus>),
    KillRequested,
}

/// Next line of child output with the line ending and ANSI escapes removed.
/// Invalid UTF-8 is replaced rather than ending the stream, so the pipe keeps
/// being drained. `None` at end of stream.
async fn next_output_line<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    raw: &mut Vec<u8>,
    module: &str,
) -> Option<String> {
    let mut errors = 0;
    loop {
        raw.clear();
        match reader.read_until(b'\n', raw).await {
            Ok(0) => return None,
            Ok(_) => {
                while matches!(raw.last(), Some(b'\n' | b'\r')) {
                    raw.pop();
                }
                return Some(strip_ansi(&String::from_utf8_lossy(raw)).into_owned());
            }
            Err(e) => {
                errors += 1;
                tracing::warn!("[{}] failed to read output: {}", module, e);
                if errors >= MAX_READ_ERRORS {
                    return None;
                }
            }
        }
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ─── Tests ───────────────────────────────────────────────────
