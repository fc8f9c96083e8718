//! Dev server launcher: spawns one child per start request and decides when
//! it is ready, failed, or too slow.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use super::dev_process::{DevCommand, DevServerProcess};
use super::error::{SupervisorError, SupervisorResult};
use super::port::is_port_in_use;
use super::state_machine::{LaunchState, StateMachine};
use crate::config::{DevServerConfig, HostConfig};

/// How readiness was established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadySignal {
    /// A readiness marker appeared on stdout
    LogMarker(String),
    /// The assigned port accepted a TCP connection
    PortOpen,
}

/// A spawned dev server that has not reported readiness yet.
pub struct PendingLaunch {
    pub module: String,
    pub port: u16,
    pub process: Arc<DevServerProcess>,
    ready_rx: oneshot::Receiver<String>,
    machine: StateMachine,
}

#[derive(Clone)]
pub struct DevServerLauncher {
    dev_server: DevServerConfig,
    start_timeout: Duration,
    probe_port: bool,
    probe_interval: Duration,
    log_capacity: usize,
}

impl DevServerLauncher {
    pub fn new(cfg: &HostConfig) -> Self {
        Self {
            dev_server: cfg.dev_server.clone(),
            start_timeout: cfg.start_timeout(),
            probe_port: cfg.probe_port,
            probe_interval: cfg.probe_interval(),
            log_capacity: cfg.log_buffer_lines,
        }
    }

    /// The command line for a dev server bound to `port` on all interfaces.
    pub fn command_for(&self, port: u16) -> DevCommand {
        let port_str = port.to_string();
        DevCommand {
            program: self.dev_server.program.clone(),
            args: self
                .dev_server
                .args
                .iter()
                .map(|a| a.replace("{port}", &port_str))
                .collect(),
            env: vec![
                ("FORCE_COLOR".to_string(), "0".to_string()),
                ("NO_COLOR".to_string(), "1".to_string()),
                ("PORT".to_string(), port_str),
            ],
        }
    }

    /// Spawning -> Starting. Fails with `SpawnError` if the OS refuses.
    pub fn spawn(&self, module: &str, dir: &Path, port: u16) -> SupervisorResult<PendingLaunch> {
        let mut machine = StateMachine::new(module);
        let command = self.command_for(port);
        tracing::info!(
            "Starting dev server for {} on port {}: {} {}",
            module,
            port,
            command.program,
            command.args.join(" ")
        );

        match DevServerProcess::spawn(
            module,
            &command,
            dir,
            &self.dev_server.ready_markers,
            self.log_capacity,
        ) {
            Ok((process, ready_rx)) => {
                advance(&mut machine, LaunchState::Starting);
                Ok(PendingLaunch {
                    module: module.to_string(),
                    port,
                    process: Arc::new(process),
                    ready_rx,
                    machine,
                })
            }
            Err(e) => {
                advance(&mut machine, LaunchState::Failed);
                Err(SupervisorError::SpawnError {
                    module: module.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Starting -> Ready | Failed | TimedOut.
    ///
    /// A timed-out child is left running; the caller unregisters it and then
    /// terminates it.
    pub async fn wait_ready(&self, pending: PendingLaunch) -> SupervisorResult<ReadySignal> {
        let PendingLaunch {
            module,
            port,
            process,
            ready_rx,
            mut machine,
        } = pending;

        let probe = self.probe_port;
        let interval = self.probe_interval;
        let outcome = tokio::time::timeout(self.start_timeout, async {
            tokio::select! {
                Ok(line) = ready_rx => Ok(ReadySignal::LogMarker(line)),
                _ = wait_for_port(port, interval), if probe => Ok(ReadySignal::PortOpen),
                summary = process.wait_for_exit() => Err(summary),
            }
        })
        .await;

        match outcome {
            Ok(Ok(signal)) => {
                advance(&mut machine, LaunchState::Ready);
                tracing::info!("Dev server for {} ready on port {} ({:?})", module, port, signal);
                Ok(signal)
            }
            Ok(Err(summary)) => {
                advance(&mut machine, LaunchState::Failed);
                Err(SupervisorError::SpawnError {
                    module,
                    reason: format!("process exited before becoming ready ({})", summary.description),
                })
            }
            Err(_) => {
                advance(&mut machine, LaunchState::TimedOut);
                tracing::warn!("Dev server for {} not ready after {:?}", module, self.start_timeout);
                Err(SupervisorError::StartTimeout {
                    module,
                    secs: self.start_timeout.as_secs(),
                })
            }
        }
    }
}

fn advance(machine: &mut StateMachine, to: LaunchState) {
    if let Err(e) = machine.transition(to) {
        tracing::error!("{}", e);
    }
}

async fn wait_for_port(port: u16, interval: Duration) {
    loop {
        if is_port_in_use(port).await {
            return;
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launcher_with(program: &str, args: &[&str], timeout_secs: u64, probe: bool) -> DevServerLauncher {
        let mut cfg = HostConfig::default();
        cfg.dev_server.program = program.to_string();
        cfg.dev_server.args = args.iter().map(|s| s.to_string()).collect();
        cfg.start_timeout_secs = timeout_secs;
        cfg.probe_port = probe;
        cfg.stop_grace_secs = 1;
        DevServerLauncher::new(&cfg)
    }

    #[test]
    fn test_command_substitutes_port() {
        let launcher = DevServerLauncher::new(&HostConfig::default());
        let cmd = launcher.command_for(5180);
        assert_eq!(cmd.args, vec!["run", "dev", "--", "--port", "5180", "--host"]);
        assert!(cmd.env.contains(&("FORCE_COLOR".to_string(), "0".to_string())));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let launcher = launcher_with("no-such-dev-server-tool", &[], 5, false);
        let res = launcher.spawn("ghost", dir.path(), 5999);
        assert!(matches!(res, Err(SupervisorError::SpawnError { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_log_marker_readiness() {
        let dir = tempfile::TempDir::new().unwrap();
        let launcher = launcher_with("sh", &["-c", "echo '  VITE ready in 120 ms'; sleep 30"], 5, false);
        let pending = launcher.spawn("app", dir.path(), 6001).unwrap();
        let process = pending.process.clone();
        let signal = launcher.wait_ready(pending).await.unwrap();
        assert_eq!(signal, ReadySignal::LogMarker("  VITE ready in 120 ms".to_string()));
        process.terminate(Duration::from_secs(1), true).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_is_spawn_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let launcher = launcher_with("sh", &["-c", "exit 1"], 5, true);
        let pending = launcher.spawn("broken", dir.path(), 6002).unwrap();
        let res = launcher.wait_ready(pending).await;
        assert!(matches!(res, Err(SupervisorError::SpawnError { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_leaves_child_to_caller() {
        let dir = tempfile::TempDir::new().unwrap();
        let launcher = launcher_with("sh", &["-c", "echo compiling; sleep 30"], 1, false);
        let pending = launcher.spawn("slow", dir.path(), 6003).unwrap();
        let process = pending.process.clone();
        let res = launcher.wait_ready(pending).await;
        assert!(matches!(res, Err(SupervisorError::StartTimeout { secs: 1, .. })));
        assert!(process.is_running());
        assert!(process.terminate(Duration::from_secs(1), false).await);
    }

    #[tokio::test]
    async fn test_port_probe_readiness() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(tokio::time::timeout(Duration::from_secs(2), wait_for_port(port, Duration::from_millis(10)))
            .await
            .is_ok());
    }
}
