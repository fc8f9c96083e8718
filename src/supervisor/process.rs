use anyhow::Result;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to signal process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },
}

/// Signal strength used when taking down a dev server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM on Unix, a tree taskkill without /F on Windows
    Terminate,
    /// SIGKILL on Unix, `taskkill /F` on Windows
    Kill,
}

/// Signal the whole process tree rooted at `pid`.
///
/// Dev servers are spawned in their own process group (Unix), so the signal
/// reaches the package manager wrapper and the server it forked. A process
/// that is already gone is not an error.
pub fn signal_process_tree(pid: u32, signal: StopSignal) -> Result<(), ProcessError> {
    tracing::debug!("Sending {:?} to process tree {}", signal, pid);

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let sig = match signal {
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        };
        match killpg(Pid::from_raw(pid as i32), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ProcessError::SignalFailed {
                pid,
                reason: e.to_string(),
            }),
        }
    }

    #[cfg(not(unix))]
    {
        let mut args = vec!["/T".to_string(), "/PID".to_string(), pid.to_string()];
        if signal == StopSignal::Kill {
            args.insert(0, "/F".to_string());
        }
        force_taskkill(&args).map_err(|e| ProcessError::SignalFailed {
            pid,
            reason: e.to_string(),
        })
    }
}

#[cfg(not(unix))]
fn force_taskkill(args: &[String]) -> Result<()> {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    std::process::Command::new("taskkill")
        .args(args)
        .creation_flags(CREATE_NO_WINDOW)
        .output()
        .map_err(|e| anyhow::anyhow!("Failed to run taskkill {:?}: {}", args, e))?;
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_signal_missing_process_is_ok() {
        // pid above the kernel maximum (2^22)
        assert!(signal_process_tree(5_000_000, StopSignal::Terminate).is_ok());
    }

    #[tokio::test]
    async fn test_kill_process_group() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "sleep 30"])
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        signal_process_tree(pid, StopSignal::Kill).unwrap();
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .expect("child should exit after SIGKILL")
            .unwrap();
        assert!(!status.success());
    }
}
