//! Dependency install and build for uploaded Node projects.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::config::InstallerConfig;
use crate::utils::apply_creation_flags;

/// Lines of stderr kept when a step fails.
const ERROR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStep {
    Install,
    Build,
}

impl InstallStep {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Build => "build",
        }
    }
}

pub struct PackageInstaller {
    cfg: InstallerConfig,
}

impl PackageInstaller {
    pub fn new(cfg: &InstallerConfig) -> Self {
        Self { cfg: cfg.clone() }
    }

    /// Run one step in `module_dir`, failing on a non-zero exit.
    pub async fn run(&self, step: InstallStep, module_dir: &Path) -> Result<()> {
        let args = match step {
            InstallStep::Install => &self.cfg.install_args,
            InstallStep::Build => &self.cfg.build_args,
        };
        tracing::info!(
            "Running {} {} in {}",
            self.cfg.program,
            args.join(" "),
            module_dir.display()
        );

        let mut cmd = Command::new(&self.cfg.program);
        cmd.args(args)
            .current_dir(module_dir)
            .env("FORCE_COLOR", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_creation_flags(&mut cmd);

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to run {} {}", self.cfg.program, step.label()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(ERROR_TAIL_LINES)..].join("\n");
            anyhow::bail!("{} failed ({}): {}", step.label(), output.status, tail);
        }
        tracing::debug!(
            "{} output: {}",
            step.label(),
            String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh_installer(install: &str, build: &str) -> PackageInstaller {
        PackageInstaller::new(&InstallerConfig {
            program: "sh".to_string(),
            install_args: vec!["-c".to_string(), install.to_string()],
            build_args: vec!["-c".to_string(), build.to_string()],
        })
    }

    #[tokio::test]
    async fn test_steps_run_in_module_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let installer = sh_installer("mkdir node_modules", "mkdir dist");
        installer.run(InstallStep::Install, tmp.path()).await.unwrap();
        installer.run(InstallStep::Build, tmp.path()).await.unwrap();
        assert!(tmp.path().join("node_modules").is_dir());
        assert!(tmp.path().join("dist").is_dir());
    }

    #[tokio::test]
    async fn test_failure_reports_stderr_tail() {
        let tmp = tempfile::TempDir::new().unwrap();
        let installer = sh_installer("echo 'ERR! 404 left-pad' >&2; exit 1", "true");
        let err = installer.run(InstallStep::Install, tmp.path()).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("install failed"));
        assert!(msg.contains("left-pad"));
    }
}
