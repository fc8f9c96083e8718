use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default config file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/host.toml";

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct HostConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Directory holding one sub-directory per uploaded module
    #[serde(default = "default_apps_dir")]
    pub apps_dir: PathBuf,
    /// Scratch area for incoming archives
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: usize,
    /// First port handed to a dev server
    #[serde(default = "default_port_base")]
    pub port_base: u16,
    #[serde(default = "default_port_max")]
    pub port_max: u16,
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
    /// Treat a TCP accept on the assigned port as readiness
    #[serde(default = "default_true")]
    pub probe_port: bool,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Grace period between the polite signal and the force kill
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_delete_settle_ms")]
    pub delete_settle_ms: u64,
    #[serde(default = "default_delete_retries")]
    pub delete_retries: u32,
    #[serde(default = "default_delete_retry_delay_ms")]
    pub delete_retry_delay_ms: u64,
    #[serde(default = "default_log_buffer_lines")]
    pub log_buffer_lines: usize,
    #[serde(default)]
    pub dev_server: DevServerConfig,
    #[serde(default)]
    pub installer: InstallerConfig,
}

/// How a dev server is launched and how its readiness is recognised.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DevServerConfig {
    #[serde(default = "default_npm_program")]
    pub program: String,
    /// `{port}` is replaced with the allocated port
    #[serde(default = "default_dev_args")]
    pub args: Vec<String>,
    #[serde(default = "default_ready_markers")]
    pub ready_markers: Vec<String>,
    /// Dependency name that marks a package as dev-server capable
    #[serde(default = "default_tool_dependency")]
    pub tool_dependency: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct InstallerConfig {
    #[serde(default = "default_npm_program")]
    pub program: String,
    #[serde(default = "default_install_args")]
    pub install_args: Vec<String>,
    #[serde(default = "default_build_args")]
    pub build_args: Vec<String>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_apps_dir() -> PathBuf {
    PathBuf::from("./apps")
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("./uploads")
}

fn default_max_upload_size() -> usize {
    200 * 1024 * 1024
}

fn default_port_base() -> u16 {
    5173
}

fn default_port_max() -> u16 {
    u16::MAX
}

fn default_start_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_probe_interval_ms() -> u64 {
    250
}

fn default_stop_grace_secs() -> u64 {
    5
}

fn default_delete_settle_ms() -> u64 {
    1000
}

fn default_delete_retries() -> u32 {
    3
}

fn default_delete_retry_delay_ms() -> u64 {
    1000
}

fn default_log_buffer_lines() -> usize {
    2000
}

fn default_npm_program() -> String {
    if cfg!(target_os = "windows") {
        "npm.cmd".to_string()
    } else {
        "npm".to_string()
    }
}

fn default_dev_args() -> Vec<String> {
    ["run", "dev", "--", "--port", "{port}", "--host"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_ready_markers() -> Vec<String> {
    vec!["Local:".to_string(), "ready in".to_string()]
}

fn default_tool_dependency() -> String {
    "vite".to_string()
}

fn default_install_args() -> Vec<String> {
    vec!["install".to_string()]
}

fn default_build_args() -> Vec<String> {
    vec!["run".to_string(), "build".to_string()]
}

impl Default for DevServerConfig {
    fn default() -> Self {
        Self {
            program: default_npm_program(),
            args: default_dev_args(),
            ready_markers: default_ready_markers(),
            tool_dependency: default_tool_dependency(),
        }
    }
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            program: default_npm_program(),
            install_args: default_install_args(),
            build_args: default_build_args(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            apps_dir: default_apps_dir(),
            uploads_dir: default_uploads_dir(),
            max_upload_size: default_max_upload_size(),
            port_base: default_port_base(),
            port_max: default_port_max(),
            start_timeout_secs: default_start_timeout_secs(),
            probe_port: true,
            probe_interval_ms: default_probe_interval_ms(),
            stop_grace_secs: default_stop_grace_secs(),
            delete_settle_ms: default_delete_settle_ms(),
            delete_retries: default_delete_retries(),
            delete_retry_delay_ms: default_delete_retry_delay_ms(),
            log_buffer_lines: default_log_buffer_lines(),
            dev_server: DevServerConfig::default(),
            installer: InstallerConfig::default(),
        }
    }
}

impl HostConfig {
    /// Load the config file named by `MODULE_HOST_CONFIG` (or the default path)
    /// and apply environment overrides. A missing file means defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var("MODULE_HOST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::from_file(&path)?.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&s).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port_max < self.port_base {
            anyhow::bail!(
                "port_max ({}) must not be lower than port_base ({})",
                self.port_max,
                self.port_base
            );
        }
        Ok(())
    }

    /// Apply `MODULE_HOST_*` overrides looked up through `var`, then check the
    /// result again.
    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(addr) = var("MODULE_HOST_LISTEN") {
            self.listen_addr = addr;
        }
        if let Some(dir) = var("MODULE_HOST_APPS_DIR") {
            self.apps_dir = PathBuf::from(dir);
        }
        if let Some(base) = var("MODULE_HOST_PORT_BASE") {
            self.port_base = base
                .parse()
                .with_context(|| format!("MODULE_HOST_PORT_BASE is not a port: {}", base))?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn delete_settle(&self) -> Duration {
        Duration::from_millis(self.delete_settle_ms)
    }

    pub fn delete_retry_delay(&self) -> Duration {
        Duration::from_millis(self.delete_retry_delay_ms)
    }
}
