pub mod classifier;
pub mod dev_process;
pub mod error;
pub mod installer;
pub mod launcher;
pub mod module_store;
pub mod port;
pub mod process;
pub mod registry;
pub mod state_machine;
pub mod upload;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;

use classifier::{main_file, read_manifest, MANIFEST_FILE};
use dev_process::{DevServerProcess, LogLine};
use error::{SupervisorError, SupervisorResult};
use installer::{InstallStep, PackageInstaller};
use launcher::DevServerLauncher;
use module_store::{resolve_upload_name, validate_name, ModuleStore};
use port::{is_port_in_use, PortAllocator};
use registry::{ProcessRegistry, Session, SessionState};
use upload::{AppType, UploadEvent, UploadedApp};

use crate::config::HostConfig;

/// Busy ports skipped per start before giving up.
const MAX_PORT_SKIPS: usize = 16;

/// Default number of log lines returned when no cursor is given.
const DEFAULT_LOG_TAIL: usize = 200;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub name: String,
    pub is_vite: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_server_port: Option<u16>,
    pub is_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOutcome {
    pub port: u16,
    pub already_running: bool,
}

/// Lifecycle controller tying the store, registry, allocator and launcher
/// together. All operations take `&self`; start, stop and delete of the same
/// module are serialized by a per-module lock.
pub struct Supervisor {
    pub store: ModuleStore,
    pub registry: Arc<ProcessRegistry>,
    ports: PortAllocator,
    launcher: DevServerLauncher,
    installer: PackageInstaller,
    module_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    stop_grace: Duration,
    delete_settle: Duration,
}

impl Supervisor {
    pub fn new(cfg: &HostConfig) -> Self {
        Self {
            store: ModuleStore::new(cfg),
            registry: Arc::new(ProcessRegistry::new()),
            ports: PortAllocator::new(cfg.port_base, cfg.port_max),
            launcher: DevServerLauncher::new(cfg),
            installer: PackageInstaller::new(&cfg.installer),
            module_locks: Mutex::new(HashMap::new()),
            stop_grace: cfg.stop_grace(),
            delete_settle: cfg.delete_settle(),
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        self.store.ensure_dirs()?;
        let modules = self.store.list().await?;
        tracing::info!("Found {} modules in {}", modules.len(), self.store.apps_dir().display());
        for module in modules {
            tracing::info!("  - {} ({:?})", module.name, module.kind);
        }
        Ok(())
    }

    fn module_lock(&self, name: &str) -> SupervisorResult<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .module_locks
            .lock()
            .map_err(|_| anyhow::anyhow!("module lock table poisoned"))?;
        // entries nobody holds or waits on belong to finished operations
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Ok(locks.entry(name.to_string()).or_default().clone())
    }

    /// GET /api/apps
    pub async fn list(&self) -> Result<Vec<AppInfo>> {
        let modules = self.store.list().await?;
        let sessions = self.registry.snapshot()?;
        Ok(modules
            .into_iter()
            .map(|m| {
                let session = sessions.get(&m.name);
                AppInfo {
                    is_vite: m.kind.is_dev_capable(),
                    dev_server_port: session.map(|s| s.port),
                    is_running: session.is_some(),
                    status: session.map(|s| s.state),
                    name: m.name,
                }
            })
            .collect())
    }

    /// Start (or find) the dev server of `name` and return its port.
    pub async fn start(&self, name: &str) -> SupervisorResult<StartOutcome> {
        validate_name(name)?;
        let lock = self.module_lock(name)?;
        let _guard = lock.lock().await;

        if !self.store.exists(name).await {
            return Err(SupervisorError::NotFound(name.to_string()));
        }
        if !self.store.classify(name).await.is_dev_capable() {
            return Err(SupervisorError::NotDevCapable(name.to_string()));
        }

        if let Some(session) = self.registry.get(name)? {
            if session.process.is_running() {
                tracing::info!("Dev server for {} already running on port {}", name, session.port);
                return Ok(StartOutcome {
                    port: session.port,
                    already_running: true,
                });
            }
            // exited but the watcher has not evicted it yet
            self.registry.remove_if(name, session.id)?;
        }

        let port = self.allocate_port().await?;
        let pending = self.launcher.spawn(name, &self.store.path(name), port)?;
        let process = pending.process.clone();
        let session = Session::starting(port, process.clone());
        let id = session.id;
        self.registry.put(name, session)?;
        self.watch_exit(name, id, process.clone());

        match self.launcher.wait_ready(pending).await {
            Ok(_) => {
                if self.registry.mark_ready(name, id)? {
                    Ok(StartOutcome {
                        port,
                        already_running: false,
                    })
                } else {
                    Err(SupervisorError::SpawnError {
                        module: name.to_string(),
                        reason: "process exited right after becoming ready".to_string(),
                    })
                }
            }
            Err(e) => {
                // unregister first so listings never show a dying session
                self.registry.remove_if(name, id)?;
                if process.is_running() {
                    tracing::info!("Terminating failed dev server for {} (pid {})", name, process.pid);
                    process.terminate(self.stop_grace, false).await;
                }
                Err(e)
            }
        }
    }

    async fn allocate_port(&self) -> SupervisorResult<u16> {
        for _ in 0..MAX_PORT_SKIPS {
            let port = self.ports.next()?;
            if is_port_in_use(port).await {
                tracing::warn!("Port {} is already in use, skipping", port);
                continue;
            }
            return Ok(port);
        }
        Err(anyhow::anyhow!("no free port found after {} attempts", MAX_PORT_SKIPS).into())
    }

    /// Evict the session when its process exits, unless a newer session
    /// has taken the slot.
    fn watch_exit(&self, name: &str, id: uuid::Uuid, process: Arc<DevServerProcess>) {
        let registry = self.registry.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let summary = process.wait_for_exit().await;
            match registry.remove_if(&name, id) {
                Ok(Some(_)) => tracing::warn!(
                    "Dev server for {} exited ({}), session removed",
                    name,
                    summary.description
                ),
                Ok(None) => {}
                Err(e) => tracing::error!("Failed to evict session for {}: {}", name, e),
            }
        });
    }

    /// Stop the dev server of `name`. Returns whether one was running.
    pub async fn stop(&self, name: &str) -> SupervisorResult<bool> {
        validate_name(name)?;
        let lock = self.module_lock(name)?;
        let _guard = lock.lock().await;

        match self.registry.remove(name)? {
            Some(session) => {
                tracing::info!("Stopping dev server for {} (pid {})", name, session.process.pid);
                session.process.terminate(self.stop_grace, false).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Kill any dev server of `name`, then remove its directory.
    pub async fn delete(&self, name: &str) -> SupervisorResult<()> {
        validate_name(name)?;
        let lock = self.module_lock(name)?;
        let _guard = lock.lock().await;

        let session = self.registry.remove(name)?;
        if session.is_none() && !self.store.exists(name).await {
            return Err(SupervisorError::NotFound(name.to_string()));
        }

        if let Some(session) = session {
            tracing::info!("Killing dev server for {} before delete", name);
            session.process.terminate(self.stop_grace, true).await;
            // let the OS release file handles of the killed tree
            tokio::time::sleep(self.delete_settle).await;
        }

        self.store.remove(name).await
    }

    /// Terminate every registered dev server. Used once at host shutdown.
    pub async fn shutdown_all(&self) {
        let sessions = match self.registry.drain() {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::error!("Cannot shut down dev servers: {}", e);
                return;
            }
        };
        if sessions.is_empty() {
            return;
        }
        tracing::info!("Shutting down {} dev servers...", sessions.len());
        let grace = self.stop_grace;
        futures::future::join_all(sessions.into_iter().map(|(name, session)| async move {
            tracing::info!("Stopping {}...", name);
            if !session.process.terminate(grace, false).await {
                tracing::error!("Dev server for {} may still be running", name);
            }
        }))
        .await;
    }

    /// Buffered console output of a running dev server.
    pub async fn logs(
        &self,
        name: &str,
        since: Option<u64>,
        count: Option<usize>,
    ) -> SupervisorResult<Vec<LogLine>> {
        validate_name(name)?;
        let session = self
            .registry
            .get(name)?
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
        Ok(match since {
            Some(id) => session.process.get_console_since(id).await,
            None => {
                session
                    .process
                    .get_recent_console(count.unwrap_or(DEFAULT_LOG_TAIL))
                    .await
            }
        })
    }

    /// Resolve the module name of an upload and unpack it. The archive is
    /// removed on every path.
    pub async fn accept_upload(
        &self,
        archive: NamedTempFile,
        provided_name: Option<&str>,
        file_name: Option<&str>,
    ) -> SupervisorResult<String> {
        let name = match resolve_upload_name(provided_name, file_name) {
            Some(name) => name,
            None => {
                drop(archive);
                return Err(SupervisorError::InvalidName(
                    provided_name.or(file_name).unwrap_or_default().to_string(),
                ));
            }
        };
        self.store.extract(archive, &name).await?;
        Ok(name)
    }

    /// Install and build an extracted module, reporting progress on `events`.
    /// Install or build failures are logged; the module stays available.
    pub async fn prepare_module(&self, name: &str, events: &mpsc::Sender<UploadEvent>) {
        let dir = self.store.path(name);
        let mut app_type = AppType::Html;

        if has_manifest(&dir).await {
            app_type = AppType::Node;
            let _ = events
                .send(UploadEvent::Installing {
                    message: "Installing Node.js dependencies...".to_string(),
                })
                .await;

            match self.installer.run(InstallStep::Install, &dir).await {
                Ok(()) => {
                    let has_build = read_manifest(&dir)
                        .await
                        .map(|m| m.has_script("build"))
                        .unwrap_or(false);
                    if has_build {
                        let _ = events
                            .send(UploadEvent::Building {
                                message: "Building application...".to_string(),
                            })
                            .await;
                        if let Err(e) = self.installer.run(InstallStep::Build, &dir).await {
                            tracing::error!("Error building {}: {:#}", name, e);
                        }
                    }
                }
                Err(e) => tracing::error!("Error installing dependencies for {}: {:#}", name, e),
            }
        }

        let app = UploadedApp {
            name: name.to_string(),
            app_type,
            main_file: main_file(&dir).await,
        };
        tracing::info!("Module {} ready ({:?}, {})", app.name, app.app_type, app.main_file);
        let _ = events
            .send(UploadEvent::Complete {
                message: "Module uploaded successfully".to_string(),
                app,
            })
            .await;
    }
}

async fn has_manifest(dir: &Path) -> bool {
    tokio::fs::metadata(dir.join(MANIFEST_FILE)).await.is_ok()
}
