use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::dev_process::DevServerProcess;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry lock poisoned")]
    LockPoisoned,
}

impl From<RegistryError> for super::error::SupervisorError {
    fn from(e: RegistryError) -> Self {
        Self::Internal(anyhow::anyhow!(e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Ready,
}

/// Runtime record of one module's dev server.
#[derive(Clone)]
pub struct Session {
    pub id: Uuid,
    pub port: u16,
    pub state: SessionState,
    pub started_at: u64,
    pub process: Arc<DevServerProcess>,
}

impl Session {
    pub fn starting(port: u16, process: Arc<DevServerProcess>) -> Self {
        Self {
            id: Uuid::new_v4(),
            port,
            state: SessionState::Starting,
            started_at: current_timestamp(),
            process,
        }
    }
}

/// Lightweight view of a session for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub port: u16,
    pub state: SessionState,
    pub pid: u32,
    pub started_at: u64,
}

/// Authoritative map of module name to dev server session.
///
/// `put` overwrites; keeping one session per module is the caller's job.
#[derive(Default)]
pub struct ProcessRegistry {
    sessions: Mutex<HashMap<String, Session>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Session>>, RegistryError> {
        self.sessions.lock().map_err(|e| {
            tracing::error!("ProcessRegistry lock poisoned: {}", e);
            RegistryError::LockPoisoned
        })
    }

    pub fn get(&self, name: &str) -> Result<Option<Session>, RegistryError> {
        Ok(self.lock()?.get(name).cloned())
    }

    pub fn put(&self, name: &str, session: Session) -> Result<(), RegistryError> {
        let mut sessions = self.lock()?;
        tracing::debug!("Registering session {} for '{}' (port {})", session.id, name, session.port);
        if let Some(old) = sessions.insert(name.to_string(), session) {
            tracing::warn!("Session {} for '{}' was overwritten", old.id, name);
        }
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<Option<Session>, RegistryError> {
        Ok(self.lock()?.remove(name))
    }

    /// Remove the entry only if it still belongs to session `id`.
    pub fn remove_if(&self, name: &str, id: Uuid) -> Result<Option<Session>, RegistryError> {
        let mut sessions = self.lock()?;
        if sessions.get(name).map(|s| s.id) == Some(id) {
            Ok(sessions.remove(name))
        } else {
            Ok(None)
        }
    }

    /// Promote session `id` to ready. Returns false if it is no longer registered.
    pub fn mark_ready(&self, name: &str, id: Uuid) -> Result<bool, RegistryError> {
        let mut sessions = self.lock()?;
        match sessions.get_mut(name) {
            Some(session) if session.id == id => {
                session.state = SessionState::Ready;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn all_names(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    pub fn drain(&self) -> Result<Vec<(String, Session)>, RegistryError> {
        Ok(self.lock()?.drain().collect())
    }

    pub fn snapshot(&self) -> Result<HashMap<String, SessionInfo>, RegistryError> {
        Ok(self
            .lock()?
            .iter()
            .map(|(name, s)| {
                (
                    name.clone(),
                    SessionInfo {
                        port: s.port,
                        state: s.state,
                        pid: s.process.pid,
                        started_at: s.started_at,
                    },
                )
            })
            .collect())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
