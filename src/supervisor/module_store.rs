use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tempfile::NamedTempFile;
use zip::ZipArchive;

use super::classifier::{self, ModuleKind};
use super::error::{SupervisorError, SupervisorResult};
use crate::config::HostConfig;
use crate::utils::retry_with_backoff;

pub const MAX_NAME_LEN: usize = 64;

/// Legacy device names that cannot be used as directory names on every platform.
const RESERVED_MODULE_NAMES: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// Archive metadata folder some zip tools add next to the real content.
const ARCHIVE_METADATA_DIR: &str = "__MACOSX";

/// Normalise a user supplied module name.
///
/// Returns `None` when nothing usable is left, the result is a reserved
/// device name, or it is longer than [`MAX_NAME_LEN`].
pub fn sanitize_module_name(value: &str) -> Option<String> {
    let mut collapsed = String::with_capacity(value.len());
    let mut in_whitespace = false;
    for c in value.trim().chars().flat_map(char::to_lowercase) {
        if c.is_whitespace() {
            if !in_whitespace {
                collapsed.push('-');
            }
            in_whitespace = true;
        } else {
            collapsed.push(c);
            in_whitespace = false;
        }
    }

    let filtered: String = collapsed
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '_')
        .collect();
    let sanitized = filtered.trim_matches('-');

    if sanitized.is_empty()
        || RESERVED_MODULE_NAMES.contains(&sanitized)
        || sanitized.len() > MAX_NAME_LEN
    {
        return None;
    }
    Some(sanitized.to_string())
}

/// Pick the module name for an upload: the explicit name if it survives
/// sanitization, otherwise the archive file name without `.zip`.
pub fn resolve_upload_name(provided: Option<&str>, file_name: Option<&str>) -> Option<String> {
    provided.and_then(sanitize_module_name).or_else(|| {
        file_name.and_then(|f| {
            let split = f.len().checked_sub(4).filter(|i| f.is_char_boundary(*i));
            let stem = match split {
                Some(i) if f[i..].eq_ignore_ascii_case(".zip") => &f[..i],
                _ => f,
            };
            sanitize_module_name(stem)
        })
    })
}

/// Reject names that are not already in canonical form.
pub fn validate_name(name: &str) -> SupervisorResult<()> {
    match sanitize_module_name(name) {
        Some(ref s) if s == name => Ok(()),
        _ => Err(SupervisorError::InvalidName(name.to_string())),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleEntry {
    pub name: String,
    pub path: PathBuf,
    pub kind: ModuleKind,
}

/// Filesystem area holding one directory per uploaded module.
pub struct ModuleStore {
    apps_dir: PathBuf,
    uploads_dir: PathBuf,
    tool_dependency: String,
    delete_retries: u32,
    delete_retry_delay: Duration,
}

impl ModuleStore {
    pub fn new(cfg: &HostConfig) -> Self {
        Self {
            apps_dir: cfg.apps_dir.clone(),
            uploads_dir: cfg.uploads_dir.clone(),
            tool_dependency: cfg.dev_server.tool_dependency.clone(),
            delete_retries: cfg.delete_retries,
            delete_retry_delay: cfg.delete_retry_delay(),
        }
    }

    pub fn apps_dir(&self) -> &Path {
        &self.apps_dir
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.apps_dir)
            .with_context(|| format!("Failed to create {}", self.apps_dir.display()))?;
        fs::create_dir_all(&self.uploads_dir)
            .with_context(|| format!("Failed to create {}", self.uploads_dir.display()))?;
        Ok(())
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.apps_dir.join(name)
    }

    pub async fn exists(&self, name: &str) -> bool {
        tokio::fs::metadata(self.path(name))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    pub async fn classify(&self, name: &str) -> ModuleKind {
        classifier::classify(&self.path(name), &self.tool_dependency).await
    }

    /// A scratch file for an incoming archive; removed when dropped.
    pub fn new_upload_file(&self) -> Result<NamedTempFile> {
        fs::create_dir_all(&self.uploads_dir)?;
        tempfile::Builder::new()
            .prefix("upload-")
            .suffix(".zip")
            .tempfile_in(&self.uploads_dir)
            .context("Failed to create upload file")
    }

    /// Unpack `archive` into a fresh module directory named `name`.
    ///
    /// The archive file is deleted whatever the outcome. A failed extraction
    /// leaves no module directory behind.
    pub async fn extract(&self, archive: NamedTempFile, name: &str) -> SupervisorResult<PathBuf> {
        let result = self.extract_inner(archive.path(), name).await;
        if let Err(e) = archive.close() {
            tracing::error!("Error deleting uploaded archive: {}", e);
        }
        result
    }

    async fn extract_inner(&self, archive_path: &Path, name: &str) -> SupervisorResult<PathBuf> {
        let name = sanitize_module_name(name)
            .ok_or_else(|| SupervisorError::InvalidName(name.to_string()))?;
        let target = self.path(&name);

        tokio::fs::create_dir_all(&self.apps_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.apps_dir.display()))?;
        // create_dir (not _all) so two uploads of one name cannot both win
        match tokio::fs::create_dir(&target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(SupervisorError::NameConflict(name));
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to create {}", target.display()))
                    .into())
            }
        }

        let archive_path = archive_path.to_path_buf();
        let dest = target.clone();
        let unpacked = tokio::task::spawn_blocking(move || unpack_archive(&archive_path, &dest))
            .await
            .map_err(|e| anyhow::anyhow!("extraction task failed: {}", e))?;

        if let Err(e) = unpacked {
            tracing::warn!("Extraction of '{}' failed: {:#}", name, e);
            if let Err(cleanup) = tokio::fs::remove_dir_all(&target).await {
                tracing::error!("Failed to clean up {}: {}", target.display(), cleanup);
            }
            return Err(SupervisorError::InvalidArchive(format!("{:#}", e)));
        }

        tracing::info!("Extracted module '{}' into {}", name, target.display());
        Ok(target)
    }

    /// Enumerate module directories, sorted by name.
    pub async fn list(&self) -> Result<Vec<ModuleEntry>> {
        let mut modules = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.apps_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Apps directory does not exist: {}", self.apps_dir.display());
                return Ok(modules);
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path();
            let kind = classifier::classify(&path, &self.tool_dependency).await;
            modules.push(ModuleEntry { name, path, kind });
        }

        modules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(modules)
    }

    /// Recursively delete a module, retrying while the OS still holds handles
    /// of a just-killed process.
    pub async fn remove(&self, name: &str) -> SupervisorResult<()> {
        let path = self.path(name);
        retry_with_backoff(self.delete_retries, self.delete_retry_delay, |attempt| {
            let path = path.clone();
            async move {
                match tokio::fs::remove_dir_all(&path).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => {
                        tracing::debug!("Delete attempt {} for {} failed: {}", attempt, path.display(), e);
                        Err(e)
                    }
                }
            }
        })
        .await
        .map_err(|source| SupervisorError::DeleteFailed {
            module: name.to_string(),
            source,
        })?;

        tracing::info!("Removed module '{}'", name);
        Ok(())
    }
}

fn unpack_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive_path)
        .with_context(|| format!("Failed to open {}", archive_path.display()))?;
    let mut archive = ZipArchive::new(file).context("not a zip archive")?;
    if archive.len() == 0 {
        anyhow::bail!("archive is empty");
    }
    archive.extract(dest).context("failed to unpack archive")?;

    let metadata_dir = dest.join(ARCHIVE_METADATA_DIR);
    if metadata_dir.is_dir() {
        fs::remove_dir_all(&metadata_dir)?;
    }
    hoist_single_root(dest)
}

/// If `dest` holds exactly one directory and nothing else, move that
/// directory's contents up into `dest`.
fn hoist_single_root(dest: &Path) -> Result<()> {
    let entries: Vec<_> = fs::read_dir(dest)?.collect::<std::io::Result<_>>()?;
    if entries.len() != 1 || !entries[0].file_type()?.is_dir() {
        return Ok(());
    }

    // rename first so a child sharing the wrapper's name cannot collide
    let wrapper = dest.join(format!(".hoist-{}", uuid::Uuid::new_v4()));
    fs::rename(entries[0].path(), &wrapper)?;
    for child in fs::read_dir(&wrapper)? {
        let child = child?;
        fs::rename(child.path(), dest.join(child.file_name()))?;
    }
    fs::remove_dir(&wrapper)?;
    tracing::debug!("Hoisted single top-level directory in {}", dest.display());
    Ok(())
}
