//! Decides how an uploaded module is served, based on its `package.json`.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const MANIFEST_FILE: &str = "package.json";
pub const BUILD_OUTPUT_DIR: &str = "dist";
pub const ENTRY_FILE: &str = "index.html";

/// The parts of a `package.json` the host cares about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub scripts: HashMap<String, String>,
    #[serde(default)]
    pub dependencies: HashMap<String, serde_json::Value>,
    #[serde(default, rename = "devDependencies")]
    pub dev_dependencies: HashMap<String, serde_json::Value>,
}

impl PackageManifest {
    pub fn depends_on(&self, package: &str) -> bool {
        self.dependencies.contains_key(package) || self.dev_dependencies.contains_key(package)
    }

    pub fn has_script(&self, script: &str) -> bool {
        self.scripts.contains_key(script)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModuleKind {
    Static,
    NodeDevCapable {
        has_build_script: bool,
        has_start_script: bool,
    },
}

impl ModuleKind {
    pub fn is_dev_capable(&self) -> bool {
        matches!(self, Self::NodeDevCapable { .. })
    }
}

/// Read and parse the module manifest. Missing or malformed manifests are
/// `None`.
pub async fn read_manifest(module_dir: &Path) -> Option<PackageManifest> {
    let path = module_dir.join(MANIFEST_FILE);
    let content = tokio::fs::read_to_string(&path).await.ok()?;
    match serde_json::from_str(&content) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            tracing::debug!("Ignoring unparsable manifest {}: {}", path.display(), e);
            None
        }
    }
}

pub fn classify_manifest(manifest: Option<&PackageManifest>, tool_dependency: &str) -> ModuleKind {
    match manifest {
        Some(m) if m.depends_on(tool_dependency) => ModuleKind::NodeDevCapable {
            has_build_script: m.has_script("build"),
            has_start_script: m.has_script("start"),
        },
        _ => ModuleKind::Static,
    }
}

pub async fn classify(module_dir: &Path, tool_dependency: &str) -> ModuleKind {
    classify_manifest(read_manifest(module_dir).await.as_ref(), tool_dependency)
}

/// The built entry file if a build output directory exists, else the top-level one.
pub async fn main_file(module_dir: &Path) -> String {
    let dist = module_dir.join(BUILD_OUTPUT_DIR);
    match tokio::fs::metadata(&dist).await {
        Ok(meta) if meta.is_dir() => format!("{}/{}", BUILD_OUTPUT_DIR, ENTRY_FILE),
        _ => ENTRY_FILE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[tokio::test]
    async fn test_no_manifest_is_static() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "index.html", "<h1>hi</h1>");
        assert_eq!(classify(tmp.path(), "vite").await, ModuleKind::Static);
    }

    #[tokio::test]
    async fn test_dev_dependency_is_dev_capable() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            MANIFEST_FILE,
            r#"{"name":"app","scripts":{"dev":"vite","build":"vite build"},"devDependencies":{"vite":"^5.0.0"}}"#,
        );
        assert_eq!(
            classify(tmp.path(), "vite").await,
            ModuleKind::NodeDevCapable {
                has_build_script: true,
                has_start_script: false
            }
        );
    }

    #[tokio::test]
    async fn test_regular_dependency_counts() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), MANIFEST_FILE, r#"{"dependencies":{"vite":"5"},"scripts":{"start":"vite preview"}}"#);
        let kind = classify(tmp.path(), "vite").await;
        assert!(kind.is_dev_capable());
        assert_eq!(
            kind,
            ModuleKind::NodeDevCapable {
                has_build_script: false,
                has_start_script: true
            }
        );
    }

    #[tokio::test]
    async fn test_manifest_without_tool_is_static() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), MANIFEST_FILE, r#"{"dependencies":{"react":"18"}}"#);
        assert_eq!(classify(tmp.path(), "vite").await, ModuleKind::Static);
        assert!(read_manifest(tmp.path()).await.is_some());
    }

    #[tokio::test]
    async fn test_broken_manifest_is_static() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), MANIFEST_FILE, "{ not json");
        assert_eq!(classify(tmp.path(), "vite").await, ModuleKind::Static);
        assert!(read_manifest(tmp.path()).await.is_none());
    }

    #[tokio::test]
    async fn test_main_file_prefers_build_output() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(main_file(tmp.path()).await, "index.html");
        std::fs::create_dir(tmp.path().join("dist")).unwrap();
        assert_eq!(main_file(tmp.path()).await, "dist/index.html");
    }
}
