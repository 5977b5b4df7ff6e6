//! Project records and the store that persists them.
//!
//! The generation service owns project creation; Shipyard reads projects to
//! validate preconditions and writes back sandbox status, infrastructure
//! outputs and deployment results.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Outcome of the latest sandbox validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxStatus {
    pub ready: bool,
    pub build_errors: Vec<String>,
    pub runtime_errors: Vec<String>,
    pub frontend_url: Option<String>,
    pub backend_url: Option<String>,
    pub last_job_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeploymentStatus {
    #[default]
    NotDeployed,
    InProgress {
        job_id: String,
    },
    Deployed,
    Failed {
        error: String,
    },
}

/// Post-deploy check outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResults {
    pub backend_health: CheckResult,
    pub frontend_reachable: CheckResult,
    pub integration: CheckResult,
}

impl VerificationResults {
    pub fn all_passed(&self) -> bool {
        self.backend_health.passed && self.frontend_reachable.passed && self.integration.passed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Terraform source produced by the generator. Also looked up on disk.
    #[serde(default)]
    pub infrastructure_code: Option<String>,
    #[serde(default)]
    pub sandbox: SandboxStatus,
    #[serde(default)]
    pub infrastructure_outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub deployment_status: DeploymentStatus,
    #[serde(default)]
    pub production_frontend_url: Option<String>,
    #[serde(default)]
    pub production_backend_url: Option<String>,
    #[serde(default)]
    pub verification: Option<VerificationResults>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deployed_at: Option<DateTime<Utc>>,
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            infrastructure_code: None,
            sandbox: SandboxStatus::default(),
            infrastructure_outputs: BTreeMap::new(),
            deployment_status: DeploymentStatus::NotDeployed,
            production_frontend_url: None,
            production_backend_url: None,
            verification: None,
            created_at: now,
            updated_at: now,
            deployed_at: None,
        }
    }

    /// Infrastructure source: the stored code, else `<project_dir>/infrastructure/main.tf`.
    pub fn infrastructure_source(&self, project_dir: &Path) -> Option<String> {
        if let Some(code) = self.infrastructure_code.as_ref().filter(|c| !c.trim().is_empty()) {
            return Some(code.clone());
        }
        std::fs::read_to_string(project_dir.join("infrastructure").join("main.tf"))
            .ok()
            .filter(|c| !c.trim().is_empty())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Persistence for project records.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get_project(&self, id: &str) -> Result<Option<Project>>;
    async fn save_project(&self, project: &Project) -> Result<()>;
}

/// One pretty-printed JSON file per project under a directory.
pub struct FileProjectStore {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileProjectStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            anyhow::bail!("Invalid project id '{}'", id);
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }
}

#[async_trait]
impl ProjectStore for FileProjectStore {
    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let path = self.path_for(id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        let project = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse project file {}", path.display()))?;
        Ok(Some(project))
    }

    async fn save_project(&self, project: &Project) -> Result<()> {
        let path = self.path_for(&project.id)?;
        let json = serde_json::to_string_pretty(project).context("Failed to serialize project")?;

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        // Readers must never observe a partially written record.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryProjectStore {
    projects: RwLock<HashMap<String, Project>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_projects(projects: impl IntoIterator<Item = Project>) -> Self {
        Self {
            projects: RwLock::new(projects.into_iter().map(|p| (p.id.clone(), p)).collect()),
        }
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        Ok(self.projects.read().await.get(id).cloned())
    }

    async fn save_project(&self, project: &Project) -> Result<()> {
        self.projects
            .write()
            .await
            .insert(project.id.clone(), project.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProjectStore::new(dir.path().join("store"));
        assert!(store.get_project("p1").await.unwrap().is_none());

        let mut project = Project::new("p1", "Demo");
        project.sandbox.ready = true;
        project.deployment_status = DeploymentStatus::Failed {
            error: "apply failed".into(),
        };
        store.save_project(&project).await.unwrap();

        let loaded = store.get_project("p1").await.unwrap().unwrap();
        assert!(loaded.sandbox.ready);
        assert_eq!(loaded.deployment_status, project.deployment_status);
        assert!(!dir.path().join("store").join("p1.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProjectStore::new(dir.path());
        assert!(store.get_project("../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_file_store_tolerates_minimal_records() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("p2.json"),
            r#"{"id":"p2","name":"x","createdAt":"2026-01-01T00:00:00Z","updatedAt":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let store = FileProjectStore::new(dir.path());
        let project = store.get_project("p2").await.unwrap().unwrap();
        assert_eq!(project.deployment_status, DeploymentStatus::NotDeployed);
        assert!(!project.sandbox.ready);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryProjectStore::with_projects([Project::new("a", "A")]);
        assert!(store.get_project("a").await.unwrap().is_some());
        assert!(store.get_project("b").await.unwrap().is_none());
        store.save_project(&Project::new("b", "B")).await.unwrap();
        assert!(store.get_project("b").await.unwrap().is_some());
    }

    #[test]
    fn test_infrastructure_source_prefers_stored_code() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("infrastructure")).unwrap();
        std::fs::write(dir.path().join("infrastructure/main.tf"), "# disk").unwrap();

        let mut project = Project::new("p", "P");
        assert_eq!(project.infrastructure_source(dir.path()).as_deref(), Some("# disk"));
        project.infrastructure_code = Some("# stored".into());
        assert_eq!(project.infrastructure_source(dir.path()).as_deref(), Some("# stored"));
    }

    #[test]
    fn test_deployment_status_serialization() {
        let json = serde_json::to_value(DeploymentStatus::InProgress { job_id: "dep-1".into() }).unwrap();
        assert_eq!(json["state"], "in_progress");
        assert_eq!(json["job_id"], "dep-1");
    }
}
