//! Infrastructure lifecycle management.
//!
//! Wraps Terraform so that provisioning a project is idempotent: any
//! infrastructure left by an earlier run is destroyed before the new
//! configuration is applied, even when the configuration that created it is
//! gone. Operations on one project are serialized in-process by an async
//! mutex and across processes by an advisory lock file.

pub mod outputs;
pub mod state;
pub mod terraform;

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fs2::FileExt;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::ShipyardConfig;
use crate::errors::InfraError;
use crate::process::tail;
pub use outputs::ProvisionedResources;
use state::StateLocation;
use terraform::{is_missing_configuration, TerraformCli};

const LOCK_FILE: &str = ".shipyard.lock";
const SOURCE_FILE: &str = "main.tf";
const LOG_TAIL: usize = 4000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistingInfrastructure {
    pub found: bool,
    pub resources: Vec<String>,
    pub locations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyReport {
    pub destroyed: bool,
    pub resources_destroyed: Vec<String>,
    pub locations: Vec<String>,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionReport {
    pub logs: Vec<String>,
    pub resources: ProvisionedResources,
    pub cleanup: DestroyReport,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationStatus {
    pub location: String,
    pub path: PathBuf,
    pub has_state: bool,
    pub placeholder: bool,
    pub has_artifacts: bool,
    pub resources: Vec<String>,
}

/// Read-only view of a project's local state, no Terraform invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfraStatus {
    pub project_id: String,
    pub authoritative: Option<String>,
    pub locations: Vec<LocationStatus>,
}

/// Held for the duration of one lifecycle operation on a project.
struct ProjectLock {
    file: File,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(error = %e, "failed to release infra lock file");
        }
    }
}

pub struct InfraLifecycleManager {
    root: PathBuf,
    terraform: TerraformCli,
    default_provider: String,
    default_region: String,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl InfraLifecycleManager {
    pub fn new(root: impl Into<PathBuf>, terraform: TerraformCli) -> Self {
        Self {
            root: root.into(),
            terraform,
            default_provider: "aws".to_string(),
            default_region: "us-east-1".to_string(),
            locks: DashMap::new(),
        }
    }

    pub fn from_config(config: &ShipyardConfig) -> Self {
        let terraform = TerraformCli::new(
            config.infra.terraform_bin.clone(),
            Duration::from_secs(config.infra.timeout_secs),
        );
        Self::new(config.paths.infra_root.clone(), terraform)
            .with_defaults(&config.infra.default_provider, &config.infra.default_region)
    }

    pub fn with_defaults(mut self, provider: &str, region: &str) -> Self {
        self.default_provider = provider.to_string();
        self.default_region = region.to_string();
        self
    }

    pub fn project_root(&self, project_id: &str) -> Result<PathBuf, InfraError> {
        let valid = !project_id.is_empty()
            && project_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(InfraError::InvalidProjectId(project_id.to_string()));
        }
        Ok(self.root.join(project_id))
    }

    async fn lock(&self, project_id: &str) -> Result<ProjectLock, InfraError> {
        let root = self.project_root(project_id)?;
        let mutex = Arc::clone(
            self.locks
                .entry(project_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let guard = mutex.lock_owned().await;

        let lock_path = root.join(LOCK_FILE);
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
            std::fs::create_dir_all(&root)?;
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(root.join(LOCK_FILE))?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(std::io::Error::other)
        .and_then(|r| r)
        .map_err(|source| InfraError::Io {
            path: lock_path,
            source,
        })?;

        Ok(ProjectLock {
            file,
            _guard: guard,
        })
    }

    /// Snapshot of both state locations straight from disk.
    pub fn status(&self, project_id: &str) -> Result<InfraStatus, InfraError> {
        let root = self.project_root(project_id)?;
        let locations = StateLocation::ALL
            .into_iter()
            .map(|loc| {
                let dir = loc.path(&root);
                LocationStatus {
                    location: loc.to_string(),
                    has_state: state::has_state(&dir),
                    placeholder: state::is_placeholder(&dir),
                    has_artifacts: state::has_artifacts(&dir),
                    resources: state::resource_addresses(&dir),
                    path: dir,
                }
            })
            .collect();
        Ok(InfraStatus {
            project_id: project_id.to_string(),
            authoritative: state::authoritative_location(&root).map(|l| l.to_string()),
            locations,
        })
    }

    /// List resources tracked in any state location of the project.
    pub async fn check_existing(&self, project_id: &str) -> Result<ExistingInfrastructure, InfraError> {
        let _lock = self.lock(project_id).await?;
        let root = self.project_root(project_id)?;

        let mut report = ExistingInfrastructure::default();
        let mut seen = BTreeSet::new();
        for loc in state::locations_with_state(&root) {
            let dir = loc.path(&root);
            let resources = self.list_resources(&dir).await;
            report.locations.push(loc.to_string());
            for r in resources {
                if seen.insert(r.clone()) {
                    report.resources.push(r);
                }
            }
        }
        report.found = !report.locations.is_empty();
        info!(
            project_id,
            found = report.found,
            resources = report.resources.len(),
            "checked existing infrastructure"
        );
        Ok(report)
    }

    async fn list_resources(&self, dir: &Path) -> Vec<String> {
        match self.terraform.state_list(dir).await {
            Ok(list) => return list,
            Err(e) => debug!(dir = %dir.display(), error = %e, "state list failed, initializing"),
        }
        if self.terraform.init(dir).await.is_ok() {
            if let Ok(list) = self.terraform.state_list(dir).await {
                return list;
            }
        }
        state::resource_addresses(dir)
    }

    /// Destroy whatever any state location still tracks for the project.
    pub async fn destroy_existing(&self, project_id: &str) -> Result<DestroyReport, InfraError> {
        let _lock = self.lock(project_id).await?;
        self.destroy_locked(project_id).await
    }

    async fn destroy_locked(&self, project_id: &str) -> Result<DestroyReport, InfraError> {
        let root = self.project_root(project_id)?;
        let mut report = DestroyReport::default();

        let ordered = state::locations_with_state(&root);
        if ordered.is_empty() {
            debug!(project_id, "no infrastructure state to destroy");
            return Ok(report);
        }

        for loc in ordered {
            let dir = loc.path(&root);
            if !state::has_state(&dir) {
                continue;
            }
            info!(project_id, location = %loc, "destroying existing infrastructure");
            let destroyed = self.destroy_location(&dir, &mut report.logs).await?;
            report.destroyed = true;
            report.locations.push(loc.to_string());
            for r in destroyed {
                if !report.resources_destroyed.contains(&r) {
                    report.resources_destroyed.push(r);
                }
            }
        }

        info!(
            project_id,
            resources = report.resources_destroyed.len(),
            "existing infrastructure destroyed"
        );
        Ok(report)
    }

    async fn destroy_location(&self, dir: &Path, logs: &mut Vec<String>) -> Result<Vec<String>, InfraError> {
        let resources = match self.init_and_destroy(dir, logs).await {
            Ok(resources) => resources,
            Err(e) => {
                // A placeholder left next to real configuration blocks every later apply.
                match state::remove_placeholder(dir) {
                    Ok(true) => debug!(dir = %dir.display(), "removed placeholder after failed destroy"),
                    Ok(false) => {}
                    Err(clean) => warn!(dir = %dir.display(), error = %clean, "failed to remove placeholder"),
                }
                return Err(e);
            }
        };

        let removed = state::clean_artifacts(dir)?;
        debug!(dir = %dir.display(), removed = ?removed, "cleaned state artifacts");
        Ok(resources)
    }

    async fn init_and_destroy(&self, dir: &Path, logs: &mut Vec<String>) -> Result<Vec<String>, InfraError> {
        let mut resources = state::resource_addresses(dir);

        if !state::has_configuration(dir) {
            self.placeholder(dir, logs)?;
        }
        match self.terraform.init(dir).await {
            Ok(out) => logs.push(format!("[init] {}", tail(&out.combined(), LOG_TAIL))),
            Err(e) if is_missing_configuration(&e) => {
                self.placeholder(dir, logs)?;
                let out = self.terraform.init(dir).await?;
                logs.push(format!("[init] {}", tail(&out.combined(), LOG_TAIL)));
            }
            Err(e) => return Err(e),
        }

        if resources.is_empty() {
            // State didn't parse; ask the engine now that it is initialized.
            resources = self.terraform.state_list(dir).await.unwrap_or_default();
        }

        let out = self.terraform.destroy(dir).await?;
        logs.push(format!("[destroy] {}", tail(&out.combined(), LOG_TAIL)));
        Ok(resources)
    }

    fn placeholder(&self, dir: &Path, logs: &mut Vec<String>) -> Result<(), InfraError> {
        let providers = state::write_placeholder(dir, &self.default_provider, &self.default_region)?;
        warn!(
            dir = %dir.display(),
            providers = ?providers,
            "configuration missing, destroying with placeholder providers"
        );
        logs.push(format!(
            "[placeholder] providers: {}",
            providers.into_iter().collect::<Vec<_>>().join(", ")
        ));
        Ok(())
    }

    /// Destroy leftovers, then apply `source` in the deployment location.
    pub async fn provision(&self, project_id: &str, source: &str) -> Result<ProvisionReport, InfraError> {
        let _lock = self.lock(project_id).await?;
        let root = self.project_root(project_id)?;
        let mut logs = Vec::new();

        let cleanup = match self.destroy_locked(project_id).await {
            Ok(report) => {
                if report.destroyed {
                    logs.push(format!(
                        "Destroyed {} existing resource(s) before provisioning",
                        report.resources_destroyed.len()
                    ));
                }
                report
            }
            Err(e) => {
                warn!(project_id, error = %e, "pre-provision cleanup failed, continuing");
                logs.push(format!("Pre-provision cleanup failed: {}", e));
                DestroyReport::default()
            }
        };

        let dir = StateLocation::Deployment.path(&root);
        std::fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        let stale_plan = dir.join(terraform::PLAN_FILE);
        if stale_plan.exists() {
            std::fs::remove_file(&stale_plan).map_err(|e| io_error(&stale_plan, e))?;
        }
        if state::remove_placeholder(&dir)? {
            logs.push("Removed leftover placeholder configuration".to_string());
        }
        let source_path = dir.join(SOURCE_FILE);
        std::fs::write(&source_path, source).map_err(|e| io_error(&source_path, e))?;

        match self.terraform.init(&dir).await {
            Ok(out) => logs.push(format!("[init] {}", tail(&out.combined(), LOG_TAIL))),
            Err(e) => return Err(failed("init", e, logs)),
        }
        match self.terraform.plan(&dir).await {
            Ok(out) => logs.push(format!("[plan] {}", tail(&out.combined(), LOG_TAIL))),
            Err(e) => return Err(failed("plan", e, logs)),
        }

        if state::is_placeholder(&dir) {
            return Err(InfraError::PlaceholderApply { dir });
        }
        match self.terraform.apply_plan(&dir).await {
            Ok(out) => logs.push(format!("[apply] {}", tail(&out.combined(), LOG_TAIL))),
            Err(e) => return Err(failed("apply", e, logs)),
        }

        let resources = match self.terraform.output_json(&dir).await {
            Ok(doc) => ProvisionedResources::from_output_json(&doc),
            Err(e) => Err(e),
        };
        let resources = match resources {
            Ok(r) => r,
            Err(e) => return Err(failed("output", e, logs)),
        };

        info!(
            project_id,
            outputs = ?resources.redacted(),
            "infrastructure provisioned"
        );
        logs.push(format!("Provisioned {} output(s)", resources.outputs.len()));
        Ok(ProvisionReport {
            logs,
            resources,
            cleanup,
        })
    }
}

fn io_error(path: &Path, source: std::io::Error) -> InfraError {
    InfraError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn failed(step: &str, err: InfraError, mut logs: Vec<String>) -> InfraError {
    logs.push(format!("[{}] {}", step, err));
    InfraError::ProvisionFailed {
        step: step.to_string(),
        message: err.to_string(),
        logs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_root_rejects_unsafe_ids() {
        let mgr = InfraLifecycleManager::new("/tmp/infra", TerraformCli::new("terraform", Duration::from_secs(1)));
        assert!(mgr.project_root("p1").is_ok());
        assert!(matches!(
            mgr.project_root("../p1"),
            Err(InfraError::InvalidProjectId(_))
        ));
        assert!(mgr.project_root("").is_err());
    }

    #[tokio::test]
    async fn test_destroy_without_state_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = InfraLifecycleManager::new(
            dir.path(),
            TerraformCli::new("/nonexistent/terraform", Duration::from_secs(1)),
        );
        let report = mgr.destroy_existing("p1").await.unwrap();
        assert!(!report.destroyed);
        assert!(report.resources_destroyed.is_empty());
        assert!(dir.path().join("p1").join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_status_reads_state_files() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = InfraLifecycleManager::new(
            dir.path(),
            TerraformCli::new("/nonexistent/terraform", Duration::from_secs(1)),
        );
        let validation = dir.path().join("p1/validation");
        std::fs::create_dir_all(&validation).unwrap();
        std::fs::write(
            validation.join(state::STATE_FILE),
            r#"{"resources":[{"mode":"managed","type":"aws_s3_bucket","name":"b"}]}"#,
        )
        .unwrap();

        let status = mgr.status("p1").unwrap();
        assert_eq!(status.authoritative.as_deref(), Some("validation"));
        assert_eq!(status.locations[0].resources, vec!["aws_s3_bucket.b"]);
        assert!(!status.locations[1].has_state);
    }

    #[tokio::test]
    async fn test_check_existing_falls_back_to_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = InfraLifecycleManager::new(
            dir.path(),
            TerraformCli::new("/nonexistent/terraform", Duration::from_secs(1)),
        );
        let deployment = dir.path().join("p1/deployment");
        std::fs::create_dir_all(&deployment).unwrap();
        std::fs::write(
            deployment.join(state::STATE_FILE),
            r#"{"resources":[{"mode":"managed","type":"aws_ecr_repository","name":"api"}]}"#,
        )
        .unwrap();

        let existing = mgr.check_existing("p1").await.unwrap();
        assert!(existing.found);
        assert_eq!(existing.resources, vec!["aws_ecr_repository.api"]);
        assert_eq!(existing.locations, vec!["deployment"]);
    }

    #[tokio::test]
    async fn test_concurrent_operations_on_one_project_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = Arc::new(InfraLifecycleManager::new(
            dir.path(),
            TerraformCli::new("/nonexistent/terraform", Duration::from_secs(1)),
        ));
        let held = mgr.lock("p1").await.unwrap();
        let mgr2 = Arc::clone(&mgr);
        let waiter = tokio::spawn(async move { mgr2.destroy_existing("p1").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    /// Terraform stand-in whose `destroy` always fails.
    #[cfg(unix)]
    fn terraform_failing_destroy(dir: &Path) -> TerraformCli {
        use std::os::unix::fs::PermissionsExt;

        let script = r#"#!/bin/sh
case "$1" in
  plan) echo plan > tfplan ;;
  apply) echo '{"version":4,"resources":[{"mode":"managed","type":"aws_s3_bucket","name":"site"}]}' > terraform.tfstate ;;
  destroy) echo "Error: deleting aws_s3_bucket.site: AccessDenied" >&2; exit 1 ;;
  output) echo '{"frontend_url":{"sensitive":false,"value":"site.example.com"}}' ;;
esac
exit 0
"#;
        let path = dir.join("terraform");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        TerraformCli::new(path.to_string_lossy(), Duration::from_secs(10))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_cleanup_does_not_block_provision() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = InfraLifecycleManager::new(dir.path().join("infra"), terraform_failing_destroy(dir.path()));
        let deployment = dir.path().join("infra/p1/deployment");
        std::fs::create_dir_all(&deployment).unwrap();
        std::fs::write(
            deployment.join(state::STATE_FILE),
            r#"{"resources":[{"mode":"managed","type":"aws_s3_bucket","name":"old"}]}"#,
        )
        .unwrap();

        for _ in 0..2 {
            let report = mgr.provision("p1", "resource \"aws_s3_bucket\" \"site\" {}").await.unwrap();
            assert!(!report.cleanup.destroyed);
            assert!(report.logs.iter().any(|l| l.starts_with("Pre-provision cleanup failed")));
            assert_eq!(report.resources.frontend_url.as_deref(), Some("http://site.example.com"));
            assert!(!state::is_placeholder(&deployment));
            assert!(!deployment.join(state::PLACEHOLDER_FILE).exists());
            assert!(deployment.join(SOURCE_FILE).is_file());
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_provision_strips_leftover_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = InfraLifecycleManager::new(dir.path().join("infra"), terraform_failing_destroy(dir.path()));
        let deployment = dir.path().join("infra/p1/deployment");
        std::fs::create_dir_all(&deployment).unwrap();
        state::write_placeholder(&deployment, "aws", "us-east-1").unwrap();

        let report = mgr.provision("p1", "resource \"aws_s3_bucket\" \"site\" {}").await.unwrap();
        assert!(report.logs.iter().any(|l| l == "Removed leftover placeholder configuration"));
        assert!(!state::is_placeholder(&deployment));
    }
}
