//! Integration tests for shipyard
//!
//! These drive the public library surface and the binary against a fake
//! `terraform` that keeps a resource ledger on disk.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Helper to create a shipyard Command
fn shipyard() -> Command {
    cargo_bin_cmd!("shipyard")
}

/// A fake `terraform` that applies two resources, reports outputs pointing
/// at `frontend_url` and `backend_url`, and appends every invocation to
/// `<dir>/ledger.log` as `<working dir name> <subcommand>`.
#[cfg(unix)]
fn fake_terraform(dir: &Path, frontend_url: &str, backend_url: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let ledger = dir.join("ledger.log");
    let script = r#"#!/bin/sh
echo "$(basename "$PWD") $1" >> "@LEDGER@"
case "$1" in
  init)
    mkdir -p .terraform
    echo "Terraform has been successfully initialized!"
    ;;
  plan)
    echo "plan" > tfplan
    echo "Plan: 2 to add, 0 to change, 0 to destroy."
    ;;
  apply)
    cat > terraform.tfstate <<'EOF'
{"version":4,"resources":[
  {"mode":"managed","type":"aws_s3_bucket","name":"site","provider":"provider[\"registry.terraform.io/hashicorp/aws\"]","instances":[]},
  {"mode":"managed","type":"aws_ecs_service","name":"api","provider":"provider[\"registry.terraform.io/hashicorp/aws\"]","instances":[]}
]}
EOF
    echo "Apply complete! Resources: 2 added, 0 changed, 0 destroyed."
    ;;
  destroy)
    echo '{"version":4,"resources":[]}' > terraform.tfstate
    echo "Destroy complete! Resources: 2 destroyed."
    ;;
  state)
    if grep -q aws_s3_bucket terraform.tfstate 2>/dev/null; then
      printf 'aws_s3_bucket.site\naws_ecs_service.api\n'
    fi
    ;;
  output)
    cat <<'EOF'
{
  "frontend_url": {"sensitive": false, "type": "string", "value": "@FRONTEND@"},
  "backend_url": {"sensitive": false, "type": "string", "value": "@BACKEND@"},
  "db_password": {"sensitive": true, "type": "string", "value": "hunter2"}
}
EOF
    ;;
esac
exit 0
"#
    .replace("@LEDGER@", &ledger.display().to_string())
    .replace("@FRONTEND@", frontend_url)
    .replace("@BACKEND@", backend_url);

    let path = dir.join("terraform");
    fs::write(&path, script).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

#[cfg(unix)]
fn ledger(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("ledger.log"))
        .unwrap_or_default()
        .lines()
        .map(String::from)
        .collect()
}

const SOURCE: &str = r#"resource "aws_s3_bucket" "site" {}
resource "aws_ecs_service" "api" {}
"#;

// =============================================================================
// CLI
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_shipyard_help() {
        shipyard()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("infra"));
    }

    #[test]
    fn test_shipyard_version() {
        shipyard().arg("--version").assert().success();
    }

    #[test]
    fn test_config_show_without_file_prints_defaults() {
        let dir = TempDir::new().unwrap();
        shipyard()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("showing defaults"))
            .stdout(predicate::str::contains("[server]"))
            .stdout(predicate::str::contains("terraform_bin"));
    }

    #[test]
    fn test_config_validate_rejects_overlapping_ports() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shipyard.toml");
        fs::write(
            &path,
            "[runtime]\nfrontend_ports = [5000, 5100]\nbackend_ports = [5050, 5200]\n",
        )
        .unwrap();
        shipyard()
            .arg("--config")
            .arg(&path)
            .args(["config", "validate"])
            .assert()
            .failure();
    }

    #[test]
    fn test_infra_status_for_unknown_project() {
        let dir = TempDir::new().unwrap();
        shipyard()
            .current_dir(dir.path())
            .env("SHIPYARD_INFRA_ROOT", dir.path().join("infra"))
            .args(["infra", "status", "p1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Authoritative location: (none)"));
    }

    #[test]
    fn test_infra_status_rejects_path_like_project_ids() {
        let dir = TempDir::new().unwrap();
        shipyard()
            .current_dir(dir.path())
            .env("SHIPYARD_INFRA_ROOT", dir.path().join("infra"))
            .args(["infra", "status", "../escape"])
            .assert()
            .failure();
    }

    #[cfg(unix)]
    #[test]
    fn test_infra_provision_then_destroy() {
        let dir = TempDir::new().unwrap();
        let terraform = fake_terraform(dir.path(), "https://site.example", "https://api.example");
        let source = dir.path().join("main.tf");
        fs::write(&source, SOURCE).unwrap();

        shipyard()
            .current_dir(dir.path())
            .env("SHIPYARD_INFRA_ROOT", dir.path().join("infra"))
            .env("SHIPYARD_TERRAFORM_BIN", &terraform)
            .args(["infra", "provision", "p1", "--source"])
            .arg(&source)
            .assert()
            .success()
            .stdout(predicate::str::contains("Provisioned p1"))
            .stdout(predicate::str::contains("hunter2").not());

        shipyard()
            .current_dir(dir.path())
            .env("SHIPYARD_INFRA_ROOT", dir.path().join("infra"))
            .env("SHIPYARD_TERRAFORM_BIN", &terraform)
            .args(["infra", "destroy", "p1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Destroyed 2 resource(s)"));
    }
}

// =============================================================================
// Infrastructure lifecycle
// =============================================================================

#[cfg(unix)]
mod infra_lifecycle {
    use super::*;
    use shipyard::infra::InfraLifecycleManager;
    use shipyard::infra::state::{self, StateLocation};
    use shipyard::infra::terraform::TerraformCli;

    fn manager(dir: &Path) -> InfraLifecycleManager {
        let terraform = fake_terraform(dir, "site.example.com", "https://api.example.com");
        InfraLifecycleManager::new(
            dir.join("infra"),
            TerraformCli::new(terraform.display().to_string(), Duration::from_secs(30)),
        )
    }

    #[tokio::test]
    async fn test_first_provision_destroys_nothing() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(dir.path());

        let report = mgr.provision("p1", SOURCE).await.unwrap();
        assert!(!report.cleanup.destroyed);
        assert!(report.cleanup.resources_destroyed.is_empty());
        assert_eq!(
            report.resources.frontend_url.as_deref(),
            Some("http://site.example.com")
        );
        assert_eq!(
            report.resources.backend_url.as_deref(),
            Some("https://api.example.com")
        );
        assert!(report.resources.is_sensitive("db_password"));
        assert!(report.logs.iter().any(|l| l.starts_with("[apply]")));

        let root = mgr.project_root("p1").unwrap();
        assert!(state::has_state(&StateLocation::Deployment.path(&root)));
    }

    #[tokio::test]
    async fn test_second_provision_destroys_previous_resources_first() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(dir.path());

        mgr.provision("p1", SOURCE).await.unwrap();
        let second = mgr.provision("p1", SOURCE).await.unwrap();

        assert!(second.cleanup.destroyed);
        assert_eq!(second.cleanup.locations, vec!["deployment".to_string()]);
        assert_eq!(
            second.cleanup.resources_destroyed,
            vec![
                "aws_s3_bucket.site".to_string(),
                "aws_ecs_service.api".to_string()
            ]
        );
        assert!(second
            .logs
            .iter()
            .any(|l| l.contains("Destroyed 2 existing resource(s)")));

        // The destroy ran before the second apply.
        let calls = ledger(dir.path());
        let destroy = calls.iter().position(|c| c == "deployment destroy").unwrap();
        let last_apply = calls.iter().rposition(|c| c == "deployment apply").unwrap();
        assert!(destroy < last_apply, "{:?}", calls);

        // Exactly one set of resources remains tracked.
        let existing = mgr.check_existing("p1").await.unwrap();
        assert!(existing.found);
        assert_eq!(existing.resources.len(), 2);
    }

    #[tokio::test]
    async fn test_destroy_state_without_source_uses_placeholder() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(dir.path());
        let root = mgr.project_root("p1").unwrap();
        let validation = StateLocation::Validation.path(&root);
        fs::create_dir_all(&validation).unwrap();
        fs::write(
            validation.join(state::STATE_FILE),
            r#"{"version":4,"resources":[{"mode":"managed","type":"aws_s3_bucket","name":"orphan","provider":"provider[\"registry.terraform.io/hashicorp/aws\"]","instances":[]}]}"#,
        )
        .unwrap();

        let report = mgr.destroy_existing("p1").await.unwrap();
        assert!(report.destroyed);
        assert_eq!(report.locations, vec!["validation".to_string()]);
        assert_eq!(report.resources_destroyed, vec!["aws_s3_bucket.orphan".to_string()]);
        assert!(report.logs.iter().any(|l| l.starts_with("[placeholder]")));

        assert!(!state::has_state(&validation));
        assert!(!state::has_artifacts(&validation));
        assert_eq!(
            ledger(dir.path()),
            vec!["validation init".to_string(), "validation destroy".to_string()]
        );
    }

    #[tokio::test]
    async fn test_destroy_without_any_state_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(dir.path());

        let report = mgr.destroy_existing("p1").await.unwrap();
        assert!(!report.destroyed);
        assert!(ledger(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_state_in_both_locations_is_destroyed_everywhere() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(dir.path());
        mgr.provision("p1", SOURCE).await.unwrap();

        let root = mgr.project_root("p1").unwrap();
        let validation = StateLocation::Validation.path(&root);
        fs::create_dir_all(&validation).unwrap();
        fs::write(
            validation.join(state::STATE_FILE),
            r#"{"version":4,"resources":[{"mode":"managed","type":"random_id","name":"suffix","provider":"provider[\"registry.terraform.io/hashicorp/random\"]","instances":[]}]}"#,
        )
        .unwrap();

        let report = mgr.destroy_existing("p1").await.unwrap();
        assert_eq!(report.locations.len(), 2);
        assert_eq!(report.resources_destroyed.len(), 3);
        assert!(mgr.status("p1").unwrap().authoritative.is_none());
    }

    #[tokio::test]
    async fn test_failing_cleanup_is_a_warning_and_provision_still_applies() {
        let dir = TempDir::new().unwrap();
        let terraform = fake_terraform(dir.path(), "site.example.com", "https://api.example.com");
        let script = fs::read_to_string(&terraform).unwrap().replace(
            "  destroy)\n",
            "  destroy)\n    echo 'Error: DependencyViolation' >&2\n    exit 1\n",
        );
        fs::write(&terraform, script).unwrap();
        let mgr = InfraLifecycleManager::new(
            dir.path().join("infra"),
            TerraformCli::new(terraform.display().to_string(), Duration::from_secs(30)),
        );

        // Orphaned state with no source forces the placeholder path.
        let root = mgr.project_root("p1").unwrap();
        let deployment = StateLocation::Deployment.path(&root);
        fs::create_dir_all(&deployment).unwrap();
        fs::write(
            deployment.join(state::STATE_FILE),
            r#"{"version":4,"resources":[{"mode":"managed","type":"aws_s3_bucket","name":"orphan","provider":"provider[\"registry.terraform.io/hashicorp/aws\"]","instances":[]}]}"#,
        )
        .unwrap();

        for _ in 0..2 {
            let report = mgr.provision("p1", SOURCE).await.unwrap();
            assert!(!report.cleanup.destroyed);
            assert!(
                report.logs.iter().any(|l| l.contains("Pre-provision cleanup failed")),
                "{:?}",
                report.logs
            );
            assert_eq!(
                report.resources.frontend_url.as_deref(),
                Some("http://site.example.com")
            );
            assert!(!state::is_placeholder(&deployment));
            assert!(!deployment.join(state::PLACEHOLDER_FILE).exists());
        }
        assert_eq!(
            ledger(dir.path()).iter().filter(|l| *l == "deployment apply").count(),
            2
        );
    }
}

// =============================================================================
// Job registry retention
// =============================================================================

mod registry_retention {
    use super::*;
    use chrono::Utc;
    use shipyard::deploy::DeploymentJob;
    use shipyard::jobs::{JobRegistry, RetentionPolicy};

    fn registry(max_count: usize) -> JobRegistry<DeploymentJob> {
        JobRegistry::new(
            "deployment",
            RetentionPolicy {
                max_age: Duration::from_secs(3600),
                max_count,
            },
        )
    }

    async fn failed_job(registry: &JobRegistry<DeploymentJob>) -> String {
        let id = registry.create(|record| DeploymentJob::new(record, "p1", None));
        registry.fail(&id, "boom").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        id
    }

    #[tokio::test]
    async fn test_count_bound_keeps_most_recently_accessed() {
        let registry = registry(2);
        let a = failed_job(&registry).await;
        let b = failed_job(&registry).await;
        let c = failed_job(&registry).await;

        // Polling `a` makes `b` the least recently accessed.
        registry.get(&a).await.unwrap();

        let evicted = registry.sweep(Utc::now()).await;
        assert_eq!(evicted, vec![b.clone()]);
        assert!(registry.contains(&a));
        assert!(registry.contains(&c));
        assert!(registry.get(&b).await.is_none());
    }

    #[tokio::test]
    async fn test_running_jobs_are_never_evicted() {
        let registry = registry(1);
        let running: Vec<String> = (0..3)
            .map(|_| registry.create(|record| DeploymentJob::new(record, "p1", None)))
            .collect();
        let done = failed_job(&registry).await;

        let evicted = registry.sweep(Utc::now()).await;
        assert_eq!(evicted, vec![done]);
        for id in &running {
            assert!(registry.contains(id));
        }

        let later = Utc::now() + chrono::Duration::hours(48);
        assert!(registry.sweep(later).await.is_empty());
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_idle_terminal_jobs_expire() {
        let registry = registry(100);
        let id = failed_job(&registry).await;

        assert!(registry.sweep(Utc::now()).await.is_empty());
        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(registry.sweep(later).await, vec![id]);
        assert!(registry.is_empty());
    }
}

// =============================================================================
// Deployment end to end
// =============================================================================

#[cfg(unix)]
mod deployment_flow {
    use super::*;
    use axum::Router;
    use axum::http::header;
    use axum::routing::get;
    use shipyard::config::ShipyardConfig;
    use shipyard::deploy::{DeploymentPhase, DeploymentPipeline};
    use shipyard::infra::InfraLifecycleManager;
    use shipyard::infra::terraform::TerraformCli;
    use shipyard::jobs::{JobRegistry, JobStatus, RetentionPolicy};
    use shipyard::project::{DeploymentStatus, MemoryProjectStore, Project, ProjectStore};
    use std::sync::Arc;

    /// Serves `/` and a CORS-enabled `/health` standing in for both tiers.
    async fn live_app() -> String {
        let app = Router::new()
            .route("/", get(|| async { "<h1>app</h1>" }))
            .route(
                "/health",
                get(|| async { ([(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")], "ok") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn write_sources(workspace: &Path) {
        let fe = workspace.join("p1/frontend");
        let be = workspace.join("p1/backend");
        fs::create_dir_all(&fe).unwrap();
        fs::create_dir_all(&be).unwrap();
        fs::write(fe.join("index.html"), "<h1>hello</h1>").unwrap();
        fs::write(be.join("package.json"), r#"{"name":"api","scripts":{"start":"node server.js"}}"#)
            .unwrap();
        fs::write(be.join("server.js"), "console.log('up')").unwrap();
    }

    #[tokio::test]
    async fn test_deployment_reaches_completed_and_records_urls() {
        let dir = TempDir::new().unwrap();
        let url = live_app().await;
        let terraform = fake_terraform(dir.path(), &url, &url);

        let mut config = ShipyardConfig::default();
        config.paths.workspace_root = dir.path().join("projects");
        config.paths.deploy_root = dir.path().join("deployments");
        config.deploy.verify_timeout_secs = 5;
        write_sources(&config.paths.workspace_root);

        let mut project = Project::new("p1", "P1");
        project.sandbox.ready = true;
        project.infrastructure_code = Some(SOURCE.to_string());
        let store = Arc::new(MemoryProjectStore::with_projects([project]));

        let infra = InfraLifecycleManager::new(
            dir.path().join("infra"),
            TerraformCli::new(terraform.display().to_string(), Duration::from_secs(30)),
        );
        let pipeline = Arc::new(DeploymentPipeline::new(
            Arc::new(JobRegistry::new("deployment", RetentionPolicy::default())),
            Arc::new(JobRegistry::new("sandbox", RetentionPolicy::default())),
            store.clone(),
            Arc::new(infra),
            Arc::new(config),
        ));

        let id = pipeline.start("p1", None).await.unwrap();
        let mut job = None;
        for _ in 0..400 {
            let current = pipeline.status(&id).await.unwrap();
            if current.record.status.is_terminal() {
                job = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let job = job.expect("deployment never finished");

        assert_eq!(job.record.status, JobStatus::Completed, "{:?}", job.deployment_logs);
        assert_eq!(
            job.phase_history,
            vec![
                DeploymentPhase::SandboxValidation,
                DeploymentPhase::ProductionPrep,
                DeploymentPhase::InfrastructureDeploy,
                DeploymentPhase::ApplicationDeploy,
                DeploymentPhase::Testing,
                DeploymentPhase::Completed,
            ]
        );
        assert_eq!(job.frontend_url.as_deref(), Some(url.as_str()));
        assert!(job.verification.as_ref().unwrap().all_passed());

        // Sensitive outputs never reach the job view.
        let resources = job.resources.unwrap();
        assert_ne!(resources.outputs["db_password"], serde_json::json!("hunter2"));

        let project = store.get_project("p1").await.unwrap().unwrap();
        assert_eq!(project.deployment_status, DeploymentStatus::Deployed);
        assert_eq!(project.production_backend_url.as_deref(), Some(url.as_str()));
        assert!(project.deployed_at.is_some());
        assert_eq!(project.infrastructure_outputs["db_password"], serde_json::json!("hunter2"));

        assert!(dir.path().join("deployments/p1/backend/Dockerfile").is_file());

        // The lease is dropped right after the job turns terminal.
        for _ in 0..50 {
            if pipeline.active_job("p1").is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("lease for p1 was never released");
    }
}
