//! Deployment pipeline runner.
//!
//! One deployment per project at a time: a lease keyed by project id is
//! taken when the job is created and released when its background task
//! ends, however it ends.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::prep;
use super::publish;
use super::verify::Verifier;
use super::{DeploymentJob, DeploymentPhase};
use crate::config::ShipyardConfig;
use crate::errors::{JobError, PipelineError};
use crate::infra::{InfraLifecycleManager, ProvisionedResources};
use crate::jobs::{JobRegistry, JobStatus};
use crate::project::{DeploymentStatus, Project, ProjectStore};
use crate::sandbox::SandboxJob;
use crate::sandbox::toolchain::is_non_empty_dir;

/// Lease holder recorded while an infrastructure operation runs outside a deployment.
pub const MAINTENANCE_HOLDER: &str = "infrastructure-maintenance";

/// Held by a running deployment; releases the project on drop.
#[derive(Debug)]
pub struct DeploymentLease {
    leases: Arc<DashMap<String, String>>,
    project_id: String,
}

impl Drop for DeploymentLease {
    fn drop(&mut self) {
        self.leases.remove(&self.project_id);
    }
}

pub struct DeploymentPipeline {
    jobs: Arc<JobRegistry<DeploymentJob>>,
    sandbox_jobs: Arc<JobRegistry<SandboxJob>>,
    store: Arc<dyn ProjectStore>,
    infra: Arc<InfraLifecycleManager>,
    config: Arc<ShipyardConfig>,
    leases: Arc<DashMap<String, String>>,
}

impl DeploymentPipeline {
    pub fn new(
        jobs: Arc<JobRegistry<DeploymentJob>>,
        sandbox_jobs: Arc<JobRegistry<SandboxJob>>,
        store: Arc<dyn ProjectStore>,
        infra: Arc<InfraLifecycleManager>,
        config: Arc<ShipyardConfig>,
    ) -> Self {
        Self {
            jobs,
            sandbox_jobs,
            store,
            infra,
            config,
            leases: Arc::new(DashMap::new()),
        }
    }

    pub fn jobs(&self) -> &Arc<JobRegistry<DeploymentJob>> {
        &self.jobs
    }

    /// Job id of the deployment currently running for `project_id`.
    pub fn active_job(&self, project_id: &str) -> Option<String> {
        self.leases.get(project_id).map(|e| e.value().clone())
    }

    pub async fn start(
        self: &Arc<Self>,
        project_id: &str,
        sandbox_job_id: Option<String>,
    ) -> Result<String, PipelineError> {
        if self.store.get_project(project_id).await?.is_none() {
            return Err(PipelineError::ProjectNotFound {
                id: project_id.to_string(),
            });
        }
        let (job_id, lease) = self.reserve(project_id, sandbox_job_id)?;
        info!(job_id = %job_id, project_id, "deployment queued");

        let this = Arc::clone(self);
        let id = job_id.clone();
        let project = project_id.to_string();
        tokio::spawn(async move {
            this.run(&id, &project).await;
            drop(lease);
        });
        Ok(job_id)
    }

    /// Take the project's lease and register a job under it.
    pub fn reserve(
        &self,
        project_id: &str,
        sandbox_job_id: Option<String>,
    ) -> Result<(String, DeploymentLease), PipelineError> {
        let job_id = match self.leases.entry(project_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(PipelineError::AlreadyRunning {
                    project_id: project_id.to_string(),
                });
            }
            Entry::Vacant(slot) => {
                let id = self
                    .jobs
                    .create(|record| DeploymentJob::new(record, project_id, sandbox_job_id));
                slot.insert(id.clone());
                id
            }
        };
        let lease = DeploymentLease {
            leases: Arc::clone(&self.leases),
            project_id: project_id.to_string(),
        };
        Ok((job_id, lease))
    }

    /// Hold the project's lease for an infrastructure operation outside a
    /// deployment. No deployment can start until the lease is dropped.
    pub fn lease_for_maintenance(&self, project_id: &str) -> Result<DeploymentLease, PipelineError> {
        match self.leases.entry(project_id.to_string()) {
            Entry::Occupied(_) => Err(PipelineError::AlreadyRunning {
                project_id: project_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(MAINTENANCE_HOLDER.to_string());
                Ok(DeploymentLease {
                    leases: Arc::clone(&self.leases),
                    project_id: project_id.to_string(),
                })
            }
        }
    }

    pub async fn status(&self, job_id: &str) -> Option<DeploymentJob> {
        self.jobs.get(job_id).await
    }

    /// Run every phase to completion.
    pub async fn run(&self, job_id: &str, project_id: &str) {
        if let Err(e) = self.execute(job_id, project_id).await {
            error!(job_id, project_id, error = %e, "deployment failed");
            let status = DeploymentStatus::Failed {
                error: e.to_string(),
            };
            if let Err(store_err) = self.set_status(project_id, status).await {
                warn!(project_id, error = %store_err, "could not record deployment failure");
            }
            if let Err(fail_err) = self.jobs.fail(job_id, e.to_string()).await {
                warn!(job_id, error = %fail_err, "could not mark deployment job failed");
            }
        }
    }

    async fn log(&self, job_id: &str, line: impl Into<String>) {
        let line = line.into();
        info!(job_id, "{}", line);
        if let Err(e) = self
            .jobs
            .mutate(job_id, |job| job.deployment_logs.push(line))
            .await
        {
            debug!(job_id, error = %e, "dropped deployment log line");
        }
    }

    async fn load_project(&self, project_id: &str) -> Result<Project, PipelineError> {
        self.store
            .get_project(project_id)
            .await?
            .ok_or_else(|| PipelineError::ProjectNotFound {
                id: project_id.to_string(),
            })
    }

    async fn set_status(&self, project_id: &str, status: DeploymentStatus) -> anyhow::Result<()> {
        let Some(mut project) = self.store.get_project(project_id).await? else {
            return Ok(());
        };
        project.deployment_status = status;
        project.touch();
        self.store.save_project(&project).await
    }

    async fn execute(&self, job_id: &str, project_id: &str) -> Result<(), PipelineError> {
        // sandbox_validation
        self.jobs
            .advance(job_id, DeploymentPhase::SandboxValidation)
            .await?;
        let sandbox_job_id = self
            .jobs
            .peek(job_id)
            .await
            .ok_or_else(|| JobError::NotFound { id: job_id.to_string() })?
            .sandbox_job_id;
        let (mut project, infrastructure_source) =
            self.validate(project_id, sandbox_job_id.as_deref()).await?;
        project.deployment_status = DeploymentStatus::InProgress {
            job_id: job_id.to_string(),
        };
        project.touch();
        self.store.save_project(&project).await?;
        self.log(job_id, "Sandbox validation passed").await;

        // production_prep
        self.jobs
            .advance(job_id, DeploymentPhase::ProductionPrep)
            .await?;
        let source_dir = self.config.project_dir(project_id);
        let deploy_dir = self.config.paths.deploy_root.join(project_id);
        let prepared = tokio::task::spawn_blocking(move || prep::prepare(&source_dir, &deploy_dir))
            .await
            .map_err(|e| PipelineError::Prep(e.to_string()))?
            .map_err(|e| PipelineError::Prep(format!("{:#}", e)))?;
        for step in &prepared.steps {
            self.log(job_id, step.clone()).await;
        }

        // infrastructure_deploy
        self.jobs
            .advance(job_id, DeploymentPhase::InfrastructureDeploy)
            .await?;
        let report = match self.infra.provision(project_id, &infrastructure_source).await {
            Ok(report) => report,
            Err(e) => {
                let logs = e.logs().to_vec();
                if let Err(log_err) = self
                    .jobs
                    .mutate(job_id, |job| job.deployment_logs.extend(logs))
                    .await
                {
                    debug!(job_id, error = %log_err, "dropped provisioning logs");
                }
                return Err(e.into());
            }
        };
        let resources = report.resources;
        let mut project = self.load_project(project_id).await?;
        project.infrastructure_outputs = resources.to_map();
        project.touch();
        self.store.save_project(&project).await?;

        let visible = ProvisionedResources {
            outputs: resources.redacted(),
            ..resources.clone()
        };
        let logs = report.logs;
        self.jobs
            .mutate(job_id, |job| {
                job.deployment_logs.extend(logs);
                job.resources = Some(visible);
            })
            .await?;

        // application_deploy
        self.jobs
            .advance(job_id, DeploymentPhase::ApplicationDeploy)
            .await?;
        let published = publish::publish(&prepared, &resources, &self.config, project_id).await;
        let frontend_url = resources.frontend_url.clone();
        let backend_url = resources.backend_url.clone();
        self.jobs
            .mutate(job_id, |job| {
                job.deployment_logs.extend(published.logs);
                job.frontend_url = frontend_url.clone();
                job.backend_url = backend_url.clone();
            })
            .await?;
        if !published.warnings.is_empty() {
            warn!(
                job_id,
                warnings = published.warnings.len(),
                "application deploy finished with warnings"
            );
        }

        // testing
        self.jobs.advance(job_id, DeploymentPhase::Testing).await?;
        let verifier = Verifier::new(Duration::from_secs(self.config.deploy.verify_timeout_secs));
        let verification = verifier
            .verify(frontend_url.as_deref(), backend_url.as_deref())
            .await;
        self.log(
            job_id,
            format!(
                "Verification: backend health {}, frontend {}, integration {}",
                pass(verification.backend_health.passed),
                pass(verification.frontend_reachable.passed),
                pass(verification.integration.passed),
            ),
        )
        .await;
        let recorded = verification.clone();
        self.jobs
            .mutate(job_id, |job| job.verification = Some(recorded))
            .await?;

        // completed
        let mut project = self.load_project(project_id).await?;
        project.production_frontend_url = frontend_url.clone();
        project.production_backend_url = backend_url.clone();
        project.verification = Some(verification.clone());
        project.deployment_status = DeploymentStatus::Deployed;
        project.deployed_at = Some(Utc::now());
        project.touch();
        self.store.save_project(&project).await?;

        let summary = json!({
            "frontendUrl": frontend_url,
            "backendUrl": backend_url,
            "verified": verification.all_passed(),
        });
        self.jobs.finish(job_id, Some(summary)).await?;
        info!(job_id, project_id, verified = verification.all_passed(), "deployment completed");
        Ok(())
    }

    /// Preconditions for a deployment. Returns the project and its
    /// infrastructure source.
    async fn validate(
        &self,
        project_id: &str,
        sandbox_job_id: Option<&str>,
    ) -> Result<(Project, String), PipelineError> {
        let project = self.load_project(project_id).await?;
        let not_ready = |reason: String| PipelineError::SandboxNotReady {
            project_id: project_id.to_string(),
            reason,
        };

        if !project.sandbox.ready {
            return Err(not_ready("sandbox has not completed".to_string()));
        }
        let sandbox = &project.sandbox;
        if !sandbox.build_errors.is_empty() || !sandbox.runtime_errors.is_empty() {
            return Err(not_ready(format!(
                "{} build error(s) and {} runtime error(s) recorded",
                sandbox.build_errors.len(),
                sandbox.runtime_errors.len()
            )));
        }
        if let Some(id) = sandbox_job_id {
            if let Some(job) = self.sandbox_jobs.peek(id).await {
                if job.record.status != JobStatus::Completed {
                    return Err(not_ready(format!(
                        "sandbox job {} is {}",
                        id,
                        job.record.status.as_str()
                    )));
                }
            }
        }

        let project_dir = self.config.project_dir(project_id);
        for side in ["frontend", "backend"] {
            if !is_non_empty_dir(&project_dir.join(side)) {
                return Err(PipelineError::SourceMissing {
                    project_id: project_id.to_string(),
                    detail: format!("{}/ is missing or empty", side),
                });
            }
        }
        let source = project
            .infrastructure_source(&project_dir)
            .ok_or_else(|| PipelineError::SourceMissing {
                project_id: project_id.to_string(),
                detail: "no infrastructure source".to_string(),
            })?;
        Ok((project, source))
    }
}

fn pass(ok: bool) -> &'static str {
    if ok { "passed" } else { "failed" }
}
