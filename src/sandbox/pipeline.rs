//! Sandbox pipeline runner.
//!
//! `start` validates the project, registers a job and returns its id; the
//! phases then run on a background task that records every step on the job
//! record. Install, build and runtime problems are diagnostics, not
//! failures: the pipeline reaches `completed` with them recorded. Only an
//! unexpected error (missing sources, store failure) ends in `failed`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::toolchain::{self, StepResult, Toolchain};
use super::{BuildTestReport, SandboxJob, SandboxPhase};
use crate::config::ShipyardConfig;
use crate::errors::PipelineError;
use crate::fixer::{CodeFixer, FixRequest};
use crate::jobs::{EvictionHook, JobRegistry};
use crate::project::ProjectStore;
use crate::runtime::{RuntimeProvisioner, Side};

/// Tears down a sandbox job's runtime instance when the job is evicted.
pub struct StopRuntimeOnEvict {
    runtime: Arc<RuntimeProvisioner>,
}

impl StopRuntimeOnEvict {
    pub fn new(runtime: Arc<RuntimeProvisioner>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl EvictionHook<SandboxJob> for StopRuntimeOnEvict {
    async fn on_evict(&self, job: &SandboxJob) {
        if self.runtime.stop_instance(&job.record.id).await {
            info!(job_id = %job.record.id, "stopped runtime of evicted sandbox job");
        }
    }
}

pub struct SandboxPipeline {
    jobs: Arc<JobRegistry<SandboxJob>>,
    store: Arc<dyn ProjectStore>,
    runtime: Arc<RuntimeProvisioner>,
    fixer: Arc<dyn CodeFixer>,
    config: Arc<ShipyardConfig>,
}

impl SandboxPipeline {
    pub fn new(
        jobs: Arc<JobRegistry<SandboxJob>>,
        store: Arc<dyn ProjectStore>,
        runtime: Arc<RuntimeProvisioner>,
        fixer: Arc<dyn CodeFixer>,
        config: Arc<ShipyardConfig>,
    ) -> Self {
        Self {
            jobs,
            store,
            runtime,
            fixer,
            config,
        }
    }

    pub fn jobs(&self) -> &Arc<JobRegistry<SandboxJob>> {
        &self.jobs
    }

    /// Validate the project exists, then run the sandbox in the background.
    pub async fn start(self: &Arc<Self>, project_id: &str) -> Result<String, PipelineError> {
        if self.store.get_project(project_id).await?.is_none() {
            return Err(PipelineError::ProjectNotFound {
                id: project_id.to_string(),
            });
        }

        let job_id = self.jobs.create(|record| SandboxJob::new(record, project_id));
        info!(job_id = %job_id, project_id, "sandbox run queued");

        let this = Arc::clone(self);
        let id = job_id.clone();
        let project = project_id.to_string();
        tokio::spawn(async move {
            this.run(&id, &project).await;
        });
        Ok(job_id)
    }

    pub async fn status(&self, job_id: &str) -> Option<SandboxJob> {
        self.jobs.get(job_id).await
    }

    /// Run every phase to completion. Exposed for callers that want to await
    /// a run instead of polling.
    pub async fn run(&self, job_id: &str, project_id: &str) {
        if let Err(e) = self.execute(job_id, project_id).await {
            error!(job_id, project_id, error = %e, "sandbox run failed");
            if let Err(store_err) = self.mark_not_ready(project_id, job_id, &e.to_string()).await {
                warn!(project_id, error = %store_err, "could not update project sandbox status");
            }
            if let Err(fail_err) = self.jobs.fail(job_id, e.to_string()).await {
                warn!(job_id, error = %fail_err, "could not mark sandbox job failed");
            }
        }
    }

    async fn log(&self, job_id: &str, line: impl Into<String>) {
        let line = line.into();
        info!(job_id, "{}", line);
        if let Err(e) = self.jobs.mutate(job_id, |job| job.logs.push(line)).await {
            debug!(job_id, error = %e, "dropped sandbox log line");
        }
    }

    async fn execute(&self, job_id: &str, project_id: &str) -> Result<(), PipelineError> {
        // setup
        self.jobs.advance(job_id, SandboxPhase::Setup).await?;
        let project_dir = self.config.project_dir(project_id);
        let sides = present_sides(&project_dir);
        if sides.is_empty() {
            return Err(PipelineError::SourceMissing {
                project_id: project_id.to_string(),
                detail: format!(
                    "{} has no non-empty frontend/ or backend/ directory",
                    project_dir.display()
                ),
            });
        }
        self.log(
            job_id,
            format!(
                "Sources found: {}",
                sides.iter().map(|(s, _)| s.as_str()).collect::<Vec<_>>().join(", ")
            ),
        )
        .await;

        // dependency_installation
        self.jobs
            .advance(job_id, SandboxPhase::DependencyInstallation)
            .await?;
        for (side, dir) in &sides {
            self.install_side(job_id, *side, dir).await?;
        }

        // backend_build
        self.jobs.advance(job_id, SandboxPhase::BackendBuild).await?;
        if let Some((_, dir)) = sides.iter().find(|(s, _)| *s == Side::Backend) {
            self.build_with_fixes(job_id, project_id, Side::Backend, dir).await?;
        } else {
            self.log(job_id, "No backend to build").await;
        }

        // build_test
        self.jobs.advance(job_id, SandboxPhase::BuildTest).await?;
        let mut report = BuildTestReport {
            passed: true,
            ..BuildTestReport::default()
        };
        let mut failures = Vec::new();
        for (side, dir) in &sides {
            let result = toolchain::build(*side, dir, &self.config.build).await;
            if !result.success {
                report.passed = false;
                failures.push(format!("[build test: {}] {}", side, result.output));
            }
            match side {
                Side::Frontend => report.frontend = Some(result),
                Side::Backend => report.backend = Some(result),
            }
        }
        self.jobs
            .mutate(job_id, |job| {
                job.build_errors.extend(failures);
                job.build_test = Some(report);
            })
            .await?;

        // runtime_test
        self.jobs.advance(job_id, SandboxPhase::RuntimeTest).await?;
        self.runtime_test(job_id, project_id, &project_dir).await?;

        // completed
        let snapshot = self
            .jobs
            .peek(job_id)
            .await
            .ok_or_else(|| crate::errors::JobError::NotFound { id: job_id.to_string() })?;
        self.mark_ready(project_id, &snapshot).await?;
        let summary = json!({
            "frontendUrl": snapshot.frontend_url,
            "backendUrl": snapshot.backend_url,
            "buildErrors": snapshot.build_errors.len(),
            "runtimeErrors": snapshot.runtime_errors.len(),
            "autoAddedDependencies": snapshot.auto_added_dependencies,
        });
        self.jobs.finish(job_id, Some(summary)).await?;
        info!(
            job_id,
            project_id,
            build_errors = snapshot.build_errors.len(),
            runtime_errors = snapshot.runtime_errors.len(),
            "sandbox run completed"
        );
        Ok(())
    }

    async fn install_side(&self, job_id: &str, side: Side, dir: &Path) -> Result<(), PipelineError> {
        if Toolchain::detect(dir) == Toolchain::Node {
            let missing = toolchain::missing_dependencies(dir);
            if !missing.is_empty() {
                match toolchain::add_dependencies(dir, &missing) {
                    Ok(()) => {
                        let added: Vec<String> =
                            missing.iter().map(|name| format!("{}:{}", side, name)).collect();
                        self.log(job_id, format!("Added missing dependencies: {}", added.join(", ")))
                            .await;
                        self.jobs
                            .mutate(job_id, |job| job.auto_added_dependencies.extend(added))
                            .await?;
                    }
                    Err(e) => {
                        warn!(job_id, %side, error = %e, "could not add missing dependencies");
                    }
                }
            }
        }

        let result = toolchain::install(side, dir, &self.config.build).await;
        self.record_step(job_id, "install", &result).await?;
        Ok(())
    }

    async fn build_with_fixes(
        &self,
        job_id: &str,
        project_id: &str,
        side: Side,
        dir: &Path,
    ) -> Result<(), PipelineError> {
        let mut result = toolchain::build(side, dir, &self.config.build).await;
        let mut round = 0;
        while !result.success && round < self.config.build.max_fix_rounds {
            round += 1;
            self.jobs.mutate(job_id, |job| job.fix_rounds = round).await?;
            let request = FixRequest {
                project_id: project_id.to_string(),
                project_dir: dir.to_path_buf(),
                side: side.to_string(),
                round,
                errors: vec![result.output.clone()],
            };
            match self.fixer.fix(&request).await {
                Ok(outcome) if outcome.applied => {
                    self.log(
                        job_id,
                        format!(
                            "Fix round {} applied{}",
                            round,
                            outcome.summary.map(|s| format!(": {}", s)).unwrap_or_default()
                        ),
                    )
                    .await;
                }
                Ok(_) => {
                    self.log(job_id, format!("Fix round {}: no fix available", round)).await;
                    break;
                }
                Err(e) => {
                    warn!(job_id, round, error = %e, "code fixer failed");
                    self.log(job_id, format!("Fix round {} failed: {:#}", round, e)).await;
                    break;
                }
            }
            result = toolchain::build(side, dir, &self.config.build).await;
        }
        self.record_step(job_id, "build", &result).await
    }

    async fn record_step(&self, job_id: &str, step: &str, result: &StepResult) -> Result<(), PipelineError> {
        let line = if result.skipped {
            format!("[{} {}] skipped: {}", result.side, step, result.output)
        } else if result.success {
            format!(
                "[{} {}] ok in {}ms",
                result.side, step, result.duration_ms
            )
        } else {
            format!("[{} {}] failed", result.side, step)
        };
        self.log(job_id, line).await;
        if !result.success {
            let diagnostic = format!("[{} {}] {}", result.side, step, result.output);
            self.jobs
                .mutate(job_id, |job| job.build_errors.push(diagnostic))
                .await?;
        }
        Ok(())
    }

    async fn runtime_test(
        &self,
        job_id: &str,
        project_id: &str,
        project_dir: &Path,
    ) -> Result<(), PipelineError> {
        match self.runtime.start_instance(job_id, project_dir, project_id).await {
            Ok(view) => {
                self.log(
                    job_id,
                    format!(
                        "Runtime started: frontend {} ({}), backend {} ({})",
                        view.frontend_url, view.frontend_entry, view.backend_url, view.backend_entry
                    ),
                )
                .await;
                let health = self.runtime.health_check(&view).await;
                let mut errors = Vec::new();
                if !health.backend_healthy || !health.frontend_healthy {
                    errors.extend(health.details.iter().cloned());
                }
                self.jobs
                    .mutate(job_id, |job| {
                        job.frontend_url = Some(view.frontend_url.clone());
                        job.backend_url = Some(view.backend_url.clone());
                        job.runtime_errors.extend(errors);
                        job.health = Some(health);
                        job.runtime = Some(view);
                    })
                    .await?;
            }
            Err(e) => {
                warn!(job_id, error = %e, "runtime failed to start");
                let diagnostic = format!("Runtime failed to start: {}", e);
                self.log(job_id, diagnostic.clone()).await;
                self.jobs
                    .mutate(job_id, |job| job.runtime_errors.push(diagnostic))
                    .await?;
            }
        }
        Ok(())
    }

    async fn mark_ready(&self, project_id: &str, job: &SandboxJob) -> Result<(), PipelineError> {
        let mut project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or_else(|| PipelineError::ProjectNotFound {
                id: project_id.to_string(),
            })?;
        project.sandbox.ready = true;
        project.sandbox.build_errors = job.build_errors.clone();
        project.sandbox.runtime_errors = job.runtime_errors.clone();
        project.sandbox.frontend_url = job.frontend_url.clone();
        project.sandbox.backend_url = job.backend_url.clone();
        project.sandbox.last_job_id = Some(job.record.id.clone());
        project.sandbox.updated_at = Some(Utc::now());
        project.touch();
        self.store.save_project(&project).await?;
        Ok(())
    }

    async fn mark_not_ready(&self, project_id: &str, job_id: &str, error: &str) -> anyhow::Result<()> {
        let Some(mut project) = self.store.get_project(project_id).await? else {
            return Ok(());
        };
        project.sandbox.ready = false;
        project.sandbox.runtime_errors = vec![error.to_string()];
        project.sandbox.last_job_id = Some(job_id.to_string());
        project.sandbox.updated_at = Some(Utc::now());
        project.touch();
        self.store.save_project(&project).await
    }
}

/// Sides with a non-empty source directory, frontend first.
fn present_sides(project_dir: &Path) -> Vec<(Side, PathBuf)> {
    [Side::Frontend, Side::Backend]
        .into_iter()
        .map(|side| (side, project_dir.join(side.as_str())))
        .filter(|(_, dir)| toolchain::is_non_empty_dir(dir))
        .collect()
}
