use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ShipyardConfig;
use crate::deploy::{DeploymentJob, DeploymentPipeline};
use crate::errors::{InfraError, PipelineError};
use crate::fixer::{CodeFixer, CommandFixer, NoopFixer};
use crate::infra::{DestroyReport, ExistingInfrastructure, InfraLifecycleManager};
use crate::jobs::{JobRegistry, RegistrySweeper, RetentionPolicy};
use crate::project::ProjectStore;
use crate::runtime::RuntimeProvisioner;
use crate::sandbox::{SandboxJob, SandboxPipeline, StopRuntimeOnEvict};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub config: Arc<ShipyardConfig>,
    pub store: Arc<dyn ProjectStore>,
    pub runtime: Arc<RuntimeProvisioner>,
    pub infra: Arc<InfraLifecycleManager>,
    pub sandbox: Arc<SandboxPipeline>,
    pub deployment: Arc<DeploymentPipeline>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire every service from configuration. Probes the container runtime.
    pub async fn assemble(config: ShipyardConfig, store: Arc<dyn ProjectStore>) -> Self {
        let config = Arc::new(config);
        let runtime = Arc::new(RuntimeProvisioner::detect(&config.runtime).await);
        let infra = Arc::new(InfraLifecycleManager::from_config(&config));

        let fixer: Arc<dyn CodeFixer> = match &config.build.fix_command {
            Some(command) => Arc::new(CommandFixer::new(
                command.clone(),
                Duration::from_secs(config.build.fix_timeout_secs),
            )),
            None => Arc::new(NoopFixer),
        };

        let sandbox_jobs = Arc::new(
            JobRegistry::new(
                "sandbox",
                RetentionPolicy::from(config.registry.sandbox.clone()),
            )
            .with_eviction_hook(Arc::new(StopRuntimeOnEvict::new(Arc::clone(&runtime)))),
        );
        let deployment_jobs = Arc::new(JobRegistry::new(
            "deployment",
            RetentionPolicy::from(config.registry.deployment.clone()),
        ));

        let sandbox = Arc::new(SandboxPipeline::new(
            Arc::clone(&sandbox_jobs),
            Arc::clone(&store),
            Arc::clone(&runtime),
            fixer,
            Arc::clone(&config),
        ));
        let deployment = Arc::new(DeploymentPipeline::new(
            deployment_jobs,
            sandbox_jobs,
            Arc::clone(&store),
            Arc::clone(&infra),
            Arc::clone(&config),
        ));

        Self {
            config,
            store,
            runtime,
            infra,
            sandbox,
            deployment,
        }
    }

    /// Sweeper covering both job registries.
    pub fn sweeper(&self) -> RegistrySweeper {
        let interval = Duration::from_secs(self.config.registry.sweep_interval_secs.max(1));
        RegistrySweeper::new(interval)
            .register(Arc::clone(self.sandbox.jobs()) as _)
            .register(Arc::clone(self.deployment.jobs()) as _)
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSandboxRequest {
    pub project_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDeploymentRequest {
    pub project_id: String,
    #[serde(default)]
    pub sandbox_job_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStarted {
    pub job_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckAndDestroy {
    pub project_id: String,
    pub existing: ExistingInfrastructure,
    pub destroy: DestroyReport,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::ProjectNotFound { .. } => ApiError::NotFound(err.to_string()),
            PipelineError::AlreadyRunning { .. } => ApiError::Conflict(err.to_string()),
            PipelineError::SourceMissing { .. } | PipelineError::SandboxNotReady { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<InfraError> for ApiError {
    fn from(err: InfraError) -> Self {
        match err {
            InfraError::InvalidProjectId(_) => ApiError::BadRequest(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/sandbox/start", post(start_sandbox))
        .route("/api/sandbox/status/{job_id}", get(sandbox_status))
        .route("/api/deployment/start", post(start_deployment))
        .route("/api/deployment/status/{job_id}", get(deployment_status))
        .route(
            "/api/infrastructure/{project_id}/check-and-destroy",
            post(check_and_destroy),
        )
        .route(
            "/api/infrastructure/{project_id}/status",
            get(infrastructure_status),
        )
        .route("/health", get(health_check))
}

fn require_project_id(project_id: &str) -> Result<(), ApiError> {
    if project_id.trim().is_empty() {
        return Err(ApiError::BadRequest("projectId is required".into()));
    }
    Ok(())
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "runtime": state.runtime.kind(),
        "sandboxJobs": state.sandbox.jobs().len(),
        "deploymentJobs": state.deployment.jobs().len(),
    }))
}

async fn start_sandbox(
    State(state): State<SharedState>,
    Json(req): Json<StartSandboxRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_project_id(&req.project_id)?;
    let job_id = state.sandbox.start(&req.project_id).await?;
    Ok((StatusCode::ACCEPTED, Json(JobStarted { job_id })))
}

async fn sandbox_status(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<Json<SandboxJob>, ApiError> {
    state
        .sandbox
        .status(&job_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Sandbox job {} not found", job_id)))
}

async fn start_deployment(
    State(state): State<SharedState>,
    Json(req): Json<StartDeploymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_project_id(&req.project_id)?;
    let job_id = state
        .deployment
        .start(&req.project_id, req.sandbox_job_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(JobStarted { job_id })))
}

async fn deployment_status(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<Json<DeploymentJob>, ApiError> {
    state
        .deployment
        .status(&job_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Deployment job {} not found", job_id)))
}

async fn check_and_destroy(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
) -> Result<Json<CheckAndDestroy>, ApiError> {
    let _lease = state
        .deployment
        .lease_for_maintenance(&project_id)
        .map_err(|_| {
            let holder = state.deployment.active_job(&project_id).unwrap_or_default();
            ApiError::Conflict(format!(
                "Project {} is busy ({}), retry when it finishes",
                project_id, holder
            ))
        })?;
    let existing = state.infra.check_existing(&project_id).await?;
    let destroy = state.infra.destroy_existing(&project_id).await?;
    info!(
        project_id = %project_id,
        found = existing.found,
        destroyed = destroy.destroyed,
        "check-and-destroy finished"
    );
    Ok(Json(CheckAndDestroy {
        project_id,
        existing,
        destroy,
    }))
}

async fn infrastructure_status(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.infra.status(&project_id)?;
    Ok(Json(status))
}
