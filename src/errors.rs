//! Typed error hierarchy for Shipyard.
//!
//! One enum per subsystem:
//! - `JobError`: registry lookups and phase transitions
//! - `ProcessError`: external command invocation
//! - `InfraError`: Terraform lifecycle management
//! - `RuntimeError`: sandbox runtime provisioning
//! - `PipelineError`: sandbox and deployment pipeline runs

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the job registry.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Invalid phase transition for job {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },
}

/// Errors from running an external command.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("Failed to wait for `{command}`: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the infrastructure lifecycle manager.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("terraform {step} failed (exit code {code:?}): {detail}")]
    CommandFailed {
        step: String,
        code: Option<i32>,
        detail: String,
    },

    #[error("Provisioning failed during {step}: {message}")]
    ProvisionFailed {
        step: String,
        message: String,
        logs: Vec<String>,
    },

    #[error("Invalid project id '{0}'")]
    InvalidProjectId(String),

    #[error("Refusing to apply placeholder configuration in {dir}")]
    PlaceholderApply { dir: PathBuf },

    #[error("Failed to parse terraform output: {0}")]
    OutputParse(#[source] serde_json::Error),

    #[error("Infrastructure I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl InfraError {
    /// Logs captured up to the point of failure, when the error carries them.
    pub fn logs(&self) -> &[String] {
        match self {
            InfraError::ProvisionFailed { logs, .. } => logs,
            _ => &[],
        }
    }
}

/// Errors from the runtime provisioner.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Port {0} is already in use")]
    PortInUse(u16),

    #[error("Could not find free ports after {attempts} attempts")]
    PortsExhausted { attempts: u32 },

    #[error("Failed to start {side} runtime: {message}")]
    StartFailed { side: String, message: String },

    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the sandbox and deployment pipelines.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Project {id} not found")]
    ProjectNotFound { id: String },

    #[error("Generated source missing for project {project_id}: {detail}")]
    SourceMissing { project_id: String, detail: String },

    #[error("Sandbox not ready for project {project_id}: {reason}")]
    SandboxNotReady { project_id: String, reason: String },

    #[error("A deployment or infrastructure operation is already running for project {project_id}")]
    AlreadyRunning { project_id: String },

    #[error("Production prep failed: {0}")]
    Prep(String),

    #[error(transparent)]
    Infra(#[from] InfraError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
