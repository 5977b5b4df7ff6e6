//! Production deployment of a sandbox-validated project.
//!
//! `sandbox_validation → production_prep → infrastructure_deploy →
//! application_deploy → testing → completed`, with `failed` absorbing.

pub mod pipeline;
pub mod prep;
pub mod publish;
pub mod verify;

use serde::Serialize;

use crate::infra::ProvisionedResources;
use crate::jobs::{Job, JobRecord, PipelinePhase};
use crate::project::VerificationResults;

pub use pipeline::DeploymentPipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    SandboxValidation,
    ProductionPrep,
    InfrastructureDeploy,
    ApplicationDeploy,
    Testing,
    Completed,
    Failed,
}

impl PipelinePhase for DeploymentPhase {
    const INITIAL: Self = DeploymentPhase::SandboxValidation;
    const FINAL_WORKING: Self = DeploymentPhase::Testing;
    const COMPLETED: Self = DeploymentPhase::Completed;
    const FAILED: Self = DeploymentPhase::Failed;

    fn ordinal(self) -> u8 {
        match self {
            DeploymentPhase::SandboxValidation => 0,
            DeploymentPhase::ProductionPrep => 1,
            DeploymentPhase::InfrastructureDeploy => 2,
            DeploymentPhase::ApplicationDeploy => 3,
            DeploymentPhase::Testing => 4,
            DeploymentPhase::Completed => 5,
            DeploymentPhase::Failed => u8::MAX,
        }
    }

    fn progress(self) -> u8 {
        match self {
            DeploymentPhase::SandboxValidation => 10,
            DeploymentPhase::ProductionPrep => 25,
            DeploymentPhase::InfrastructureDeploy => 45,
            DeploymentPhase::ApplicationDeploy => 70,
            DeploymentPhase::Testing => 85,
            DeploymentPhase::Completed | DeploymentPhase::Failed => 100,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            DeploymentPhase::SandboxValidation => "sandbox_validation",
            DeploymentPhase::ProductionPrep => "production_prep",
            DeploymentPhase::InfrastructureDeploy => "infrastructure_deploy",
            DeploymentPhase::ApplicationDeploy => "application_deploy",
            DeploymentPhase::Testing => "testing",
            DeploymentPhase::Completed => "completed",
            DeploymentPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentJob {
    #[serde(flatten)]
    pub record: JobRecord,
    pub phase: DeploymentPhase,
    pub project_id: String,
    pub sandbox_job_id: Option<String>,
    pub frontend_url: Option<String>,
    pub backend_url: Option<String>,
    pub deployment_logs: Vec<String>,
    pub verification: Option<VerificationResults>,
    pub phase_history: Vec<DeploymentPhase>,
    /// Provisioned outputs with sensitive values redacted.
    pub resources: Option<ProvisionedResources>,
}

impl DeploymentJob {
    pub fn new(
        record: JobRecord,
        project_id: impl Into<String>,
        sandbox_job_id: Option<String>,
    ) -> Self {
        Self {
            record,
            phase: DeploymentPhase::SandboxValidation,
            project_id: project_id.into(),
            sandbox_job_id,
            frontend_url: None,
            backend_url: None,
            deployment_logs: Vec::new(),
            verification: None,
            phase_history: vec![DeploymentPhase::SandboxValidation],
            resources: None,
        }
    }
}

impl Job for DeploymentJob {
    type Phase = DeploymentPhase;
    const KIND: &'static str = "dep";

    fn record(&self) -> &JobRecord {
        &self.record
    }

    fn record_mut(&mut self) -> &mut JobRecord {
        &mut self.record
    }

    fn phase(&self) -> DeploymentPhase {
        self.phase
    }

    fn set_phase(&mut self, phase: DeploymentPhase) {
        self.phase = phase;
        self.phase_history.push(phase);
    }
}
