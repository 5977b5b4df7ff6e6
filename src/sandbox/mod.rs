//! Sandbox validation of a project's generated code.
//!
//! `setup → dependency_installation → backend_build → build_test →
//! runtime_test → completed`, with `failed` absorbing.

pub mod pipeline;
pub mod toolchain;

use serde::Serialize;

use crate::jobs::{Job, JobRecord, PipelinePhase};
use crate::runtime::{HealthReport, RuntimeInstanceView};
use toolchain::StepResult;

pub use pipeline::{SandboxPipeline, StopRuntimeOnEvict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxPhase {
    Setup,
    DependencyInstallation,
    BackendBuild,
    BuildTest,
    RuntimeTest,
    Completed,
    Failed,
}

impl PipelinePhase for SandboxPhase {
    const INITIAL: Self = SandboxPhase::Setup;
    const FINAL_WORKING: Self = SandboxPhase::RuntimeTest;
    const COMPLETED: Self = SandboxPhase::Completed;
    const FAILED: Self = SandboxPhase::Failed;

    fn ordinal(self) -> u8 {
        match self {
            SandboxPhase::Setup => 0,
            SandboxPhase::DependencyInstallation => 1,
            SandboxPhase::BackendBuild => 2,
            SandboxPhase::BuildTest => 3,
            SandboxPhase::RuntimeTest => 4,
            SandboxPhase::Completed => 5,
            SandboxPhase::Failed => u8::MAX,
        }
    }

    fn progress(self) -> u8 {
        match self {
            SandboxPhase::Setup => 10,
            SandboxPhase::DependencyInstallation => 25,
            SandboxPhase::BackendBuild => 45,
            SandboxPhase::BuildTest => 65,
            SandboxPhase::RuntimeTest => 85,
            SandboxPhase::Completed | SandboxPhase::Failed => 100,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            SandboxPhase::Setup => "setup",
            SandboxPhase::DependencyInstallation => "dependency_installation",
            SandboxPhase::BackendBuild => "backend_build",
            SandboxPhase::BuildTest => "build_test",
            SandboxPhase::RuntimeTest => "runtime_test",
            SandboxPhase::Completed => "completed",
            SandboxPhase::Failed => "failed",
        }
    }
}

/// Re-verification results of both builds.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildTestReport {
    pub frontend: Option<StepResult>,
    pub backend: Option<StepResult>,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxJob {
    #[serde(flatten)]
    pub record: JobRecord,
    pub phase: SandboxPhase,
    pub project_id: String,
    pub frontend_url: Option<String>,
    pub backend_url: Option<String>,
    pub build_errors: Vec<String>,
    pub runtime_errors: Vec<String>,
    pub auto_added_dependencies: Vec<String>,
    pub phase_history: Vec<SandboxPhase>,
    pub fix_rounds: u32,
    pub build_test: Option<BuildTestReport>,
    pub health: Option<HealthReport>,
    pub runtime: Option<RuntimeInstanceView>,
    pub logs: Vec<String>,
}

impl SandboxJob {
    pub fn new(record: JobRecord, project_id: impl Into<String>) -> Self {
        Self {
            record,
            phase: SandboxPhase::Setup,
            project_id: project_id.into(),
            frontend_url: None,
            backend_url: None,
            build_errors: Vec::new(),
            runtime_errors: Vec::new(),
            auto_added_dependencies: Vec::new(),
            phase_history: vec![SandboxPhase::Setup],
            fix_rounds: 0,
            build_test: None,
            health: None,
            runtime: None,
            logs: Vec::new(),
        }
    }
}

impl Job for SandboxJob {
    type Phase = SandboxPhase;
    const KIND: &'static str = "sbx";

    fn record(&self) -> &JobRecord {
        &self.record
    }

    fn record_mut(&mut self) -> &mut JobRecord {
        &mut self.record
    }

    fn phase(&self) -> SandboxPhase {
        self.phase
    }

    fn set_phase(&mut self, phase: SandboxPhase) {
        self.phase = phase;
        self.phase_history.push(phase);
    }
}
