//! Job tracking shared by every long-running pipeline.
//!
//! A job is a [`JobRecord`] (status, progress, timestamps, result/error)
//! embedded in a kind-specific struct implementing [`Job`]. Each kind walks
//! its own [`PipelinePhase`] state machine and lives in its own
//! [`JobRegistry`].

pub mod registry;
pub mod sweeper;

use std::fmt::Debug;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use registry::{EvictionHook, JobRegistry, RetentionPolicy};
pub use sweeper::{RegistrySweeper, Sweepable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Fields common to every job kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub status: JobStatus,
    /// 0..=100, never decreases.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobRecord {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: JobStatus::Pending,
            progress: 0,
            created_at: now,
            last_accessed_at: now,
            ended_at: None,
            result: None,
            error: None,
        }
    }

    /// Raise progress, ignoring attempts to lower it.
    pub fn raise_progress(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
    }
}

/// An ordered pipeline phase enum with two absorbing terminal members.
pub trait PipelinePhase: Copy + Eq + Debug + Send + Sync + 'static {
    const INITIAL: Self;
    /// The only phase from which `COMPLETED` may be entered.
    const FINAL_WORKING: Self;
    const COMPLETED: Self;
    const FAILED: Self;

    /// Position in the forward order. `FAILED` has no meaningful ordinal.
    fn ordinal(self) -> u8;

    /// Progress reported on entering this phase.
    fn progress(self) -> u8;

    fn as_str(self) -> &'static str;

    fn is_terminal(self) -> bool {
        self == Self::COMPLETED || self == Self::FAILED
    }
}

/// Forward-only transitions, `failed` from any working phase, and
/// `completed` only from the final working phase.
pub fn is_valid_phase_transition<P: PipelinePhase>(from: P, to: P) -> bool {
    if from.is_terminal() {
        return false;
    }
    if to == P::FAILED {
        return true;
    }
    if to == P::COMPLETED {
        return from == P::FINAL_WORKING;
    }
    to.ordinal() > from.ordinal()
}

/// A job kind stored in a [`JobRegistry`].
pub trait Job: Clone + Send + Sync + 'static {
    type Phase: PipelinePhase;

    /// Prefix of generated job ids, e.g. `sbx`.
    const KIND: &'static str;

    fn record(&self) -> &JobRecord;
    fn record_mut(&mut self) -> &mut JobRecord;
    fn phase(&self) -> Self::Phase;

    /// Store the new phase. Validation happens in the registry.
    fn set_phase(&mut self, phase: Self::Phase);
}
