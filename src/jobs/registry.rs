//! In-memory job registry with bounded retention.
//!
//! Records sit behind a per-job `tokio::sync::Mutex` inside a `DashMap`, so a
//! single writer mutates a job while other jobs proceed concurrently. The
//! map guard is never held across an await.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{is_valid_phase_transition, Job, JobRecord, JobStatus, PipelinePhase};
use crate::config::RetentionSection;
use crate::errors::JobError;

/// How long terminal jobs are kept and how many jobs a registry may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub max_count: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from(RetentionSection::default())
    }
}

impl From<RetentionSection> for RetentionPolicy {
    fn from(section: RetentionSection) -> Self {
        Self {
            max_age: Duration::from_secs(section.max_age_secs),
            max_count: section.max_count,
        }
    }
}

/// Runs after a job has been removed from its registry.
#[async_trait]
pub trait EvictionHook<J: Job>: Send + Sync {
    async fn on_evict(&self, job: &J);
}

pub struct JobRegistry<J: Job> {
    name: &'static str,
    jobs: DashMap<String, Arc<Mutex<J>>>,
    policy: RetentionPolicy,
    hook: Option<Arc<dyn EvictionHook<J>>>,
}

impl<J: Job> JobRegistry<J> {
    pub fn new(name: &'static str, policy: RetentionPolicy) -> Self {
        Self {
            name,
            jobs: DashMap::new(),
            policy,
            hook: None,
        }
    }

    pub fn with_eviction_hook(mut self, hook: Arc<dyn EvictionHook<J>>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    /// Allocate a pending job built by `init` and return its id.
    pub fn create<F>(&self, init: F) -> String
    where
        F: FnOnce(JobRecord) -> J,
    {
        let id = format!("{}-{}", J::KIND, Uuid::now_v7());
        let job = init(JobRecord::new(id.clone()));
        self.jobs.insert(id.clone(), Arc::new(Mutex::new(job)));
        debug!(registry = self.name, job_id = %id, "job created");
        id
    }

    fn entry(&self, id: &str) -> Option<Arc<Mutex<J>>> {
        self.jobs.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Snapshot of a job. Counts as an access for retention purposes.
    pub async fn get(&self, id: &str) -> Option<J> {
        let entry = self.entry(id)?;
        let mut job = entry.lock().await;
        job.record_mut().last_accessed_at = Utc::now();
        Some(job.clone())
    }

    /// Snapshot without touching `last_accessed_at`.
    pub async fn peek(&self, id: &str) -> Option<J> {
        let entry = self.entry(id)?;
        let job = entry.lock().await;
        Some(job.clone())
    }

    /// Apply `f` to the job under its lock.
    pub async fn mutate<F, R>(&self, id: &str, f: F) -> Result<R, JobError>
    where
        F: FnOnce(&mut J) -> R,
    {
        let entry = self
            .entry(id)
            .ok_or_else(|| JobError::NotFound { id: id.to_string() })?;
        let mut job = entry.lock().await;
        Ok(f(&mut job))
    }

    /// Move a job to a working phase and raise its progress.
    pub async fn advance(&self, id: &str, phase: J::Phase) -> Result<(), JobError> {
        if phase.is_terminal() {
            return Err(invalid(id, phase, phase));
        }
        self.mutate(id, |job| {
            let from = job.phase();
            if from != phase && !is_valid_phase_transition(from, phase) {
                return Err(invalid(id, from, phase));
            }
            if from != phase {
                job.set_phase(phase);
            }
            let record = job.record_mut();
            record.status = JobStatus::Processing;
            record.raise_progress(phase.progress());
            Ok(())
        })
        .await?
    }

    /// Mark the job completed with an optional result payload.
    pub async fn finish(
        &self,
        id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<(), JobError> {
        self.mutate(id, |job| {
            let from = job.phase();
            if !is_valid_phase_transition(from, J::Phase::COMPLETED) {
                return Err(invalid(id, from, J::Phase::COMPLETED));
            }
            job.set_phase(J::Phase::COMPLETED);
            let now = Utc::now();
            let record = job.record_mut();
            record.status = JobStatus::Completed;
            record.progress = 100;
            record.result = result;
            record.error = None;
            record.ended_at = Some(now);
            record.last_accessed_at = now;
            Ok(())
        })
        .await?
    }

    /// Mark the job failed. A job already terminal is left untouched.
    pub async fn fail(&self, id: &str, error: impl Into<String>) -> Result<(), JobError> {
        let error = error.into();
        self.mutate(id, |job| {
            let from = job.phase();
            if !is_valid_phase_transition(from, J::Phase::FAILED) {
                return Err(invalid(id, from, J::Phase::FAILED));
            }
            job.set_phase(J::Phase::FAILED);
            let now = Utc::now();
            let record = job.record_mut();
            record.status = JobStatus::Failed;
            record.progress = 100;
            record.result = None;
            record.error = Some(error);
            record.ended_at = Some(now);
            record.last_accessed_at = now;
            Ok(())
        })
        .await?
    }

    /// Evict expired and surplus terminal jobs. Returns the evicted ids.
    ///
    /// Terminal jobs idle longer than `max_age` go first; then, while the
    /// registry is over `max_count`, the least recently accessed terminal
    /// jobs. Jobs still running are never evicted.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let entries: Vec<(String, Arc<Mutex<J>>)> = self
            .jobs
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut terminal: Vec<(String, DateTime<Utc>)> = Vec::new();
        for (id, entry) in &entries {
            let job = entry.lock().await;
            let record = job.record();
            if record.status.is_terminal() {
                terminal.push((id.clone(), record.last_accessed_at));
            }
        }
        terminal.sort_by_key(|(_, accessed)| *accessed);

        let mut doomed = Vec::new();
        let mut survivors = Vec::new();
        for (id, accessed) in terminal {
            let expired = (now - accessed)
                .to_std()
                .map(|idle| idle > self.policy.max_age)
                .unwrap_or(false);
            if expired {
                doomed.push(id);
            } else {
                survivors.push(id);
            }
        }

        let mut remaining = entries.len() - doomed.len();
        for id in survivors {
            if remaining <= self.policy.max_count {
                break;
            }
            doomed.push(id);
            remaining -= 1;
        }

        for id in &doomed {
            self.evict(id).await;
        }
        if !doomed.is_empty() {
            info!(
                registry = self.name,
                evicted = doomed.len(),
                remaining = self.jobs.len(),
                "swept job registry"
            );
        }
        doomed
    }

    async fn evict(&self, id: &str) {
        let Some((_, entry)) = self.jobs.remove(id) else {
            return;
        };
        let snapshot = {
            let mut job = entry.lock().await;
            job.record_mut().result = None;
            job.clone()
        };
        debug!(registry = self.name, job_id = %id, "job evicted");
        if let Some(hook) = &self.hook {
            hook.on_evict(&snapshot).await;
        }
    }
}

fn invalid<P: PipelinePhase>(id: &str, from: P, to: P) -> JobError {
    JobError::InvalidTransition {
        id: id.to_string(),
        from: from.as_str().to_string(),
        to: to.as_str().to_string(),
    }
}
