//! Background eviction for job registries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::{Job, JobRegistry};

/// Anything the sweeper can periodically prune.
#[async_trait]
pub trait Sweepable: Send + Sync {
    fn name(&self) -> &str;
    async fn sweep_at(&self, now: DateTime<Utc>) -> Vec<String>;
}

#[async_trait]
impl<J: Job> Sweepable for JobRegistry<J> {
    fn name(&self) -> &str {
        JobRegistry::name(self)
    }

    async fn sweep_at(&self, now: DateTime<Utc>) -> Vec<String> {
        self.sweep(now).await
    }
}

/// Sweeps every registered registry on a fixed interval, independent of
/// request traffic.
pub struct RegistrySweeper {
    interval: Duration,
    targets: Vec<Arc<dyn Sweepable>>,
}

impl RegistrySweeper {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            targets: Vec::new(),
        }
    }

    pub fn register(mut self, target: Arc<dyn Sweepable>) -> Self {
        self.targets.push(target);
        self
    }

    /// One pass over every target. Returns the number of evicted jobs.
    pub async fn sweep_once(&self) -> usize {
        let now = Utc::now();
        let mut total = 0;
        for target in &self.targets {
            let evicted = target.sweep_at(now).await;
            if !evicted.is_empty() {
                debug!(registry = target.name(), count = evicted.len(), "evicted jobs");
            }
            total += evicted.len();
        }
        total
    }

    /// Run forever on a background task. Abort the handle to stop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }
}
