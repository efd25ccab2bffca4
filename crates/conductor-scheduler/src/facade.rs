//! Scheduler facade — the job registry plus the poller that executes it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use conductor_core::config::{ConductorConfig, PoolConfig};
use conductor_core::error::{ConductorError, Result};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::cron;
use crate::job::{CommandJob, Job, JobStatus, JobStatusCode, JobStatusResponse};
use crate::pool::{PoolOptions, WorkerPool};
use crate::source::{CronJobScheduler, JobSource};

/// Accepts jobs for execution. Implemented by [`Scheduler`]; the intent
/// dispatcher only depends on this.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn schedule_job(&self, job: CommandJob) -> Result<JobStatusResponse>;
}

/// In-memory job registry, keyed by job id.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, Arc<CommandJob>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by id.
    pub async fn insert(&self, job: Arc<CommandJob>) {
        self.jobs.write().await.insert(job.id(), job);
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<CommandJob>> {
        self.jobs.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: Uuid) -> Option<Arc<CommandJob>> {
        self.jobs.write().await.remove(&id)
    }

    /// Cancel and remove in one step, so concurrent cancels of one id
    /// succeed exactly once.
    pub async fn cancel(&self, id: Uuid) -> Result<Arc<CommandJob>> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| ConductorError::JobNotFound(id.to_string()))?;
        job.cancel()?;
        jobs.remove(&id);
        Ok(job)
    }

    /// All jobs, oldest first.
    pub async fn list(&self) -> Vec<Arc<CommandJob>> {
        let mut jobs: Vec<_> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at());
        jobs
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

/// Pending jobs whose schedule is empty or due this minute, each handed out
/// at most once.
#[async_trait]
impl JobSource for JobRegistry {
    async fn get_scheduled_cron_jobs(&self) -> Result<Vec<Arc<dyn Job>>> {
        let now = Utc::now();
        let due = self
            .list()
            .await
            .into_iter()
            .filter(|job| job.status().code == JobStatusCode::Pending && !job.is_cancelled())
            .filter(|job| {
                let schedule = job.schedule();
                schedule.trim().is_empty() || cron::is_due(&schedule, now)
            })
            .filter(|job| job.try_claim())
            .map(|job| job as Arc<dyn Job>)
            .collect();
        Ok(due)
    }

    async fn release(&self, id: Uuid) -> Result<()> {
        if let Some(job) = self.get(id).await {
            job.release_claim();
        }
        Ok(())
    }

    fn label(&self) -> &str {
        "registry"
    }
}

/// Facade over the registry, the poller and the worker pool.
pub struct Scheduler {
    registry: Arc<JobRegistry>,
    poller: CronJobScheduler,
    pool_config: Option<PoolConfig>,
}

impl Scheduler {
    /// Scheduler whose only job source is its own registry.
    pub fn new(pool: WorkerPool, poll_interval: Duration) -> Self {
        Self::with_sources(pool, poll_interval, Vec::new())
    }

    /// Registry first, then `extra` sources, polled in that order.
    pub fn with_sources(
        pool: WorkerPool,
        poll_interval: Duration,
        extra: Vec<Arc<dyn JobSource>>,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let mut sources: Vec<Arc<dyn JobSource>> = vec![registry.clone()];
        sources.extend(extra);
        Self {
            registry,
            poller: CronJobScheduler::with_sources(pool, poll_interval, sources),
            pool_config: None,
        }
    }

    /// Build the pool and poller from configuration.
    pub fn from_config(config: &ConductorConfig, extra: Vec<Arc<dyn JobSource>>) -> Result<Self> {
        let pool = WorkerPool::with_options(PoolOptions::from_config(&config.pool))?;
        let mut scheduler = Self::with_sources(
            pool,
            Duration::from_secs(config.poller.interval_secs),
            extra,
        );
        scheduler.pool_config = Some(config.pool.clone());
        Ok(scheduler)
    }

    pub fn pool(&self) -> &WorkerPool {
        self.poller.pool()
    }

    pub fn poller(&self) -> &CronJobScheduler {
        &self.poller
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }

    /// Register a job. An existing job with the same id is replaced.
    pub async fn schedule_job(&self, job: CommandJob) -> Result<JobStatusResponse> {
        let job = Arc::new(job);
        tracing::info!("📅 Job scheduled: '{}' ({})", job.name(), job.id());
        self.registry.insert(job.clone()).await;
        Ok(JobStatusResponse::scheduled(job.id(), job.status()))
    }

    /// Cancel a registered job and drop it from the registry.
    /// Running jobs cannot be cancelled.
    pub async fn cancel_job(&self, id: Uuid) -> Result<()> {
        self.registry.cancel(id).await?;
        Ok(())
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Arc<CommandJob>> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| ConductorError::JobNotFound(id.to_string()))
    }

    pub async fn get_job_status(&self, id: Uuid) -> Result<JobStatus> {
        Ok(self.get_job(id).await?.status())
    }

    pub async fn list_scheduled_jobs(&self) -> Vec<Arc<CommandJob>> {
        self.registry.list().await
    }

    /// Replace a job's schedule. The expression is stored as given.
    pub async fn reschedule_job(&self, id: Uuid, schedule: &str) -> Result<()> {
        let job = self.get_job(id).await?;
        job.set_schedule(schedule);
        tracing::info!("🗓️ Job '{}' rescheduled to '{schedule}'", job.name());
        Ok(())
    }

    /// Start the pool (if needed) and the poller.
    pub async fn start_scheduler(&self) -> Result<()> {
        let pool = self.pool();
        if !pool.is_running().await {
            match &self.pool_config {
                Some(config) => pool.start_configured(config).await?,
                None => pool.start().await?,
            }
        }
        self.poller.start_scheduler().await
    }

    /// Stop the poller and drain the pool.
    pub async fn stop_scheduler(&self) -> Result<()> {
        self.poller.stop_scheduler().await
    }

    pub async fn health(&self) -> Result<()> {
        for job in self.registry.list().await {
            if job.id().is_nil() {
                return Err(ConductorError::Scheduling(format!(
                    "invalid job ID format for '{}'",
                    job.name()
                )));
            }
        }
        self.poller.health().await
    }

    pub async fn stats(&self) -> serde_json::Value {
        let mut by_status: HashMap<String, usize> = HashMap::new();
        let jobs = self.registry.list().await;
        for job in &jobs {
            *by_status.entry(job.status().code.to_string()).or_default() += 1;
        }
        serde_json::json!({
            "total_jobs": jobs.len(),
            "by_status": by_status,
            "pool": {
                "running": self.pool().is_running().await,
                "capacity": self.pool().capacity(),
                "in_flight": self.pool().in_flight(),
                "restarts": self.pool().restart_count(),
            },
            "poller": self.poller.stats().await,
        })
    }
}

#[async_trait]
impl JobScheduler for Scheduler {
    async fn schedule_job(&self, job: CommandJob) -> Result<JobStatusResponse> {
        Scheduler::schedule_job(self, job).await
    }
}
