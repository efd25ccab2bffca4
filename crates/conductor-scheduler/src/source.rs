//! Periodic job-source poller.
//!
//! Every tick the poller asks each [`JobSource`] for the jobs that are due and
//! submits them to the [`WorkerPool`] in the order they were returned. The jobs
//! returned by the latest poll form the "known" set that cancel, status, health
//! and stats operate on.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use conductor_core::error::{ConductorError, Result};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::job::{Job, JobStatus};
use crate::pool::WorkerPool;

/// Something that knows which jobs are due right now.
///
/// A source should hand out each due job once: the poller submits every job it
/// receives, and calls [`JobSource::release`] for any job the pool refused.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn get_scheduled_cron_jobs(&self) -> Result<Vec<Arc<dyn Job>>>;

    /// Give back a job this source handed out but that never reached a
    /// worker, so a later poll can return it again.
    async fn release(&self, _id: Uuid) -> Result<()> {
        Ok(())
    }

    /// Label used in logs.
    fn label(&self) -> &str {
        "source"
    }
}

struct PollState {
    pool: WorkerPool,
    sources: Vec<Arc<dyn JobSource>>,
    known: RwLock<HashMap<Uuid, Arc<dyn Job>>>,
    polls: AtomicU64,
}

impl PollState {
    async fn poll_once(&self) -> usize {
        let mut fetched: Vec<(usize, Arc<dyn Job>)> = Vec::new();
        for (index, source) in self.sources.iter().enumerate() {
            match source.get_scheduled_cron_jobs().await {
                Ok(jobs) => fetched.extend(jobs.into_iter().map(|job| (index, job))),
                Err(e) => {
                    tracing::warn!("⚠️ Failed to fetch jobs from {}: {e}", source.label());
                }
            }
        }

        {
            let mut known = self.known.write().await;
            known.clear();
            for (_, job) in &fetched {
                known.insert(job.id(), job.clone());
            }
        }

        let mut submitted = 0;
        for (index, job) in fetched {
            let id = job.id();
            let name = job.name().to_string();
            match self.pool.submit(job).await {
                Ok(()) => submitted += 1,
                Err(e) => {
                    tracing::warn!("⚠️ Could not submit job '{name}': {e}");
                    let source = &self.sources[index];
                    if let Err(e) = source.release(id).await {
                        tracing::error!(
                            "❌ Failed to release job '{name}' back to {}: {e}",
                            source.label()
                        );
                    }
                }
            }
        }

        self.polls.fetch_add(1, Ordering::SeqCst);
        if submitted > 0 {
            tracing::info!("🔔 Poll submitted {submitted} job(s)");
        }
        submitted
    }
}

/// Polls job sources on a fixed interval and feeds the worker pool.
pub struct CronJobScheduler {
    state: Arc<PollState>,
    interval: Duration,
    poller: Mutex<Option<(watch::Sender<()>, JoinHandle<()>)>>,
}

impl CronJobScheduler {
    pub fn new(pool: WorkerPool, interval: Duration) -> Self {
        Self::with_sources(pool, interval, Vec::new())
    }

    pub fn with_sources(
        pool: WorkerPool,
        interval: Duration,
        sources: Vec<Arc<dyn JobSource>>,
    ) -> Self {
        Self {
            state: Arc::new(PollState {
                pool,
                sources,
                known: RwLock::new(HashMap::new()),
                polls: AtomicU64::new(0),
            }),
            interval,
            poller: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.state.pool
    }

    /// Start polling. The first poll happens immediately.
    pub async fn start_scheduler(&self) -> Result<()> {
        let mut poller = self.poller.lock().await;
        if poller.is_some() {
            return Err(ConductorError::Scheduling(
                "cron poller is already running".into(),
            ));
        }

        let (stop_tx, mut stop_rx) = watch::channel(());
        let state = self.state.clone();
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            tracing::info!(
                "⏰ Cron poller started ({} source(s), every {:?})",
                state.sources.len(),
                interval
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                state.poll_once().await;
            }
            tracing::info!("⏰ Cron poller stopped");
        });

        *poller = Some((stop_tx, handle));
        Ok(())
    }

    /// Stop polling, then stop the pool (which drains accepted jobs).
    /// A poll already in progress finishes first.
    pub async fn stop_scheduler(&self) -> Result<()> {
        if let Some((stop_tx, handle)) = self.poller.lock().await.take() {
            drop(stop_tx);
            if let Err(e) = handle.await {
                tracing::error!("❌ Cron poller ended abnormally: {e}");
            }
        }
        self.state.pool.stop().await
    }

    pub async fn is_polling(&self) -> bool {
        self.poller.lock().await.is_some()
    }

    /// Run one poll right now. Returns how many jobs were submitted.
    pub async fn poll_now(&self) -> usize {
        self.state.poll_once().await
    }

    /// Completed poll count.
    pub fn poll_count(&self) -> u64 {
        self.state.polls.load(Ordering::SeqCst)
    }

    /// Cancel a job from the latest poll.
    pub async fn cancel_job(&self, id: Uuid) -> Result<()> {
        let job = self.known_job(id).await?;
        job.cancel()?;
        self.state.known.write().await.remove(&id);
        Ok(())
    }

    pub async fn get_job_status(&self, id: Uuid) -> Result<JobStatus> {
        Ok(self.known_job(id).await?.status())
    }

    /// Jobs returned by the latest poll.
    pub async fn list_scheduled_jobs(&self) -> Vec<Arc<dyn Job>> {
        self.state.known.read().await.values().cloned().collect()
    }

    /// Fails when a tracked job has a malformed (nil) identifier.
    pub async fn health(&self) -> Result<()> {
        for job in self.state.known.read().await.values() {
            if job.id().is_nil() {
                return Err(ConductorError::Scheduling(format!(
                    "invalid job ID format for '{}'",
                    job.name()
                )));
            }
        }
        Ok(())
    }

    pub async fn stats(&self) -> serde_json::Value {
        let jobs: Vec<serde_json::Value> = self
            .state
            .known
            .read()
            .await
            .values()
            .map(|job| {
                serde_json::json!({
                    "id": job.id(),
                    "name": job.name(),
                    "status": job.status().code,
                })
            })
            .collect();
        serde_json::json!({
            "jobs": jobs,
            "polls": self.poll_count(),
            "polling": self.is_polling().await,
            "in_flight": self.state.pool.in_flight(),
            "restarts": self.state.pool.restart_count(),
        })
    }

    async fn known_job(&self, id: Uuid) -> Result<Arc<dyn Job>> {
        self.state
            .known
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| ConductorError::JobNotFound(id.to_string()))
    }
}
