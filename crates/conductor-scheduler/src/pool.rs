//! Bounded worker pool with optional self-monitoring.
//!
//! A fixed number of worker tasks pull jobs off a shared channel. Capacity is
//! enforced with a semaphore holding `workers + buffer` permits; each queued job
//! carries its permit until its `run` returns, so `submit` waits exactly while
//! every worker is busy and the buffer is full.
//!
//! Monitoring modes:
//! - plain: workers only
//! - monitored: per-job timings and a periodic resource sample
//! - enhanced: samples plus threshold alerts
//! - resilient: alerts plus an automatic [`WorkerPool::restart`] on breach

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender, TrySendError};
use conductor_core::config::{MonitoringMode, PoolConfig};
use conductor_core::error::{ConductorError, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore, watch};
use tokio::task::JoinHandle;

use crate::job::Job;
use crate::monitor::{MetricsProbe, RuntimeProbe};

type QueuedJob = (Arc<dyn Job>, OwnedSemaphorePermit);

/// Construction options for [`WorkerPool`].
#[derive(Clone)]
pub struct PoolOptions {
    pub max_workers: usize,
    /// Queue slots beyond the workers themselves.
    pub buffer: usize,
    pub sample_interval: Duration,
    pub probe: Arc<dyn MetricsProbe>,
}

impl PoolOptions {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            buffer: 0,
            sample_interval: Duration::from_secs(5),
            probe: Arc::new(RuntimeProbe),
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            max_workers: config.workers,
            buffer: config.buffer,
            sample_interval: Duration::from_secs(config.sample_interval_secs),
            probe: Arc::new(RuntimeProbe),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn MetricsProbe>) -> Self {
        self.probe = probe;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Plain,
    Monitored,
    Enhanced { max_tasks: usize, max_heap_mb: f64 },
    Resilient { max_tasks: usize, max_heap_mb: f64 },
}

impl Mode {
    fn timed(self) -> bool {
        !matches!(self, Mode::Plain)
    }
}

/// State of one start→stop cycle.
#[derive(Default)]
struct Generation {
    sender: Option<Sender<QueuedJob>>,
    workers: Vec<JoinHandle<()>>,
    /// Dropping this stops the monitor loop.
    monitor: Option<watch::Sender<()>>,
    /// Mode of the current or most recent cycle, reused by `restart`.
    mode: Option<Mode>,
    /// Bumped on every launch; a monitor only restarts its own cycle.
    epoch: u64,
}

struct PoolInner {
    max_workers: usize,
    buffer: usize,
    sample_interval: Duration,
    probe: Arc<dyn MetricsProbe>,
    slots: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    restarts: AtomicUsize,
    generation: RwLock<Generation>,
}

/// Fixed-size pool of job workers. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Pool with `max_workers` workers, no extra buffer and the runtime probe.
    pub fn new(max_workers: usize) -> Result<Self> {
        Self::with_options(PoolOptions::new(max_workers))
    }

    pub fn with_options(options: PoolOptions) -> Result<Self> {
        if options.max_workers == 0 {
            return Err(ConductorError::Config(
                "worker pool needs at least one worker".into(),
            ));
        }
        let capacity = options.max_workers + options.buffer;
        Ok(Self {
            inner: Arc::new(PoolInner {
                max_workers: options.max_workers,
                buffer: options.buffer,
                sample_interval: options.sample_interval,
                probe: options.probe,
                slots: Arc::new(Semaphore::new(capacity)),
                in_flight: Arc::new(AtomicUsize::new(0)),
                restarts: AtomicUsize::new(0),
                generation: RwLock::new(Generation::default()),
            }),
        })
    }

    /// Launch the workers.
    pub async fn start(&self) -> Result<()> {
        self.start_mode(Mode::Plain).await
    }

    /// Launch the workers with per-job timings and periodic samples.
    pub async fn start_with_monitoring(&self) -> Result<()> {
        self.start_mode(Mode::Monitored).await
    }

    /// Like [`start_with_monitoring`](Self::start_with_monitoring), plus an
    /// alert whenever a sample exceeds a threshold.
    pub async fn start_with_enhanced_monitoring(
        &self,
        max_tasks: usize,
        max_heap_mb: f64,
    ) -> Result<()> {
        self.start_mode(Mode::Enhanced {
            max_tasks,
            max_heap_mb,
        })
        .await
    }

    /// Like [`start_with_enhanced_monitoring`](Self::start_with_enhanced_monitoring),
    /// but a breach restarts the pool.
    pub async fn start_with_resilient_monitoring(
        &self,
        max_tasks: usize,
        max_heap_mb: f64,
    ) -> Result<()> {
        self.start_mode(Mode::Resilient {
            max_tasks,
            max_heap_mb,
        })
        .await
    }

    /// Start in the mode named by the configuration.
    pub async fn start_configured(&self, config: &PoolConfig) -> Result<()> {
        match config.monitoring {
            MonitoringMode::Off => self.start().await,
            MonitoringMode::Basic => self.start_with_monitoring().await,
            MonitoringMode::Enhanced => {
                self.start_with_enhanced_monitoring(config.max_live_tasks, config.max_heap_mb)
                    .await
            }
            MonitoringMode::Resilient => {
                self.start_with_resilient_monitoring(config.max_live_tasks, config.max_heap_mb)
                    .await
            }
        }
    }

    /// Hand a job to the workers. Waits while every worker is busy and the
    /// buffer is full. Fails with [`ConductorError::PoolClosed`] when the pool
    /// is not running.
    pub async fn submit(&self, job: Arc<dyn Job>) -> Result<()> {
        let generation = self.inner.generation.read().await;
        let sender = generation.sender.as_ref().ok_or(ConductorError::PoolClosed)?;
        let permit = self
            .inner
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ConductorError::PoolClosed)?;

        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let name = job.name().to_string();
        match sender.try_send((job, permit)) {
            Ok(()) => {
                tracing::debug!("📥 Job '{name}' queued");
                Ok(())
            }
            Err(e) => {
                self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                match e {
                    TrySendError::Closed(_) => Err(ConductorError::PoolClosed),
                    TrySendError::Full(_) => Err(ConductorError::Scheduling(format!(
                        "queue unexpectedly full while submitting '{name}'"
                    ))),
                }
            }
        }
    }

    /// Close the queue and wait until every accepted job has finished.
    pub async fn stop(&self) -> Result<()> {
        let mut generation = self.inner.generation.write().await;
        if generation.sender.is_none() {
            return Ok(());
        }
        Self::shutdown(&mut generation).await;
        tracing::info!("🛑 Worker pool stopped");
        Ok(())
    }

    /// Stop, then relaunch with the same monitoring mode and thresholds.
    /// No accepted job is dropped: the old workers drain the queue first.
    /// A pool that is not running stays stopped and gets
    /// [`ConductorError::PoolClosed`].
    pub async fn restart(&self) -> Result<()> {
        self.restart_cycle(None).await
    }

    /// Jobs submitted whose `run` has not returned yet.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn restart_count(&self) -> usize {
        self.inner.restarts.load(Ordering::SeqCst)
    }

    pub async fn is_running(&self) -> bool {
        self.inner.generation.read().await.sender.is_some()
    }

    /// Jobs the pool holds before `submit` waits: workers plus buffer.
    pub fn capacity(&self) -> usize {
        self.inner.max_workers + self.inner.buffer
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    /// The probe used by the monitor, shareable with other watchdogs.
    pub fn probe(&self) -> Arc<dyn MetricsProbe> {
        self.inner.probe.clone()
    }

    async fn restart_cycle(&self, epoch: Option<u64>) -> Result<()> {
        let mut generation = self.inner.generation.write().await;
        if generation.sender.is_none() {
            return Err(ConductorError::PoolClosed);
        }
        if epoch.is_some_and(|e| e != generation.epoch) {
            tracing::debug!("♻️ Restart from a retired monitor ignored");
            return Ok(());
        }
        let mode = generation.mode.ok_or(ConductorError::PoolClosed)?;
        tracing::warn!("♻️ Restarting worker pool ({mode:?})");
        Self::shutdown(&mut generation).await;
        self.launch(&mut generation, mode);
        self.inner.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_mode(&self, mode: Mode) -> Result<()> {
        let mut generation = self.inner.generation.write().await;
        if generation.sender.is_some() {
            return Err(ConductorError::Scheduling(
                "worker pool is already running".into(),
            ));
        }
        self.launch(&mut generation, mode);
        Ok(())
    }

    fn launch(&self, generation: &mut Generation, mode: Mode) {
        let (tx, rx) = async_channel::bounded(self.capacity());
        generation.workers = (0..self.inner.max_workers)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    rx.clone(),
                    self.inner.in_flight.clone(),
                    mode.timed(),
                ))
            })
            .collect();
        generation.sender = Some(tx);
        generation.mode = Some(mode);
        generation.epoch += 1;

        if mode != Mode::Plain {
            let (stop_tx, stop_rx) = watch::channel(());
            tokio::spawn(monitor_loop(
                Arc::downgrade(&self.inner),
                generation.epoch,
                mode,
                self.inner.probe.clone(),
                self.inner.sample_interval,
                stop_rx,
            ));
            generation.monitor = Some(stop_tx);
        }

        tracing::info!(
            "🚀 Worker pool started: {} workers, buffer {} ({mode:?})",
            self.inner.max_workers,
            self.inner.buffer
        );
    }

    async fn shutdown(generation: &mut Generation) {
        generation.monitor = None;
        generation.sender = None;
        for handle in generation.workers.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!("❌ Worker task ended abnormally: {e}");
            }
        }
    }
}

async fn worker_loop(
    id: usize,
    rx: Receiver<QueuedJob>,
    in_flight: Arc<AtomicUsize>,
    timed: bool,
) {
    while let Ok((job, permit)) = rx.recv().await {
        let started = Instant::now();
        match AssertUnwindSafe(job.run()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!("❌ Job '{}' ({}) failed: {e}", job.name(), job.id());
            }
            Err(_) => {
                tracing::error!("💥 Job '{}' ({}) panicked on worker {id}", job.name(), job.id());
            }
        }
        if timed {
            tracing::info!("⏱️ Job '{}' took {:?}", job.name(), started.elapsed());
        }
        in_flight.fetch_sub(1, Ordering::SeqCst);
        drop(permit);
    }
    tracing::debug!("👷 Worker {id} exited");
}

/// Periodic sampler. Boxed so that `restart` (which spawns a new sampler)
/// can be awaited from inside it.
fn monitor_loop(
    pool: Weak<PoolInner>,
    epoch: u64,
    mode: Mode,
    probe: Arc<dyn MetricsProbe>,
    interval: Duration,
    mut shutdown: watch::Receiver<()>,
) -> BoxFuture<'static, ()> {
    async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let metrics = probe.sample();
            tracing::info!(
                "📊 Pool sample: {} live tasks, {:.1} MB heap",
                metrics.live_tasks,
                metrics.heap_mb()
            );

            match mode {
                Mode::Enhanced {
                    max_tasks,
                    max_heap_mb,
                } => {
                    if let Some(reason) = metrics.breach(max_tasks, max_heap_mb) {
                        tracing::warn!("🚨 Pool threshold exceeded: {reason}");
                    }
                }
                Mode::Resilient {
                    max_tasks,
                    max_heap_mb,
                } => {
                    let Some(reason) = metrics.breach(max_tasks, max_heap_mb) else {
                        continue;
                    };
                    tracing::warn!("🚨 Pool threshold exceeded: {reason}, restarting");
                    let Some(inner) = pool.upgrade() else {
                        break;
                    };
                    match (WorkerPool { inner }).restart_cycle(Some(epoch)).await {
                        Ok(()) => {}
                        Err(ConductorError::PoolClosed) => {
                            tracing::debug!("🛑 Pool stopped before the restart ran");
                        }
                        Err(e) => tracing::error!("❌ Pool restart failed: {e}"),
                    }
                    // The restart launched a fresh sampler.
                    break;
                }
                Mode::Plain | Mode::Monitored => {}
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, JobStatusCode};
    use crate::monitor::PoolMetrics;
    use async_trait::async_trait;
    use tokio::sync::Notify;
    use uuid::Uuid;

    struct CountingJob {
        id: Uuid,
        delay: Duration,
        done: Arc<AtomicUsize>,
    }

    impl CountingJob {
        fn new(delay_ms: u64, done: &Arc<AtomicUsize>) -> Arc<dyn Job> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                delay: Duration::from_millis(delay_ms),
                done: done.clone(),
            })
        }
    }

    #[async_trait]
    impl Job for CountingJob {
        fn id(&self) -> Uuid {
            self.id
        }
        fn name(&self) -> &str {
            "counting"
        }
        fn user_id(&self) -> Option<Uuid> {
            None
        }
        fn status(&self) -> JobStatus {
            JobStatus::new(JobStatusCode::Pending, "")
        }
        async fn run(&self) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn retry(&self) -> Result<()> {
            Ok(())
        }
        fn cancel(&self) -> Result<()> {
            Ok(())
        }
    }

    struct BlockingJob(Arc<Notify>);

    #[async_trait]
    impl Job for BlockingJob {
        fn id(&self) -> Uuid {
            Uuid::nil()
        }
        fn name(&self) -> &str {
            "blocking"
        }
        fn user_id(&self) -> Option<Uuid> {
            None
        }
        fn status(&self) -> JobStatus {
            JobStatus::new(JobStatusCode::Running, "")
        }
        async fn run(&self) -> Result<()> {
            self.0.notified().await;
            Ok(())
        }
        async fn retry(&self) -> Result<()> {
            Ok(())
        }
        fn cancel(&self) -> Result<()> {
            Ok(())
        }
    }

    struct PanickingJob;

    #[async_trait]
    impl Job for PanickingJob {
        fn id(&self) -> Uuid {
            Uuid::nil()
        }
        fn name(&self) -> &str {
            "panicking"
        }
        fn user_id(&self) -> Option<Uuid> {
            None
        }
        fn status(&self) -> JobStatus {
            JobStatus::new(JobStatusCode::Running, "")
        }
        async fn run(&self) -> Result<()> {
            panic!("boom");
        }
        async fn retry(&self) -> Result<()> {
            Ok(())
        }
        fn cancel(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FixedProbe(Arc<AtomicUsize>);

    impl MetricsProbe for FixedProbe {
        fn sample(&self) -> PoolMetrics {
            PoolMetrics {
                live_tasks: self.0.load(Ordering::SeqCst),
                heap_bytes: 0,
            }
        }
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(
            WorkerPool::new(0),
            Err(ConductorError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_drains_accepted_jobs() {
        let pool = WorkerPool::with_options(PoolOptions {
            buffer: 8,
            ..PoolOptions::new(2)
        })
        .unwrap();
        pool.start().await.unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            pool.submit(CountingJob::new(30, &done)).await.unwrap();
        }
        pool.stop().await.unwrap();

        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(pool.in_flight(), 0);
        assert!(!pool.is_running().await);
    }

    #[tokio::test]
    async fn test_submit_after_stop_fails() {
        let pool = WorkerPool::new(1).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        assert!(matches!(
            pool.submit(CountingJob::new(0, &done)).await,
            Err(ConductorError::PoolClosed)
        ));

        pool.start().await.unwrap();
        pool.stop().await.unwrap();
        assert!(matches!(
            pool.submit(CountingJob::new(0, &done)).await,
            Err(ConductorError::PoolClosed)
        ));
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let pool = WorkerPool::new(1).unwrap();
        pool.start().await.unwrap();
        assert!(pool.start_with_monitoring().await.is_err());
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_blocks_when_saturated() {
        let pool = WorkerPool::new(1).unwrap();
        pool.start().await.unwrap();
        assert_eq!(pool.capacity(), 1);

        let gate = Arc::new(Notify::new());
        pool.submit(Arc::new(BlockingJob(gate.clone()))).await.unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            pool.submit(CountingJob::new(0, &done)),
        )
        .await;
        assert!(blocked.is_err(), "submit should wait while the worker is busy");
        assert_eq!(pool.in_flight(), 1);

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(1), pool.submit(CountingJob::new(0, &done)))
            .await
            .unwrap()
            .unwrap();
        pool.stop().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_job_is_isolated() {
        let pool = WorkerPool::new(1).unwrap();
        pool.start().await.unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        pool.submit(Arc::new(PanickingJob)).await.unwrap();
        pool.submit(CountingJob::new(0, &done)).await.unwrap();
        pool.stop().await.unwrap();

        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_restart_keeps_accepting() {
        let pool = WorkerPool::with_options(PoolOptions {
            buffer: 4,
            ..PoolOptions::new(2)
        })
        .unwrap();
        pool.start_with_monitoring().await.unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            pool.submit(CountingJob::new(20, &done)).await.unwrap();
        }
        pool.restart().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert_eq!(pool.restart_count(), 1);
        assert!(pool.is_running().await);

        pool.submit(CountingJob::new(0, &done)).await.unwrap();
        pool.stop().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_restart_requires_prior_start() {
        let pool = WorkerPool::new(1).unwrap();
        assert!(matches!(pool.restart().await, Err(ConductorError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_restart_after_stop_stays_stopped() {
        let pool = WorkerPool::new(1).unwrap();
        pool.start_with_monitoring().await.unwrap();
        pool.stop().await.unwrap();

        assert!(matches!(pool.restart().await, Err(ConductorError::PoolClosed)));
        assert!(!pool.is_running().await);
        assert_eq!(pool.restart_count(), 0);
    }

    /// Reports a breach, but only after `stop` had a chance to run.
    struct SlowBreachProbe(Arc<Notify>);

    impl MetricsProbe for SlowBreachProbe {
        fn sample(&self) -> PoolMetrics {
            self.0.notify_one();
            std::thread::sleep(Duration::from_millis(150));
            PoolMetrics {
                live_tasks: 1_000,
                heap_bytes: 0,
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_during_breach_sample_stays_stopped() {
        let sampling = Arc::new(Notify::new());
        let pool = WorkerPool::with_options(PoolOptions {
            sample_interval: Duration::from_millis(20),
            ..PoolOptions::new(1).with_probe(Arc::new(SlowBreachProbe(sampling.clone())))
        })
        .unwrap();
        pool.start_with_resilient_monitoring(10, 1_000_000.0)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), sampling.notified())
            .await
            .unwrap();
        pool.stop().await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!pool.is_running().await);
        assert_eq!(pool.restart_count(), 0);
    }

    #[tokio::test]
    async fn test_resilient_breach_restarts_pool() {
        let live = Arc::new(AtomicUsize::new(1_000));
        let pool = WorkerPool::with_options(PoolOptions {
            sample_interval: Duration::from_millis(20),
            ..PoolOptions::new(2).with_probe(Arc::new(FixedProbe(live.clone())))
        })
        .unwrap();
        pool.start_with_resilient_monitoring(10, 1_000_000.0)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while pool.restart_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pool should restart after a breach");
        live.store(0, Ordering::SeqCst);

        let done = Arc::new(AtomicUsize::new(0));
        pool.submit(CountingJob::new(0, &done)).await.unwrap();
        pool.stop().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enhanced_breach_only_alerts() {
        let live = Arc::new(AtomicUsize::new(1_000));
        let pool = WorkerPool::with_options(PoolOptions {
            sample_interval: Duration::from_millis(10),
            ..PoolOptions::new(1).with_probe(Arc::new(FixedProbe(live)))
        })
        .unwrap();
        pool.start_with_enhanced_monitoring(10, 1_000_000.0)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pool.restart_count(), 0);
        pool.stop().await.unwrap();
    }
}
