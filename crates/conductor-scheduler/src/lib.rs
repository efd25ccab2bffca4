//! # Conductor Scheduler
//!
//! Job model, bounded worker pool and the poller that feeds it.
//!
//! ## Design Principles
//! - Fixed worker count, backpressure at `submit`
//! - Jobs own their lifecycle, retries and timeouts
//! - Sources decide what is due; the poller only submits
//! - Optional self-monitoring that restarts the pool on resource breaches
//!
//! ## Architecture
//! ```text
//! Scheduler (facade)
//!   ├── JobRegistry ─────────┐
//!   ├── SqliteJobSource ─────┤  JobSource::get_scheduled_cron_jobs
//!   └── CronJobScheduler ◄───┘  (tokio interval)
//!          └── WorkerPool::submit
//!                ├── worker 0..N → Job::run (sh -c, retry, timeout)
//!                └── monitor → MetricsProbe → alert / restart
//! ```

pub mod cron;
pub mod facade;
pub mod job;
pub mod monitor;
pub mod persistence;
pub mod pool;
pub mod source;

pub use facade::{JobRegistry, JobScheduler, Scheduler};
pub use job::{CommandJob, Job, JobStatus, JobStatusCode, JobStatusResponse};
pub use monitor::{MetricsProbe, PoolMetrics, PreLaunchReport, RuntimeProbe, pre_launch_checks};
pub use persistence::{CronJobRecord, SqliteJobSource};
pub use pool::{PoolOptions, WorkerPool};
pub use source::{CronJobScheduler, JobSource};
