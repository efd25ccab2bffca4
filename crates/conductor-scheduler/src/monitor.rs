//! Resource sampling, the live-task watchdog and startup checks.

use std::sync::Arc;
use std::time::Duration;

use conductor_core::error::{ConductorError, Result};
use nix::sys::resource::{Resource, getrlimit, setrlimit};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// One resource sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PoolMetrics {
    /// Tasks currently alive on the tokio runtime.
    pub live_tasks: usize,
    /// Resident memory of the process.
    pub heap_bytes: u64,
}

impl PoolMetrics {
    pub fn heap_mb(&self) -> f64 {
        self.heap_bytes as f64 / (1024.0 * 1024.0)
    }

    /// Describe the first exceeded threshold, if any.
    pub fn breach(&self, max_tasks: usize, max_heap_mb: f64) -> Option<String> {
        if self.live_tasks > max_tasks {
            return Some(format!(
                "{} live tasks exceed the limit of {max_tasks}",
                self.live_tasks
            ));
        }
        let heap_mb = self.heap_mb();
        if heap_mb > max_heap_mb {
            return Some(format!(
                "heap {heap_mb:.1} MB exceeds the limit of {max_heap_mb:.1} MB"
            ));
        }
        None
    }
}

/// Source of resource samples. Swappable so thresholds can be tested.
pub trait MetricsProbe: Send + Sync {
    fn sample(&self) -> PoolMetrics;
}

/// Samples the current tokio runtime and the process resident set.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeProbe;

impl MetricsProbe for RuntimeProbe {
    fn sample(&self) -> PoolMetrics {
        let live_tasks = tokio::runtime::Handle::try_current()
            .map(|h| h.metrics().num_alive_tasks())
            .unwrap_or(0);
        PoolMetrics {
            live_tasks,
            heap_bytes: resident_bytes(),
        }
    }
}

/// Resident set size of this process, 0 when unavailable.
fn resident_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb) = line.split_whitespace().nth(1).and_then(|s| s.parse::<u64>().ok()) {
                        return kb * 1024;
                    }
                }
            }
        }
    }
    0
}

/// Spawn the live-task watchdog. Logs a warning on every tick where the
/// probe reports more than `ceiling` live tasks. Stops when `shutdown`
/// changes or its sender is dropped.
pub fn spawn_watchdog(
    probe: Arc<dyn MetricsProbe>,
    ceiling: usize,
    interval: Duration,
    mut shutdown: watch::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("🐕 Watchdog started (ceiling {ceiling} live tasks)");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            let metrics = probe.sample();
            if metrics.live_tasks > ceiling {
                tracing::warn!(
                    "⚠️ High task count: {} live tasks (ceiling {ceiling})",
                    metrics.live_tasks
                );
            }
        }
        tracing::info!("🐕 Watchdog stopped");
    })
}

/// What [`pre_launch_checks`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PreLaunchReport {
    pub fd_limit: u64,
    pub cores: usize,
}

/// Startup gate: raise the open-file soft limit towards `fd_floor` and
/// require at least `min_cores` logical cores.
pub fn pre_launch_checks(fd_floor: u64, min_cores: usize) -> Result<PreLaunchReport> {
    let (mut soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).map_err(|e| {
        ConductorError::ResourceExhaustion(format!("cannot read open file limit: {e}"))
    })?;

    if soft < fd_floor {
        let target = fd_floor.min(hard);
        if target > soft {
            match setrlimit(Resource::RLIMIT_NOFILE, target, hard) {
                Ok(()) => {
                    tracing::info!("📂 Raised open file limit from {soft} to {target}");
                    soft = target;
                }
                Err(e) => tracing::warn!("⚠️ Failed to raise open file limit: {e}"),
            }
        }
    }
    if soft < fd_floor {
        return Err(ConductorError::ResourceExhaustion(format!(
            "open file limit {soft} is below the required {fd_floor}"
        )));
    }

    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    if cores < min_cores {
        return Err(ConductorError::ResourceExhaustion(format!(
            "{cores} logical cores available, at least {min_cores} required"
        )));
    }

    tracing::info!("✅ Pre-launch checks passed: {soft} open files, {cores} cores");
    Ok(PreLaunchReport {
        fd_limit: soft,
        cores,
    })
}
