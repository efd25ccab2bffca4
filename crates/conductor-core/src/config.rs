//! Conductor configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ConductorError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl ConductorConfig {
    /// Load config from `CONDUCTOR_CONFIG` or the default path, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var("CONDUCTOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConductorError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ConductorError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConductorError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pool.workers == 0 {
            return Err(ConductorError::Config("pool.workers must be at least 1".into()));
        }
        if self.pool.max_live_tasks == 0 {
            return Err(ConductorError::Config("pool.max_live_tasks must be at least 1".into()));
        }
        if self.pool.max_heap_mb.is_nan() || self.pool.max_heap_mb <= 0.0 {
            return Err(ConductorError::Config("pool.max_heap_mb must be positive".into()));
        }
        if self.pool.sample_interval_secs == 0 || self.poller.interval_secs == 0 {
            return Err(ConductorError::Config("intervals must be at least 1 second".into()));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Conductor home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".conductor")
    }
}

/// How the worker pool watches itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitoringMode {
    /// Workers only.
    Off,
    /// Per-job timings plus periodic resource samples.
    Basic,
    /// Samples plus threshold alerts.
    Enhanced,
    /// Alerts plus automatic restart on breach.
    Resilient,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Extra queue slots beyond the workers themselves. 0 means a submit
    /// blocks as soon as every worker is busy.
    #[serde(default)]
    pub buffer: usize,
    #[serde(default = "default_monitoring")]
    pub monitoring: MonitoringMode,
    #[serde(default = "default_max_live_tasks")]
    pub max_live_tasks: usize,
    #[serde(default = "default_max_heap_mb")]
    pub max_heap_mb: f64,
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,
}

fn default_workers() -> usize { 4 }
fn default_monitoring() -> MonitoringMode { MonitoringMode::Resilient }
fn default_max_live_tasks() -> usize { 100 }
fn default_max_heap_mb() -> f64 { 500.0 }
fn default_sample_interval() -> u64 { 5 }

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            buffer: 0,
            monitoring: default_monitoring(),
            max_live_tasks: default_max_live_tasks(),
            max_heap_mb: default_max_heap_mb(),
            sample_interval_secs: default_sample_interval(),
        }
    }
}

/// Cron poller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
}

fn default_poll_interval() -> u64 { 60 }

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
        }
    }
}

/// Process-level monitor and startup gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Warn when the runtime holds more live tasks than this.
    #[serde(default = "default_task_ceiling")]
    pub task_ceiling: usize,
    #[serde(default = "default_fd_floor")]
    pub fd_floor: u64,
    #[serde(default = "default_min_cores")]
    pub min_cores: usize,
    #[serde(default = "bool_true")]
    pub prelaunch_checks: bool,
}

fn bool_true() -> bool { true }
fn default_task_ceiling() -> usize { 100 }
fn default_fd_floor() -> u64 { 10_000 }
fn default_min_cores() -> usize { 2 }

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            task_ceiling: default_task_ceiling(),
            fd_floor: default_fd_floor(),
            min_cores: default_min_cores(),
            prelaunch_checks: true,
        }
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// How many FSM events `/api/events` keeps in memory.
    #[serde(default = "default_event_history")]
    pub event_history: usize,
    /// Require an `X-Pairing-Code` header on every `/api` route.
    #[serde(default = "bool_true")]
    pub require_pairing: bool,
    /// Browser origins allowed by CORS. Empty allows none; `"*"` allows any.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_port() -> u16 { 3000 }
fn default_host() -> String { "127.0.0.1".into() }
fn default_event_history() -> usize { 100 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            event_history: default_event_history(),
            require_pairing: true,
            cors_origins: Vec::new(),
        }
    }
}

/// Metrics export configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Prefix prepended to every exported metric name.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String { "conductor".into() }

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
        }
    }
}

/// Job store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String { "~/.conductor/jobs.db".into() }

impl StorageConfig {
    /// Database path with `~` expanded.
    pub fn resolved_db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.db_path).to_string())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}
