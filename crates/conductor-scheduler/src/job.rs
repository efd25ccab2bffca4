//! Job definitions — the core data model for scheduled work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::error::{ConductorError, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use uuid::Uuid;

/// Bytes of combined stdout/stderr kept in `last_output`.
const MAX_OUTPUT_BYTES: usize = 4096;

/// Lifecycle state of a job. Monotonic: pending → running → completed | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatusCode {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatusCode {
    /// Whether `self → next` is an edge of the lifecycle.
    pub fn can_transition_to(self, next: JobStatusCode) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Status record of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub code: JobStatusCode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<String>,
    /// Executions started so far, including retries.
    #[serde(default)]
    pub attempts: u32,
}

impl JobStatus {
    pub fn new(code: JobStatusCode, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
            updated_at: Utc::now(),
            progress: 0.0,
            last_output: None,
            attempts: 0,
        }
    }
}

/// Response payload returned by scheduling operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub scheduled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobStatusResponse {
    pub fn scheduled(job_id: Uuid, status: JobStatus) -> Self {
        Self {
            job_id: job_id.to_string(),
            status,
            scheduled: true,
            error: None,
            created_at: Utc::now(),
        }
    }
}

/// A unit of schedulable work.
///
/// The worker pool only ever calls [`Job::run`]. Retrying is the job's own
/// decision, and [`Job::cancel`] only has an effect before a worker picks the
/// job up: `run` is not wired to any cancellation signal.
#[async_trait]
pub trait Job: Send + Sync {
    fn id(&self) -> Uuid;
    fn name(&self) -> &str;
    /// User that scheduled the job, if known.
    fn user_id(&self) -> Option<Uuid>;
    /// Snapshot of the current status record.
    fn status(&self) -> JobStatus;
    async fn run(&self) -> Result<()>;
    async fn retry(&self) -> Result<()>;
    fn cancel(&self) -> Result<()>;
}

/// A job that executes a shell command with `sh -c`.
#[derive(Debug)]
pub struct CommandJob {
    id: Uuid,
    name: String,
    schedule: Mutex<String>,
    command: String,
    user_id: Option<Uuid>,
    timeout: Option<Duration>,
    max_retries: u32,
    created_at: DateTime<Utc>,
    status: Mutex<JobStatus>,
    claimed: AtomicBool,
    cancelled: AtomicBool,
}

impl CommandJob {
    /// Create a pending job with a fresh identifier.
    pub fn new(name: &str, schedule: &str, command: &str) -> Self {
        Self::with_id(Uuid::new_v4(), name, schedule, command)
    }

    /// Create a pending job with a caller-supplied identifier.
    pub fn with_id(id: Uuid, name: &str, schedule: &str, command: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            schedule: Mutex::new(schedule.to_string()),
            command: command.to_string(),
            user_id: None,
            timeout: None,
            max_retries: 0,
            created_at: Utc::now(),
            status: Mutex::new(JobStatus::new(JobStatusCode::Pending, "created")),
            claimed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Fail the execution when the command runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Extra attempts `run` makes after a failed execution.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn schedule(&self) -> String {
        self.schedule_guard().clone()
    }

    /// Replace the schedule expression. The expression is not validated.
    pub fn set_schedule(&self, schedule: &str) {
        *self.schedule_guard() = schedule.to_string();
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Update the human-readable message without touching the status code.
    pub fn set_message(&self, message: &str) {
        let mut status = self.status_guard();
        status.message = message.to_string();
        status.updated_at = Utc::now();
    }

    /// Claim a pending job for execution. Succeeds at most once per job.
    pub fn try_claim(&self) -> bool {
        if self.is_cancelled() || self.status_guard().code != JobStatusCode::Pending {
            return false;
        }
        !self.claimed.swap(true, Ordering::SeqCst)
    }

    /// Undo a claim whose job never reached a worker. No effect once the
    /// job has started.
    pub fn release_claim(&self) {
        let status = self.status_guard();
        if status.code == JobStatusCode::Pending {
            self.claimed.store(false, Ordering::SeqCst);
        }
    }

    /// JSON view used by stats and the HTTP API.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "schedule": self.schedule(),
            "command": self.command,
            "user_id": self.user_id,
            "timeout_secs": self.timeout.map(|t| t.as_secs_f64()),
            "max_retries": self.max_retries,
            "created_at": self.created_at.to_rfc3339(),
            "cancelled": self.is_cancelled(),
            "status": self.status(),
        })
    }

    fn status_guard(&self) -> MutexGuard<'_, JobStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule_guard(&self) -> MutexGuard<'_, String> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checked under the status lock, which `cancel` also holds, so a job
    /// is either cancelled or started, never both.
    fn transition(&self, next: JobStatusCode, message: &str) -> Result<()> {
        let mut status = self.status_guard();
        if next == JobStatusCode::Running && self.is_cancelled() {
            return Err(ConductorError::JobCancelled(self.id.to_string()));
        }
        if !status.code.can_transition_to(next) {
            return Err(ConductorError::InvalidTransition(format!(
                "job {} cannot move from {} to {}",
                self.id, status.code, next
            )));
        }
        status.code = next;
        status.message = message.to_string();
        status.updated_at = Utc::now();
        if next == JobStatusCode::Completed {
            status.progress = 100.0;
        }
        Ok(())
    }

    fn attempts(&self) -> u32 {
        self.status_guard().attempts
    }

    /// One execution of the command; records the attempt and its output.
    async fn execute_once(&self) -> Result<()> {
        let attempt = {
            let mut status = self.status_guard();
            status.attempts += 1;
            status.updated_at = Utc::now();
            status.attempts
        };

        if self.command.trim().is_empty() {
            return Err(ConductorError::Execution(format!(
                "job {} has no command",
                self.id
            )));
        }

        tracing::debug!("⚙️ Job '{}' attempt {}: {}", self.name, attempt, self.command);

        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .kill_on_drop(true)
            .output();

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child).await.map_err(|_| {
                ConductorError::Execution(format!("job {} timed out after {:?}", self.id, limit))
            })?,
            None => child.await,
        }
        .map_err(|e| ConductorError::Execution(format!("failed to spawn command: {e}")))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        {
            let mut status = self.status_guard();
            status.last_output = Some(truncate_output(text.trim_end()));
            status.updated_at = Utc::now();
        }

        if output.status.success() {
            Ok(())
        } else {
            Err(ConductorError::Execution(format!(
                "command exited with {}",
                output.status
            )))
        }
    }
}

#[async_trait]
impl Job for CommandJob {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn user_id(&self) -> Option<Uuid> {
        self.user_id
    }

    fn status(&self) -> JobStatus {
        self.status_guard().clone()
    }

    async fn run(&self) -> Result<()> {
        self.transition(JobStatusCode::Running, "running")?;
        tracing::info!("▶️ Running job: '{}' ({})", self.name, self.id);

        let mut outcome = self.execute_once().await;
        while let Err(e) = &outcome {
            if self.attempts() > self.max_retries {
                break;
            }
            tracing::warn!("🔁 Job '{}' failed ({e}), retrying", self.name);
            outcome = self.retry().await;
        }

        match outcome {
            Ok(()) => {
                self.transition(JobStatusCode::Completed, "completed")?;
                tracing::info!("✅ Job '{}' completed", self.name);
                Ok(())
            }
            Err(e) => {
                self.transition(JobStatusCode::Failed, &e.to_string())?;
                Err(e)
            }
        }
    }

    /// Run the command once more. Only valid while the job is running.
    async fn retry(&self) -> Result<()> {
        let code = self.status_guard().code;
        if code != JobStatusCode::Running {
            return Err(ConductorError::InvalidTransition(format!(
                "job {} can only retry while running (currently {code})",
                self.id
            )));
        }
        tracing::info!("🔁 Retrying job: '{}' ({})", self.name, self.id);
        self.execute_once().await
    }

    fn cancel(&self) -> Result<()> {
        let mut status = self.status_guard();
        if status.code == JobStatusCode::Running {
            return Err(ConductorError::InvalidTransition(format!(
                "job {} is already running and cannot be cancelled",
                self.id
            )));
        }
        self.cancelled.store(true, Ordering::SeqCst);
        if status.code == JobStatusCode::Pending {
            status.message = "cancelled".to_string();
            status.updated_at = Utc::now();
        }
        tracing::info!("🛑 Cancelled job: '{}' ({})", self.name, self.id);
        Ok(())
    }
}

/// Keep at most the last `MAX_OUTPUT_BYTES` of output, on a char boundary.
fn truncate_output(text: &str) -> String {
    if text.len() <= MAX_OUTPUT_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
