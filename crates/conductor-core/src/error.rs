//! Error types for Conductor.

use thiserror::Error;

/// Every failure the scheduling core can report.
#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// No capability rule matched the intent path.
    #[error("no capability mapped for {0}")]
    CapabilityUnresolved(String),

    /// A capability resolved but has no handler behind it yet.
    #[error("{0} not wired yet")]
    CapabilityUnwired(String),

    #[error("Scheduling error: {0}")]
    Scheduling(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    #[error("job with ID {0} not found")]
    JobNotFound(String),

    #[error("Invalid job transition: {0}")]
    InvalidTransition(String),

    #[error("job {0} was cancelled")]
    JobCancelled(String),

    #[error("Worker pool is not running")]
    PoolClosed,

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Short machine-readable category, used in event metadata and HTTP bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration",
            Self::CapabilityUnresolved(_) => "capability_unresolved",
            Self::CapabilityUnwired(_) => "capability_unwired",
            Self::Scheduling(_) => "scheduling",
            Self::Execution(_) | Self::JobCancelled(_) => "execution",
            Self::ResourceExhaustion(_) => "resource_exhaustion",
            Self::JobNotFound(_) => "not_found",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::PoolClosed => "pool_closed",
            Self::Database(_) => "database",
            Self::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;
