use thiserror::Error;

use crate::types::InstanceId;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid trigger, timezone, or configuration.
    #[error(transparent)]
    Core(#[from] cadence_core::CoreError),

    /// `next_run_time` was set on an inactive job.
    #[error("Invalid state for job {job_id}: {reason}")]
    InvalidJobState { job_id: String, reason: String },

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Job ID already in use: {id}")]
    ConflictingJobId { id: String },

    /// No live instance with the given ID is tracked by the executor.
    #[error("Job instance not found: {instance_id}")]
    InstanceNotFound { instance_id: InstanceId },

    /// The job already runs as many instances as it allows.
    #[error("Job {job_id} reached its limit of {max} running instances")]
    MaxInstancesReached { job_id: String, max: u32 },

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    /// The executor has not been started (or was already torn down).
    #[error("Executor is not set up")]
    ExecutorNotSetup,

    /// The worker process could not be launched.
    #[error("Failed to start worker process: {0}")]
    WorkerSpawn(String),

    /// A dynamic argument producer panicked during submission.
    #[error("Dynamic argument '{name}' failed: {message}")]
    DynamicArgument { name: String, message: String },

    #[error("Invalid job id pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

impl SchedulerError {
    /// Short error code string used in logs and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Core(e) => e.code(),
            SchedulerError::InvalidJobState { .. } => "INVALID_JOB_STATE",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::ConflictingJobId { .. } => "CONFLICTING_JOB_ID",
            SchedulerError::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            SchedulerError::MaxInstancesReached { .. } => "MAX_INSTANCES_REACHED",
            SchedulerError::AlreadyRunning => "ALREADY_RUNNING",
            SchedulerError::NotRunning => "NOT_RUNNING",
            SchedulerError::ExecutorNotSetup => "EXECUTOR_NOT_SETUP",
            SchedulerError::WorkerSpawn(_) => "WORKER_SPAWN_FAILED",
            SchedulerError::DynamicArgument { .. } => "DYNAMIC_ARGUMENT_FAILED",
            SchedulerError::InvalidPattern(_) => "INVALID_PATTERN",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
