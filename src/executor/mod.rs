//! The capability interface the agent uses to run jobs, with a production
//! docker implementation and an in-memory stub for tests.

pub mod docker;
pub mod local;
pub mod stub;

use thiserror::Error;

use crate::schema::{JobDefinition, JobTaskResults, TaskError, TaskStage};

pub use local::LocalDockerExecutor;
pub use stub::StubExecutor;

#[derive(Error, Debug)]
pub enum ExecutorError {
    /// The job's volume could not be prepared: commit unobtainable, disk
    /// full, or a required input missing.
    #[error("Could not prepare job: {message}")]
    Prep { message: String, retryable: bool },

    #[error("Container engine error: {0}")]
    Docker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ExecutorError> for crate::error::RunnerError {
    fn from(err: ExecutorError) -> Self {
        crate::error::RunnerError::Executor(err.to_string())
    }
}

impl ExecutorError {
    /// Whether a fresh task could plausibly succeed. Transport and engine
    /// hiccups are retryable; a missing input is not.
    pub fn retryable(&self) -> bool {
        match self {
            ExecutorError::Prep { retryable, .. } => *retryable,
            ExecutorError::Docker(_) | ExecutorError::Io(_) => true,
            ExecutorError::Other(_) => false,
        }
    }

    pub fn to_task_error(&self) -> TaskError {
        let kind = match self {
            ExecutorError::Prep { .. } => "prep_failed",
            ExecutorError::Docker(_) => "container_engine",
            ExecutorError::Io(_) => "io",
            ExecutorError::Other(_) => "executor",
        };
        TaskError {
            kind: kind.to_string(),
            message: self.to_string(),
            retryable: self.retryable(),
        }
    }
}

/// A snapshot of a job's executor-side state. Idempotent to compute; the
/// agent derives everything it does from this.
#[derive(Debug, Clone, Default)]
pub struct JobStatus {
    pub stage: TaskStage,
    pub exit_code: Option<i64>,
    /// Nanosecond timestamp of the most recent stage change, where known.
    pub timestamp_ns: Option<i64>,
    /// Populated once the job has been finalized (or errored).
    pub results: Option<JobTaskResults>,
}

impl JobStatus {
    pub fn new(stage: TaskStage) -> Self {
        JobStatus {
            stage,
            ..Default::default()
        }
    }
}

/// Abstract interface to a container runtime.
///
/// `prepare` and `finalize` are synchronous from the caller's point of view:
/// when they return, the corresponding stage has been reached. `execute` is
/// non-blocking: it returns once the container exists.
#[allow(async_fn_in_trait)]
pub trait Executor: Send + Sync {
    /// Create a private volume for the job, copy in the study code at the
    /// resolved commit and the outputs of dependency jobs.
    async fn prepare(&self, job: &JobDefinition) -> Result<JobStatus, ExecutorError>;

    /// Start the job container on the prepared volume.
    async fn execute(&self, job: &JobDefinition) -> Result<JobStatus, ExecutorError>;

    /// Resolve output patterns against the volume, persist outputs to the
    /// privacy-appropriate storage, and write the log bundle.
    async fn finalize(
        &self,
        job: &JobDefinition,
        cancelled: bool,
        error: Option<TaskError>,
    ) -> Result<JobStatus, ExecutorError>;

    /// Forcibly stop a running container.
    async fn terminate(&self, job: &JobDefinition) -> Result<JobStatus, ExecutorError>;

    /// Remove container and volume. Safe to call in any state.
    async fn cleanup(&self, job: &JobDefinition) -> Result<JobStatus, ExecutorError>;

    /// Inspect current state. Idempotent; safe to call repeatedly.
    async fn get_status(&self, job: &JobDefinition) -> Result<JobStatus, ExecutorError>;

    /// Probe the backend database for its maintenance status. Returns the
    /// raw status token, restricted to a small allowlist.
    async fn db_status(&self, database_name: &str) -> Result<String, ExecutorError>;
}
