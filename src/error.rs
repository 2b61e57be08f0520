use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task {task_id} does not belong to backend {backend}")]
    BackendMismatch { task_id: String, backend: String },

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RunnerError>;
