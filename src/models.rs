//! Core data model: job requests, jobs, tasks and backend flags.
//!
//! These are the records the controller persists. The agent never sees them
//! directly; it works with the wire types in [`crate::schema`].

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coarse job state, used by the scheduler to decide how to handle a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Pending,
    Running,
    Failed,
    Succeeded,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Failed | State::Succeeded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::Running => "running",
            State::Failed => "failed",
            State::Succeeded => "succeeded",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(State::Pending),
            "running" => Some(State::Running),
            "failed" => Some(State::Failed),
            "succeeded" => Some(State::Succeeded),
            _ => None,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fine-grained job status. In contrast to [`State`] these play no role in
/// control flow beyond the transitions described in the scheduler; they are
/// machine readable versions of the human readable status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    // Pending codes
    Created,
    Initiated,
    WaitingPaused,
    WaitingDbMaintenance,
    WaitingOnDependencies,
    WaitingOnWorkers,
    WaitingOnDbWorkers,
    WaitingOnReboot,
    WaitingOnNewTask,

    // Running codes, mirroring the agent-side task stages
    Preparing,
    Prepared,
    Executing,
    Executed,
    Finalizing,
    Finalized,

    // Terminal success
    Succeeded,

    // Terminal failures
    DependencyFailed,
    NonzeroExit,
    CancelledByUser,
    UnmatchedPatterns,
    InternalError,
    KilledByAdmin,
    StaleCodelists,
    InvalidPipeline,
    JobError,
}

impl StatusCode {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StatusCode::Succeeded
                | StatusCode::DependencyFailed
                | StatusCode::NonzeroExit
                | StatusCode::CancelledByUser
                | StatusCode::UnmatchedPatterns
                | StatusCode::InternalError
                | StatusCode::KilledByAdmin
                | StatusCode::StaleCodelists
                | StatusCode::InvalidPipeline
                | StatusCode::JobError
        )
    }

    /// Codes which reset a previously dispatched job back to PENDING.
    pub fn is_reset(self) -> bool {
        matches!(
            self,
            StatusCode::WaitingOnReboot
                | StatusCode::WaitingDbMaintenance
                | StatusCode::WaitingOnNewTask
        )
    }

    /// The coarse state implied by this code, if it forces one.
    pub fn implied_state(self) -> Option<State> {
        if self.is_reset() {
            return Some(State::Pending);
        }
        match self {
            StatusCode::Initiated
            | StatusCode::Preparing
            | StatusCode::Prepared
            | StatusCode::Executing
            | StatusCode::Executed
            | StatusCode::Finalizing
            | StatusCode::Finalized => Some(State::Running),
            StatusCode::Succeeded => Some(State::Succeeded),
            code if code.is_terminal() => Some(State::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::Created => "created",
            StatusCode::Initiated => "initiated",
            StatusCode::WaitingPaused => "paused",
            StatusCode::WaitingDbMaintenance => "waiting_db_maintenance",
            StatusCode::WaitingOnDependencies => "waiting_on_dependencies",
            StatusCode::WaitingOnWorkers => "waiting_on_workers",
            StatusCode::WaitingOnDbWorkers => "waiting_on_db_workers",
            StatusCode::WaitingOnReboot => "waiting_on_reboot",
            StatusCode::WaitingOnNewTask => "waiting_on_new_task",
            StatusCode::Preparing => "preparing",
            StatusCode::Prepared => "prepared",
            StatusCode::Executing => "executing",
            StatusCode::Executed => "executed",
            StatusCode::Finalizing => "finalizing",
            StatusCode::Finalized => "finalized",
            StatusCode::Succeeded => "succeeded",
            StatusCode::DependencyFailed => "dependency_failed",
            StatusCode::NonzeroExit => "nonzero_exit",
            StatusCode::CancelledByUser => "cancelled_by_user",
            StatusCode::UnmatchedPatterns => "unmatched_patterns",
            StatusCode::InternalError => "internal_error",
            StatusCode::KilledByAdmin => "killed_by_admin",
            StatusCode::StaleCodelists => "stale_codelists",
            StatusCode::InvalidPipeline => "invalid_pipeline",
            StatusCode::JobError => "job_error",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        use StatusCode::*;
        Some(match value {
            "created" => Created,
            "initiated" => Initiated,
            "paused" => WaitingPaused,
            "waiting_db_maintenance" => WaitingDbMaintenance,
            "waiting_on_dependencies" => WaitingOnDependencies,
            "waiting_on_workers" => WaitingOnWorkers,
            "waiting_on_db_workers" => WaitingOnDbWorkers,
            "waiting_on_reboot" => WaitingOnReboot,
            "waiting_on_new_task" => WaitingOnNewTask,
            "preparing" => Preparing,
            "prepared" => Prepared,
            "executing" => Executing,
            "executed" => Executed,
            "finalizing" => Finalizing,
            "finalized" => Finalized,
            "succeeded" => Succeeded,
            "dependency_failed" => DependencyFailed,
            "nonzero_exit" => NonzeroExit,
            "cancelled_by_user" => CancelledByUser,
            "unmatched_patterns" => UnmatchedPatterns,
            "internal_error" => InternalError,
            "killed_by_admin" => KilledByAdmin,
            "stale_codelists" => StaleCodelists,
            "invalid_pipeline" => InvalidPipeline,
            "job_error" => JobError,
            _ => return None,
        })
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Privacy classification of an output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Privacy {
    HighlySensitive,
    ModeratelySensitive,
}

impl Privacy {
    pub fn as_str(self) -> &'static str {
        match self {
            Privacy::HighlySensitive => "highly_sensitive",
            Privacy::ModeratelySensitive => "moderately_sensitive",
        }
    }
}

/// A user-initiated request to run one or more actions of a workspace, as
/// received from the job-server. Immutable once created apart from the
/// cancellation list, which the sync loop re-applies on every poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: String,
    pub repo_url: String,
    pub branch: String,
    /// Commit sha; resolved from the branch during intake if empty.
    pub commit: String,
    pub requested_actions: Vec<String>,
    pub cancelled_actions: Vec<String>,
    pub workspace: String,
    pub codelists_ok: bool,
    pub database_name: String,
    pub force_run_dependencies: bool,
    pub backend: String,
    /// The original JSON payload, kept verbatim for audit purposes.
    pub original: serde_json::Value,
}

/// One execution of one action, owned by exactly one [`JobRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_request_id: String,
    pub backend: String,
    pub state: State,
    pub repo_url: String,
    pub commit: String,
    pub workspace: String,
    pub database_name: String,
    pub action: String,
    /// Action names whose outputs need to be staged as inputs to this job.
    pub requires_outputs_from: Vec<String>,
    /// Job ids we must wait for before this job can run: the subset of the
    /// dependencies that had not already succeeded when this job was built.
    pub wait_for_job_ids: Vec<String>,
    /// The container command, image first.
    pub run_command: Vec<String>,
    /// Declared output patterns by privacy level.
    pub output_spec: BTreeMap<String, Privacy>,
    /// Outputs the job actually produced, path to privacy level.
    pub outputs: BTreeMap<String, Privacy>,
    /// Declared patterns which matched nothing; populated on finalize.
    pub unmatched_patterns: Vec<String>,
    pub status_message: String,
    pub status_code: StatusCode,
    pub cancelled: bool,
    pub requires_db: bool,
    // UNIX timestamps in seconds
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    /// Nanosecond timestamp of the last status code change. Status codes can
    /// transition in under a second, so second resolution is not enough here.
    pub status_code_updated_at: i64,
}

impl Job {
    /// Generate a job id from the job request id and action. Deterministic so
    /// that rebuilding the database mid-job regenerates identical ids rather
    /// than orphaning in-flight work.
    pub fn deterministic_id(job_request_id: &str, action: &str) -> String {
        let seed = format!("{job_request_id}\n{action}");
        Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes())
            .simple()
            .to_string()
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }
}

/// The three kinds of work the controller can hand to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    RunJob,
    CancelJob,
    DbStatus,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::RunJob => "runjob",
            TaskKind::CancelJob => "canceljob",
            TaskKind::DbStatus => "dbstatus",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "runjob" => Some(TaskKind::RunJob),
            "canceljob" => Some(TaskKind::CancelJob),
            "dbstatus" => Some(TaskKind::DbStatus),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An externally dispatchable unit of work for an agent.
///
/// Task rows are never deleted; they become inactive once terminal and the
/// active-task queries filter on `active`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// The job this task mediates; unset for DBSTATUS probes.
    pub job_id: Option<String>,
    pub backend: String,
    pub kind: TaskKind,
    /// Everything the agent needs to execute the task without further calls
    /// to the controller. For RUNJOB this is a serialized
    /// [`crate::schema::JobDefinition`].
    pub definition: serde_json::Value,
    pub active: bool,
    pub created_at: i64,
    pub finished_at: Option<i64>,
    // State reported by the agent
    pub agent_stage: Option<String>,
    pub agent_complete: bool,
    pub agent_results: Option<serde_json::Value>,
    pub agent_timestamp_ns: Option<i64>,
}

impl Task {
    pub fn new(
        id: String,
        job_id: Option<String>,
        backend: String,
        kind: TaskKind,
        definition: serde_json::Value,
    ) -> Self {
        Task {
            id,
            job_id,
            backend,
            kind,
            definition,
            active: true,
            created_at: now_secs(),
            finished_at: None,
            agent_stage: None,
            agent_complete: false,
            agent_results: None,
            agent_timestamp_ns: None,
        }
    }
}

/// Per-backend key/value toggle, written by operator commands and the
/// DBSTATUS result handler, read on every scheduler tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flag {
    pub id: String,
    pub value: Option<String>,
    pub backend: String,
    pub timestamp: i64,
}

impl std::fmt::Display for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {}={} ({})",
            self.backend,
            self.id,
            self.value.as_deref().unwrap_or(""),
            timestamp_to_isoformat(self.timestamp),
        )
    }
}

pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

pub fn now_ns() -> i64 {
    Utc::now()
        .timestamp_nanos_opt()
        .expect("timestamp out of range")
}

pub fn timestamp_to_isoformat(ts: i64) -> String {
    match Utc.timestamp_opt(ts, 0) {
        chrono::LocalResult::Single(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        _ => String::new(),
    }
}

pub fn ns_timestamp_to_datetime(ts_ns: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts_ns / 1_000_000_000, (ts_ns % 1_000_000_000) as u32)
        .single()
}
