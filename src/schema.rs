//! Wire types shared between the controller and the agent.
//!
//! The controller owns the database; the agent only ever sees these
//! serialized structures via the task API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{Privacy, TaskKind};

/// The agent-visible phase of a task.
///
/// `Preparing` and `Finalizing` are transient stages reported while the
/// corresponding synchronous executor operation is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Unknown,
    Preparing,
    Prepared,
    Executing,
    Executed,
    Finalizing,
    Finalized,
    Error,
}

impl TaskStage {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStage::Unknown => "unknown",
            TaskStage::Preparing => "preparing",
            TaskStage::Prepared => "prepared",
            TaskStage::Executing => "executing",
            TaskStage::Executed => "executed",
            TaskStage::Finalizing => "finalizing",
            TaskStage::Finalized => "finalized",
            TaskStage::Error => "error",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "unknown" => Some(TaskStage::Unknown),
            "preparing" => Some(TaskStage::Preparing),
            "prepared" => Some(TaskStage::Prepared),
            "executing" => Some(TaskStage::Executing),
            "executed" => Some(TaskStage::Executed),
            "finalizing" => Some(TaskStage::Finalizing),
            "finalized" => Some(TaskStage::Finalized),
            "error" => Some(TaskStage::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for TaskStage {
    fn default() -> Self {
        TaskStage::Unknown
    }
}

/// A task as served to the agent: the controller-supplied, effectively
/// immutable portion of a task row. The agent's view of the task's current
/// state is computed on demand from executor state, never stored locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub backend: String,
    pub kind: TaskKind,
    pub definition: serde_json::Value,
    pub created_at: i64,
}

impl AgentTask {
    pub fn from_task(task: &crate::models::Task) -> Self {
        AgentTask {
            id: task.id.clone(),
            backend: task.backend.clone(),
            kind: task.kind,
            definition: task.definition.clone(),
            created_at: task.created_at,
        }
    }
}

/// Body of `GET /{backend}/tasks/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTasksResponse {
    pub tasks: Vec<AgentTask>,
}

/// Body of `POST /{backend}/task/update/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub task_id: String,
    pub stage: TaskStage,
    #[serde(default)]
    pub results: Option<serde_json::Value>,
    pub complete: bool,
    #[serde(default)]
    pub timestamp_ns: Option<i64>,
}

/// Response to a task update. `agent_complete` tells the agent it may stop
/// reporting on this task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdateResponse {
    pub agent_complete: bool,
}

/// Everything the agent needs to run one job without further server calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    pub job_request_id: String,
    pub task_id: String,
    pub workspace: String,
    pub action: String,
    pub created_at: i64,
    pub repo_url: String,
    pub commit: String,
    pub image: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Ids of the jobs whose outputs must be staged into the volume.
    pub input_job_ids: Vec<String>,
    /// Declared output patterns by privacy level.
    pub output_spec: BTreeMap<String, Privacy>,
    pub allow_database_access: bool,
    pub database_name: Option<String>,
    pub cpu_count: Option<f64>,
    pub memory_limit: Option<String>,
}

/// An error the agent reports against a task. The controller decides whether
/// to retry; the agent never retries autonomously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: String,
    pub message: String,
    /// Whether a fresh task could plausibly succeed. Missing inputs or an
    /// archived workspace will not be fixed by retrying; a transient
    /// container engine failure might.
    pub retryable: bool,
}

/// Results of a RUNJOB or CANCELJOB task, as reported by the agent after
/// finalize. This is the redacted form: output filenames and patterns stay
/// inside the backend, only counts and booleans cross the boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTaskResults {
    pub exit_code: Option<i64>,
    pub image_id: Option<String>,
    pub status_message: Option<String>,
    pub hint: Option<String>,
    pub timestamp_ns: Option<i64>,
    pub output_count: u64,
    pub has_unmatched_patterns: bool,
    pub has_level4_excluded_files: bool,
    pub cancelled: bool,
    pub error: Option<TaskError>,
}

impl JobTaskResults {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("JobTaskResults serializes")
    }

    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Result of a DBSTATUS probe. The status string is restricted to a small
/// allowlist so a compromised probe container cannot exfiltrate data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DbStatusResults {
    pub status: String,
    #[serde(default)]
    pub error: Option<TaskError>,
}

pub const DB_MAINTENANCE_STATUS: &str = "db-maintenance";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_stage_round_trips_through_strings() {
        for stage in [
            TaskStage::Unknown,
            TaskStage::Preparing,
            TaskStage::Prepared,
            TaskStage::Executing,
            TaskStage::Executed,
            TaskStage::Finalizing,
            TaskStage::Finalized,
            TaskStage::Error,
        ] {
            assert_eq!(TaskStage::from_str(stage.as_str()), Some(stage));
        }
    }

    #[test]
    fn job_definition_round_trips_through_json() {
        let definition = JobDefinition {
            id: "job-1".into(),
            job_request_id: "request-1".into(),
            task_id: "job-1-001".into(),
            workspace: "testspace".into(),
            action: "extract_data".into(),
            created_at: 1_700_000_000,
            repo_url: "https://github.com/test/repo".into(),
            commit: "abc123".into(),
            image: "ghcr.io/opensafely-core/ehrql:v1".into(),
            args: vec!["generate-dataset".into()],
            env: BTreeMap::from([("OPENSAFELY_BACKEND".into(), "test".into())]),
            input_job_ids: vec![],
            output_spec: BTreeMap::from([(
                "output/dataset.csv".into(),
                Privacy::HighlySensitive,
            )]),
            allow_database_access: true,
            database_name: Some("default".into()),
            cpu_count: Some(2.0),
            memory_limit: Some("4g".into()),
        };
        let value = serde_json::to_value(&definition).unwrap();
        let parsed: JobDefinition = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, definition);
    }
}
