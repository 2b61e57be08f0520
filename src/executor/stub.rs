//! In-memory executor covering the full trait surface, for tests.
//!
//! Jobs move through the same stages as the docker implementation but state
//! lives in a shared map, and behaviour (exit codes, prepare failures,
//! produced files, maintenance status) is scripted per test.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::models::{now_ns, Privacy};
use crate::schema::{JobDefinition, JobTaskResults, TaskError, TaskStage};

use super::{Executor, ExecutorError, JobStatus};

#[derive(Debug, Clone, Default)]
struct StubJobState {
    stage: TaskStage,
    exit_code: Option<i64>,
    results: Option<JobTaskResults>,
    /// The task that finalized (or errored) this job. A different task
    /// observing the job sees a fresh start, mirroring the task-scoped
    /// metadata file of the docker implementation.
    finalized_task: Option<String>,
    cleaned_up: bool,
}

/// Scripted behaviour for the stub.
#[derive(Debug, Clone, Default)]
pub struct StubBehaviour {
    /// Exit codes per action; actions not listed exit 0.
    pub exit_codes: HashMap<String, i64>,
    /// Actions whose prepare fails, with the retryable flag.
    pub failing_prepare: HashMap<String, bool>,
    /// Actions which report unmatched output patterns.
    pub unmatched_patterns: Vec<String>,
    /// Files "produced" per action.
    pub produced: HashMap<String, BTreeMap<String, Privacy>>,
    /// What the maintenance probe reports.
    pub db_status: String,
}

#[derive(Default)]
struct StubInner {
    jobs: HashMap<String, StubJobState>,
    calls: Vec<(String, String)>,
    behaviour: StubBehaviour,
}

/// The test double for [`Executor`]. Cloning shares state, so a test can
/// hold one handle while the agent loop drives another.
#[derive(Clone, Default)]
pub struct StubExecutor {
    inner: Arc<Mutex<StubInner>>,
}

impl StubExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behaviour(behaviour: StubBehaviour) -> Self {
        let stub = Self::new();
        stub.inner.lock().unwrap().behaviour = behaviour;
        stub
    }

    pub fn set_behaviour(&self, behaviour: StubBehaviour) {
        self.inner.lock().unwrap().behaviour = behaviour;
    }

    pub fn set_db_status(&self, status: &str) {
        self.inner.lock().unwrap().behaviour.db_status = status.to_string();
    }

    /// The sequence of (operation, job id) calls made so far.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, job_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(_, id)| id == job_id)
            .map(|(op, _)| op.clone())
            .collect()
    }

    pub fn stage_of(&self, job_id: &str) -> TaskStage {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .get(job_id)
            .map(|j| j.stage)
            .unwrap_or(TaskStage::Unknown)
    }

    /// Force a job's stage, simulating out-of-band container state.
    pub fn force_stage(&self, job_id: &str, stage: TaskStage) {
        let mut inner = self.inner.lock().unwrap();
        inner.jobs.entry(job_id.to_string()).or_default().stage = stage;
    }

    fn record(&self, op: &str, job_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .calls
            .push((op.to_string(), job_id.to_string()));
    }

    fn status_of(&self, job: &JobDefinition) -> JobStatus {
        let inner = self.inner.lock().unwrap();
        let Some(state) = inner.jobs.get(&job.id) else {
            return JobStatus::new(TaskStage::Unknown);
        };
        // Finalized state belongs to the task that produced it; a
        // superseding task starts over.
        if matches!(state.stage, TaskStage::Finalized | TaskStage::Error)
            && state.finalized_task.as_deref() != Some(job.task_id.as_str())
        {
            return JobStatus::new(TaskStage::Unknown);
        }
        JobStatus {
            stage: state.stage,
            exit_code: state.exit_code,
            timestamp_ns: Some(now_ns()),
            results: state.results.clone(),
        }
    }
}

impl Executor for StubExecutor {
    async fn prepare(&self, job: &JobDefinition) -> Result<JobStatus, ExecutorError> {
        self.record("prepare", &job.id);
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(&retryable) = inner.behaviour.failing_prepare.get(&job.action) {
                return Err(ExecutorError::Prep {
                    message: format!("prepare scripted to fail for {}", job.action),
                    retryable,
                });
            }
            let state = inner.jobs.entry(job.id.clone()).or_default();
            let superseded = matches!(state.stage, TaskStage::Finalized | TaskStage::Error)
                && state.finalized_task.as_deref() != Some(job.task_id.as_str());
            if state.stage == TaskStage::Unknown || superseded {
                *state = StubJobState {
                    stage: TaskStage::Prepared,
                    ..Default::default()
                };
            }
        }
        Ok(self.status_of(job))
    }

    async fn execute(&self, job: &JobDefinition) -> Result<JobStatus, ExecutorError> {
        self.record("execute", &job.id);
        {
            let mut inner = self.inner.lock().unwrap();
            let state = inner.jobs.entry(job.id.clone()).or_default();
            if state.stage == TaskStage::Prepared {
                state.stage = TaskStage::Executing;
            }
        }
        Ok(self.status_of(job))
    }

    async fn finalize(
        &self,
        job: &JobDefinition,
        cancelled: bool,
        error: Option<TaskError>,
    ) -> Result<JobStatus, ExecutorError> {
        self.record("finalize", &job.id);
        {
            let mut inner = self.inner.lock().unwrap();
            let behaviour = inner.behaviour.clone();
            let state = inner.jobs.entry(job.id.clone()).or_default();
            // Final state only counts if this task produced it
            let already_final = matches!(state.stage, TaskStage::Finalized | TaskStage::Error)
                && state.finalized_task.as_deref() == Some(job.task_id.as_str());
            if !already_final {
                let exit_code = if cancelled {
                    Some(137)
                } else {
                    Some(*behaviour.exit_codes.get(&job.action).unwrap_or(&0))
                };
                let has_unmatched = behaviour.unmatched_patterns.contains(&job.action);
                let output_count = behaviour
                    .produced
                    .get(&job.action)
                    .map(|o| o.len() as u64)
                    .unwrap_or(if cancelled || error.is_some() { 0 } else { 1 });
                state.exit_code = exit_code;
                state.results = Some(JobTaskResults {
                    exit_code,
                    image_id: Some(format!("sha256:{}", job.action)),
                    status_message: Some(if cancelled {
                        "Job cancelled by system".to_string()
                    } else {
                        "Completed".to_string()
                    }),
                    hint: None,
                    timestamp_ns: Some(now_ns()),
                    output_count,
                    has_unmatched_patterns: has_unmatched,
                    has_level4_excluded_files: false,
                    cancelled,
                    error: error.clone(),
                });
                state.stage = if error.is_some() {
                    TaskStage::Error
                } else {
                    TaskStage::Finalized
                };
                state.finalized_task = Some(job.task_id.clone());
            }
        }
        Ok(self.status_of(job))
    }

    async fn terminate(&self, job: &JobDefinition) -> Result<JobStatus, ExecutorError> {
        self.record("terminate", &job.id);
        {
            let mut inner = self.inner.lock().unwrap();
            let state = inner.jobs.entry(job.id.clone()).or_default();
            if state.stage == TaskStage::Executing {
                state.stage = TaskStage::Executed;
                state.exit_code = Some(137);
            }
        }
        Ok(self.status_of(job))
    }

    async fn cleanup(&self, job: &JobDefinition) -> Result<JobStatus, ExecutorError> {
        self.record("cleanup", &job.id);
        {
            let mut inner = self.inner.lock().unwrap();
            let state = inner.jobs.entry(job.id.clone()).or_default();
            // Idempotent: repeat calls are fine
            state.cleaned_up = true;
        }
        Ok(self.status_of(job))
    }

    async fn get_status(&self, job: &JobDefinition) -> Result<JobStatus, ExecutorError> {
        Ok(self.status_of(job))
    }

    async fn db_status(&self, _database_name: &str) -> Result<String, ExecutorError> {
        Ok(self.inner.lock().unwrap().behaviour.db_status.clone())
    }
}

/// Advance a stub job from Executing to Executed, as if its container had
/// exited. Tests call this between agent ticks.
impl StubExecutor {
    pub fn finish_execution(&self, job_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let exit_code = inner
            .jobs
            .get(job_id)
            .and_then(|j| j.exit_code)
            .unwrap_or(0);
        if let Some(state) = inner.jobs.get_mut(job_id) {
            if state.stage == TaskStage::Executing {
                state.stage = TaskStage::Executed;
                state.exit_code = Some(exit_code);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(id: &str, action: &str) -> JobDefinition {
        JobDefinition {
            id: id.to_string(),
            job_request_id: "request-1".into(),
            task_id: format!("{id}-001"),
            workspace: "testspace".into(),
            action: action.to_string(),
            created_at: 0,
            repo_url: "https://github.com/test/repo".into(),
            commit: "abc123".into(),
            image: "ehrql:v1".into(),
            args: vec![],
            env: BTreeMap::new(),
            input_job_ids: vec![],
            output_spec: BTreeMap::new(),
            allow_database_access: false,
            database_name: None,
            cpu_count: None,
            memory_limit: None,
        }
    }

    #[tokio::test]
    async fn jobs_walk_the_happy_path_stages() {
        let stub = StubExecutor::new();
        let job = definition("job-1", "extract_data");

        assert_eq!(stub.get_status(&job).await.unwrap().stage, TaskStage::Unknown);
        assert_eq!(stub.prepare(&job).await.unwrap().stage, TaskStage::Prepared);
        assert_eq!(stub.execute(&job).await.unwrap().stage, TaskStage::Executing);
        stub.finish_execution("job-1");
        assert_eq!(stub.get_status(&job).await.unwrap().stage, TaskStage::Executed);
        let status = stub.finalize(&job, false, None).await.unwrap();
        assert_eq!(status.stage, TaskStage::Finalized);
        assert_eq!(status.results.unwrap().exit_code, Some(0));
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let stub = StubExecutor::new();
        let job = definition("job-1", "extract_data");
        stub.cleanup(&job).await.unwrap();
        stub.cleanup(&job).await.unwrap();
        assert_eq!(stub.calls_for("job-1"), vec!["cleanup", "cleanup"]);
    }

    #[tokio::test]
    async fn scripted_exit_codes_show_up_in_results() {
        let stub = StubExecutor::with_behaviour(StubBehaviour {
            exit_codes: HashMap::from([("extract_data".to_string(), 2)]),
            ..Default::default()
        });
        let job = definition("job-1", "extract_data");
        stub.prepare(&job).await.unwrap();
        stub.execute(&job).await.unwrap();
        stub.finish_execution("job-1");
        let status = stub.finalize(&job, false, None).await.unwrap();
        assert_eq!(status.results.unwrap().exit_code, Some(2));
    }
}
