//! The agent's cooperative task loop.
//!
//! Each tick fetches the active tasks for this backend and advances each one
//! a single step: look up the executor's view of the job, decide the next
//! action, do it, report the transition. The agent holds no durable state;
//! after a restart it rediscovers its situation from the executor and the
//! controller's active-task list.

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::executor::{Executor, ExecutorError, JobStatus};
use crate::models::{now_ns, TaskKind};
use crate::schema::{AgentTask, DbStatusResults, JobDefinition, TaskStage, TaskUpdate};

use super::client::ControllerClient;

pub struct AgentLoop<E: Executor, C: ControllerClient> {
    executor: E,
    client: C,
    config: AgentConfig,
    /// Tasks the controller has told us to stop reporting on.
    completed: HashSet<String>,
}

impl<E: Executor, C: ControllerClient> AgentLoop<E, C> {
    pub fn new(executor: E, client: C, config: AgentConfig) -> Self {
        AgentLoop {
            executor,
            client,
            config,
            completed: HashSet::new(),
        }
    }

    /// Run until shutdown. One slow task does not wedge the loop: each task
    /// advances one stage per tick at most, errors are reported and the loop
    /// moves on.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(backend = %self.config.backend, "Agent loop started");
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        tracing::warn!(error = %err, "Agent tick failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Agent loop stopped");
                    return;
                }
            }
        }
    }

    /// One pass over the active task list. Returns how many tasks were
    /// handled.
    pub async fn tick(&mut self) -> Result<usize> {
        let tasks = self.client.active_tasks().await?;
        let mut handled = 0;
        for task in &tasks {
            if self.completed.contains(&task.id) {
                continue;
            }
            handled += 1;
            if let Err(err) = self.handle_single_task(task).await {
                tracing::error!(task_id = %task.id, error = %err, "Task handling failed");
            }
        }
        Ok(handled)
    }

    async fn handle_single_task(&mut self, task: &AgentTask) -> Result<()> {
        match task.kind {
            TaskKind::RunJob => self.handle_runjob(task).await,
            TaskKind::CancelJob => self.handle_canceljob(task).await,
            TaskKind::DbStatus => self.handle_dbstatus(task).await,
        }
    }

    async fn handle_runjob(&mut self, task: &AgentTask) -> Result<()> {
        let mut job: JobDefinition = serde_json::from_value(task.definition.clone())?;
        let status = self.executor.get_status(&job).await.unwrap_or_default();

        match status.stage {
            TaskStage::Unknown => {
                self.post(task, TaskStage::Preparing, None, false, None).await?;
                match self.executor.prepare(&job).await {
                    Ok(new_status) => {
                        self.post_status(task, &new_status, false).await?;
                    }
                    Err(err) => {
                        self.report_error(task, &job, err).await?;
                    }
                }
            }
            TaskStage::Prepared => {
                if job.allow_database_access {
                    if let Err(err) = self.inject_db_secrets(&mut job) {
                        self.report_error(task, &job, err).await?;
                        return Ok(());
                    }
                }
                match self.executor.execute(&job).await {
                    Ok(new_status) => {
                        self.post_status(task, &new_status, false).await?;
                    }
                    Err(err) => {
                        self.report_error(task, &job, err).await?;
                    }
                }
            }
            TaskStage::Executing => {
                // Still running; let the controller know we are alive
                self.post_status(task, &status, false).await?;
            }
            TaskStage::Executed => {
                self.post(task, TaskStage::Finalizing, None, false, status.timestamp_ns)
                    .await?;
                match self.executor.finalize(&job, false, None).await {
                    Ok(new_status) => {
                        self.executor.cleanup(&job).await.ok();
                        self.post_status(task, &new_status, true).await?;
                    }
                    Err(err) => {
                        self.report_error(task, &job, err).await?;
                    }
                }
            }
            TaskStage::Finalized | TaskStage::Error => {
                // Nothing left to do; pass the recorded results upstream
                self.executor.cleanup(&job).await.ok();
                self.post_status(task, &status, true).await?;
            }
            TaskStage::Preparing | TaskStage::Finalizing => {
                // Transient stages of synchronous operations; if we observe
                // one we simply report it and check again next tick
                self.post_status(task, &status, false).await?;
            }
        }
        Ok(())
    }

    /// Wind down a job. What needs doing depends on how far it got.
    async fn handle_canceljob(&mut self, task: &AgentTask) -> Result<()> {
        let job: JobDefinition = serde_json::from_value(task.definition.clone())?;
        let status = self.executor.get_status(&job).await.unwrap_or_default();

        match status.stage {
            TaskStage::Finalized | TaskStage::Error => {
                // Already finished; nothing to stop
                self.executor.cleanup(&job).await.ok();
                self.post_status(task, &status, true).await?;
            }
            TaskStage::Unknown => {
                // Never started: nothing to record beyond the cleanup
                self.executor.cleanup(&job).await.ok();
                self.post(task, TaskStage::Finalized, None, true, None).await?;
            }
            TaskStage::Executing => {
                self.post_status(task, &status, false).await?;
                self.executor.terminate(&job).await?;
                let final_status = self.executor.finalize(&job, true, None).await?;
                self.executor.cleanup(&job).await.ok();
                self.post_status(task, &final_status, true).await?;
            }
            TaskStage::Prepared | TaskStage::Executed | TaskStage::Preparing
            | TaskStage::Finalizing => {
                // Prepared or finished-but-unfinalized: record the cancelled
                // state and clean up
                let final_status = self.executor.finalize(&job, true, None).await?;
                self.executor.cleanup(&job).await.ok();
                self.post_status(task, &final_status, true).await?;
            }
        }
        Ok(())
    }

    async fn handle_dbstatus(&mut self, task: &AgentTask) -> Result<()> {
        let database_name = task
            .definition
            .get("database_name")
            .and_then(|v| v.as_str())
            .unwrap_or("default");
        let results = match self.executor.db_status(database_name).await {
            Ok(status) => DbStatusResults {
                status,
                error: None,
            },
            Err(err) => DbStatusResults {
                status: String::new(),
                error: Some(err.to_task_error()),
            },
        };
        self.post(
            task,
            TaskStage::Finalized,
            Some(serde_json::to_value(&results)?),
            true,
            None,
        )
        .await
    }

    /// Record an executor failure against the job so the log bundle has it,
    /// then report ERROR upstream and stop touching the task. Retry policy
    /// belongs to the controller.
    async fn report_error(
        &mut self,
        task: &AgentTask,
        job: &JobDefinition,
        err: ExecutorError,
    ) -> Result<()> {
        tracing::error!(task_id = %task.id, job_id = %job.id, error = %err, "Executor operation failed");
        let task_error = err.to_task_error();
        let status = self
            .executor
            .finalize(job, false, Some(task_error.clone()))
            .await
            .unwrap_or_else(|_| JobStatus::new(TaskStage::Error));
        let results = status
            .results
            .map(|r| r.to_value())
            .unwrap_or_else(|| {
                serde_json::json!({"error": task_error})
            });
        self.post(task, TaskStage::Error, Some(results), true, status.timestamp_ns)
            .await
    }

    fn inject_db_secrets(&self, job: &mut JobDefinition) -> std::result::Result<(), ExecutorError> {
        if self.config.using_dummy_data_backend {
            return Ok(());
        }
        let name = job.database_name.clone().unwrap_or_default();
        let Some(url) = self.config.database_urls.get(&name) else {
            return Err(ExecutorError::Other(format!(
                "Database name '{name}' is not currently defined for backend '{}'",
                self.config.backend
            )));
        };
        job.env.insert("DATABASE_URL".to_string(), url.clone());
        Ok(())
    }

    async fn post_status(
        &mut self,
        task: &AgentTask,
        status: &JobStatus,
        complete: bool,
    ) -> Result<()> {
        let results = status.results.as_ref().map(|r| r.to_value());
        self.post(task, status.stage, results, complete, status.timestamp_ns)
            .await
    }

    async fn post(
        &mut self,
        task: &AgentTask,
        stage: TaskStage,
        results: Option<serde_json::Value>,
        complete: bool,
        timestamp_ns: Option<i64>,
    ) -> Result<()> {
        let update = TaskUpdate {
            task_id: task.id.clone(),
            stage,
            results,
            complete,
            timestamp_ns: Some(timestamp_ns.unwrap_or_else(now_ns)),
        };
        tracing::debug!(task_id = %task.id, stage = %stage, complete, "Posting task update");
        let response = self.client.update_task(&update).await?;
        if response.agent_complete {
            self.completed.insert(task.id.clone());
        }
        Ok(())
    }
}
