//! Task queue operations: issuing RUNJOB/CANCELJOB/DBSTATUS tasks, retiring
//! them, and folding agent updates back into the job state machine.

use chrono::Utc;
use rusqlite::Connection;

use crate::config::ControllerConfig;
use crate::db::{self, Database};
use crate::error::{Result, RunnerError};
use crate::models::{now_secs, Job, Task, TaskKind};
use crate::schema::{
    DbStatusResults, JobDefinition, JobTaskResults, TaskStage, TaskUpdate, TaskUpdateResponse,
    DB_MAINTENANCE_STATUS,
};

use super::scheduler::{process_completed_results, set_code};
use crate::models::StatusCode;

/// Flag key holding the current maintenance token for a backend.
pub const DB_MAINTENANCE_FLAG: &str = "db-maintenance";
/// Operator override pinning maintenance mode on regardless of the probe.
pub const MANUAL_DB_MAINTENANCE_FLAG: &str = "manual-db-maintenance";

/// Build the full definition an agent needs to execute a job offline.
pub fn job_definition(
    conn: &Connection,
    config: &ControllerConfig,
    job: &Job,
    task_id: &str,
) -> Result<JobDefinition> {
    let mut run_command = job.run_command.clone();
    if run_command.is_empty() {
        return Err(RunnerError::Internal(format!(
            "job {} has no run command",
            job.id
        )));
    }
    let image = run_command.remove(0);
    let full_image = if image.contains('/') {
        image
    } else {
        format!("{}/{}", config.docker_registry, image)
    };

    let mut env = std::collections::BTreeMap::new();
    env.insert("OPENSAFELY_BACKEND".to_string(), job.backend.clone());

    // Dependencies are guaranteed SUCCEEDED before this job is admitted.
    // A newer run of the same action may already be in flight again by now,
    // so resolve inputs against succeeded jobs only; those are the ones
    // whose outputs are on disk.
    let mut input_job_ids = Vec::new();
    for action in &job.requires_outputs_from {
        if let Some(previous) =
            latest_succeeded_job_id_for_action(conn, &job.backend, &job.workspace, action)?
        {
            input_job_ids.push(previous);
        }
    }

    Ok(JobDefinition {
        id: job.id.clone(),
        job_request_id: job.job_request_id.clone(),
        task_id: task_id.to_string(),
        workspace: job.workspace.clone(),
        action: job.action.clone(),
        created_at: job.created_at,
        repo_url: job.repo_url.clone(),
        commit: job.commit.clone(),
        image: full_image,
        args: run_command,
        env,
        input_job_ids,
        output_spec: job.output_spec.clone(),
        allow_database_access: job.requires_db,
        database_name: job.requires_db.then(|| job.database_name.clone()),
        cpu_count: config.job_cpu_count.get(&job.backend).copied(),
        memory_limit: config.job_memory_limit.get(&job.backend).cloned(),
    })
}

fn latest_succeeded_job_id_for_action(
    conn: &Connection,
    backend: &str,
    workspace: &str,
    action: &str,
) -> Result<Option<String>> {
    let jobs = db::query_jobs(
        conn,
        "SELECT * FROM job
         WHERE backend = ?1 AND workspace = ?2 AND action = ?3
           AND cancelled = 0 AND state = 'succeeded'
         ORDER BY created_at DESC LIMIT 1",
        rusqlite::params![backend, workspace, action],
    )?;
    Ok(jobs.into_iter().next().map(|j| j.id))
}

/// Create a fresh RUNJOB task for a job. Task ids embed a zero-padded
/// attempt number so that, for a given job, lexical order matches creation
/// order.
pub fn create_runjob_task(
    conn: &Connection,
    config: &ControllerConfig,
    job: &Job,
) -> Result<Task> {
    let previous = db::tasks_for_job(conn, &job.id, TaskKind::RunJob)?;
    if previous.iter().any(|t| t.active) {
        return Err(RunnerError::Internal(format!(
            "job {} already has an active RUNJOB task",
            job.id
        )));
    }
    let task_id = format!("{}-{:03}", job.id, previous.len() + 1);
    let definition = job_definition(conn, config, job, &task_id)?;
    let task = Task::new(
        task_id,
        Some(job.id.clone()),
        job.backend.clone(),
        TaskKind::RunJob,
        serde_json::to_value(&definition)?,
    );
    db::insert_task(conn, &task)?;
    Ok(task)
}

/// The most recent RUNJOB task for a job, if any.
pub fn runjob_task_for_job(conn: &Connection, job: &Job) -> Result<Option<Task>> {
    let tasks = db::tasks_for_job(conn, &job.id, TaskKind::RunJob)?;
    Ok(tasks.into_iter().last())
}

pub fn mark_task_inactive(conn: &Connection, task: &mut Task) -> Result<()> {
    task.active = false;
    task.finished_at = Some(now_secs());
    db::update_task(conn, task)
}

/// Deactivate a job's RUNJOB task and issue a CANCELJOB referencing it.
/// No-op if the job was never dispatched or its task already completed.
pub fn cancel_job_task(conn: &Connection, config: &ControllerConfig, job: &Job) -> Result<()> {
    let Some(mut runjob_task) = runjob_task_for_job(conn, job)? else {
        return Ok(());
    };
    if !runjob_task.active {
        return Ok(());
    }
    mark_task_inactive(conn, &mut runjob_task)?;
    let task_id = format!("{}-cancel", runjob_task.id);
    let definition = job_definition(conn, config, job, &task_id)?;
    let cancel_task = Task::new(
        task_id,
        Some(job.id.clone()),
        job.backend.clone(),
        TaskKind::CancelJob,
        serde_json::to_value(&definition)?,
    );
    db::insert_task(conn, &cancel_task)?;
    tracing::info!(job_id = %job.id, task_id = %cancel_task.id, "Issued CANCELJOB task");
    Ok(())
}

/// Keep one periodic DBSTATUS probe per backend in flight.
pub fn update_dbstatus_tasks(db: &mut Database, config: &ControllerConfig) -> Result<()> {
    for backend in &config.backends {
        update_dbstatus_task_for_backend(db, config, backend)?;
    }
    Ok(())
}

fn update_dbstatus_task_for_backend(
    db: &mut Database,
    config: &ControllerConfig,
    backend: &str,
) -> Result<()> {
    // Manual maintenance mode pins the flag on; the probe would only fight
    // with the operator, so retire any in-flight probe and stop scheduling.
    if db.get_flag_value(MANUAL_DB_MAINTENANCE_FLAG, backend)?.is_some() {
        let active = db.active_tasks(backend)?;
        return db.in_transaction(|conn| {
            for mut task in active
                .into_iter()
                .filter(|t| t.kind == TaskKind::DbStatus)
            {
                mark_task_inactive(conn, &mut task)?;
            }
            Ok(())
        });
    }

    if db.active_task_exists(backend, TaskKind::DbStatus)? {
        return Ok(());
    }
    let cutoff = now_secs() - config.maintenance_poll_interval.as_secs() as i64;
    if db.task_finished_since(backend, TaskKind::DbStatus, cutoff)? {
        return Ok(());
    }

    // A bit of structure in the id helps debugging; the random suffix keeps
    // it unique across same-day probes.
    let task_id = format!(
        "dbstatus-{}-{}",
        Utc::now().format("%Y-%m-%d"),
        uuid::Uuid::new_v4().simple()
    );
    let task = Task::new(
        task_id,
        None,
        backend.to_string(),
        TaskKind::DbStatus,
        serde_json::json!({"database_name": "default"}),
    );
    db.insert_task(&task)?;
    tracing::info!(backend, task_id = %task.id, "Issued DBSTATUS task");
    Ok(())
}

/// Record a stage update from an agent and advance the owning job.
///
/// Each update is applied in a single transaction; applying the same update
/// twice produces the same stored state. The response tells the agent
/// whether it may stop reporting on this task.
pub fn handle_task_update(
    db: &mut Database,
    config: &ControllerConfig,
    backend: &str,
    update: &TaskUpdate,
) -> Result<TaskUpdateResponse> {
    let max_retries = config.max_task_retries;
    let backend = backend.to_string();
    let update = update.clone();
    db.in_transaction(move |conn| {
        let mut task = db::get_task(conn, &update.task_id)?
            .ok_or_else(|| RunnerError::TaskNotFound(update.task_id.clone()))?;
        if task.backend != backend {
            return Err(RunnerError::BackendMismatch {
                task_id: task.id.clone(),
                backend,
            });
        }

        // Once the agent has marked a task complete, further updates carry
        // no new information.
        if task.agent_complete {
            return Ok(TaskUpdateResponse {
                agent_complete: true,
            });
        }

        let was_active = task.active;
        task.agent_stage = Some(update.stage.as_str().to_string());
        task.agent_results = update.results.clone();
        task.agent_timestamp_ns = update.timestamp_ns;
        if update.complete {
            task.agent_complete = true;
            task.active = false;
            task.finished_at = Some(now_secs());
        }
        db::update_task(conn, &task)?;

        // A deactivated task (cancellation, maintenance, reboot) still has
        // its results recorded, but no longer drives the job.
        if was_active {
            match task.kind {
                TaskKind::RunJob => advance_job_from_update(conn, max_retries, &task, &update)?,
                TaskKind::CancelJob => {
                    if update.complete {
                        confirm_cancellation(conn, &task, &update)?;
                    }
                }
                TaskKind::DbStatus => {
                    if update.complete {
                        record_db_status(conn, &task, &update)?;
                    }
                }
            }
        }

        Ok(TaskUpdateResponse {
            agent_complete: task.agent_complete || !was_active,
        })
    })
}

fn advance_job_from_update(
    conn: &Connection,
    max_retries: u32,
    task: &Task,
    update: &TaskUpdate,
) -> Result<()> {
    let Some(job_id) = &task.job_id else {
        return Ok(());
    };
    let Some(mut job) = db::get_job(conn, job_id)? else {
        return Ok(());
    };
    if job.state.is_terminal() {
        return Ok(());
    }

    let results = update
        .results
        .as_ref()
        .and_then(JobTaskResults::from_value);

    if update.complete {
        return process_completed_results(
            conn,
            max_retries,
            &mut job,
            results.as_ref(),
            update.timestamp_ns,
        );
    }

    // Progress update: mirror the agent-side stage
    let code = match update.stage {
        TaskStage::Preparing => Some(StatusCode::Preparing),
        TaskStage::Prepared => Some(StatusCode::Prepared),
        TaskStage::Executing => Some(StatusCode::Executing),
        TaskStage::Executed => Some(StatusCode::Executed),
        TaskStage::Finalizing => Some(StatusCode::Finalizing),
        // Unknown or out-of-band stages leave the job's code alone
        _ => None,
    };
    if let Some(code) = code {
        let message = job.status_message.clone();
        set_code(conn, &mut job, code, &message, update.timestamp_ns)?;
    }
    Ok(())
}

fn confirm_cancellation(conn: &Connection, task: &Task, update: &TaskUpdate) -> Result<()> {
    let Some(job_id) = &task.job_id else {
        return Ok(());
    };
    let Some(mut job) = db::get_job(conn, job_id)? else {
        return Ok(());
    };
    if job.state.is_terminal() {
        // Admin kills set their terminal code up front; the confirmation
        // changes nothing.
        return Ok(());
    }
    // CANCELJOB is also how maintenance and reboot wind running jobs down.
    // Those jobs carry no user cancellation flag and stay in their reset
    // state to be re-issued later.
    if !job.cancelled {
        return Ok(());
    }
    set_code(
        conn,
        &mut job,
        StatusCode::CancelledByUser,
        "Cancelled by user",
        update.timestamp_ns,
    )
}

fn record_db_status(conn: &Connection, task: &Task, update: &TaskUpdate) -> Result<()> {
    let results = update
        .results
        .as_ref()
        .and_then(|v| serde_json::from_value::<DbStatusResults>(v.clone()).ok())
        .unwrap_or_default();
    if let Some(error) = &results.error {
        tracing::warn!(backend = %task.backend, error = %error.message, "DBSTATUS probe failed");
        return Ok(());
    }
    let value = if results.status == DB_MAINTENANCE_STATUS {
        Some(results.status.as_str())
    } else {
        None
    };
    db::set_flag(conn, DB_MAINTENANCE_FLAG, value, &task.backend)?;
    Ok(())
}
