//! The per-tick job state machine.
//!
//! Each tick the scheduler expands newly arrived job requests, then walks
//! every non-terminal job per backend and computes its next status code.
//! Each job evaluation runs in its own transaction; a failure in one job
//! leaves the others untouched.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::Connection;
use tokio_util::sync::CancellationToken;

use crate::builder::{self, ProjectSource};
use crate::config::ControllerConfig;
use crate::db;
use crate::error::Result;
use crate::models::{now_ns, now_secs, Job, State, StatusCode, TaskKind};
use crate::schema::{JobTaskResults, TaskStage};

use super::tasks::{self, DB_MAINTENANCE_FLAG, MANUAL_DB_MAINTENANCE_FLAG};
use super::SharedDb;

/// Give up on a job whose evaluation keeps failing after this many
/// consecutive ticks.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Refresh an unchanged job's `updated_at` at most this often, so users can
/// see the job is alive without a write on every poll.
const TIMESTAMP_REFRESH_SECS: i64 = 60;

/// Known exit codes from the database images, mapped to user-facing hints.
const DATABASE_EXIT_CODES: &[(i64, &str)] = &[
    (3, "A transient database error occurred, your job may run successfully if you try it again"),
    (4, "New data is being imported into the database, please try again in a few hours"),
    (5, "Something went wrong with the database, please contact tech support"),
];

pub struct Scheduler {
    db: SharedDb,
    config: ControllerConfig,
    source: Arc<dyn ProjectSource>,
    /// Consecutive evaluation failures per job id, reset on success.
    error_counts: HashMap<String, u32>,
}

impl Scheduler {
    pub fn new(db: SharedDb, config: ControllerConfig, source: Arc<dyn ProjectSource>) -> Self {
        Scheduler {
            db,
            config,
            source,
            error_counts: HashMap::new(),
        }
    }

    /// Run the scheduler loop until shutdown. Blocking; runs on its own
    /// thread so one tick is never interleaved with another.
    pub fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(
            tick_interval = ?self.config.tick_interval,
            backends = ?self.config.backends,
            "Scheduler loop started"
        );
        while !shutdown.is_cancelled() {
            if let Err(err) = self.tick() {
                tracing::error!(error = %err, "Scheduler tick failed");
            }
            std::thread::sleep(self.config.tick_interval);
        }
        tracing::info!("Scheduler loop stopped");
    }

    pub fn tick(&mut self) -> Result<()> {
        let backends = self.config.backends.clone();
        for backend in &backends {
            self.expand_pending_requests(backend)?;
        }
        for backend in &backends {
            self.handle_backend_jobs(backend)?;
        }
        {
            let mut db = self.db.lock().unwrap();
            tasks::update_dbstatus_tasks(&mut db, &self.config)?;
        }
        Ok(())
    }

    /// Pass 1: intake. Expand every job request not yet turned into jobs.
    fn expand_pending_requests(&mut self, backend: &str) -> Result<()> {
        let requests = {
            let db = self.db.lock().unwrap();
            db.unexpanded_job_requests(backend)?
        };
        for request in requests {
            // Resolving the commit and fetching project.yaml talks to git,
            // which can be slow; do it before taking the database lock.
            let fetched = builder::fetch_project(self.source.as_ref(), &request);
            let mut db = self.db.lock().unwrap();
            builder::create_or_update_jobs(&mut db, &request, fetched)?;
        }
        Ok(())
    }

    /// Pass 2: evaluate every non-terminal job on the backend.
    fn handle_backend_jobs(&mut self, backend: &str) -> Result<()> {
        let (paused, maintenance, mut jobs) = {
            let db = self.db.lock().unwrap();
            (
                flag_is_true(&db, "paused", backend)?,
                db_maintenance_active(&db, backend)?,
                db.active_jobs(backend)?,
            )
        };

        // Process running jobs first so the per-workspace running counts are
        // accurate by the time pending jobs are considered; among pending
        // jobs, favour workspaces with the least already running, then db
        // jobs, then FIFO by creation time.
        let mut running_for_workspace: HashMap<String, usize> = HashMap::new();
        while !jobs.is_empty() {
            jobs.sort_by_key(|job| {
                (
                    if job.state == State::Running { 0 } else { 1 },
                    running_for_workspace
                        .get(&job.workspace)
                        .copied()
                        .unwrap_or(0),
                    if job.requires_db { 0 } else { 1 },
                    job.created_at,
                    job.id.clone(),
                )
            });
            let job = jobs.remove(0);
            let job_id = job.id.clone();
            let workspace = job.workspace.clone();
            let was_running = job.state == State::Running;

            match self.handle_single_job(job, paused, maintenance) {
                Ok(()) => {
                    self.error_counts.remove(&job_id);
                }
                Err(err) => {
                    let count = self.error_counts.entry(job_id.clone()).or_insert(0);
                    *count += 1;
                    tracing::error!(
                        job_id = %job_id,
                        error = %err,
                        consecutive_failures = *count,
                        "Error handling job; will retry next tick"
                    );
                    if *count >= MAX_CONSECUTIVE_ERRORS {
                        self.force_internal_error(&job_id)?;
                        self.error_counts.remove(&job_id);
                    }
                }
            }

            if was_running {
                *running_for_workspace.entry(workspace).or_insert(0) += 1;
            }
        }
        Ok(())
    }

    fn handle_single_job(&self, mut job: Job, paused: bool, maintenance: bool) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let config = &self.config;
        db.in_transaction(|conn| {
            // Re-read inside the transaction: the cancelled flag is written
            // by the sync path and may have changed since we listed jobs.
            if let Some(fresh) = db::get_job(conn, &job.id)? {
                job = fresh;
            }
            if job.state.is_terminal() {
                return Ok(());
            }
            handle_job(conn, config, &mut job, paused, maintenance)
        })
    }

    fn force_internal_error(&self, job_id: &str) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        db.in_transaction(|conn| {
            let Some(mut job) = db::get_job(conn, job_id)? else {
                return Ok(());
            };
            set_code(
                conn,
                &mut job,
                StatusCode::InternalError,
                "Internal error: this usually means a platform issue rather than a problem \
                 for users to fix. The tech team are notified of these errors and will be \
                 investigating.",
                None,
            )
        })
    }
}

fn flag_is_true(db: &crate::db::Database, name: &str, backend: &str) -> Result<bool> {
    Ok(db
        .get_flag_value(name, backend)?
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false))
}

/// Maintenance mode is on when the probe has reported it or the operator
/// has pinned it manually.
fn db_maintenance_active(db: &crate::db::Database, backend: &str) -> Result<bool> {
    if db.get_flag_value(MANUAL_DB_MAINTENANCE_FLAG, backend)?.is_some() {
        return Ok(true);
    }
    Ok(db.get_flag_value(DB_MAINTENANCE_FLAG, backend)?.is_some())
}

/// The main state machine step for one job.
fn handle_job(
    conn: &Connection,
    config: &ControllerConfig,
    job: &mut Job,
    paused: bool,
    maintenance: bool,
) -> Result<()> {
    // Cancellation is driven by user request, so it is handled first
    if job.cancelled {
        return handle_cancelled_job(conn, config, job);
    }

    if paused && job.state == State::Pending {
        if job.status_code == StatusCode::WaitingOnReboot {
            // Already reset in preparation for reboot; just record liveness
            return refresh_job_timestamps(conn, job);
        }
        return set_code(
            conn,
            job,
            StatusCode::WaitingPaused,
            "Backend is currently paused for maintenance, job will start once this is completed",
            None,
        );
    }

    if maintenance && job.requires_db {
        if job.state == State::Running {
            tracing::warn!(job_id = %job.id, "DB maintenance mode active, stopping db job");
            tasks::cancel_job_task(conn, config, job)?;
        }
        return set_code(
            conn,
            job,
            StatusCode::WaitingDbMaintenance,
            "Waiting for database to finish maintenance",
            None,
        );
    }

    match job.state {
        State::Pending => handle_pending_job(conn, config, job),
        State::Running => handle_running_job(conn, config, job),
        State::Failed | State::Succeeded => Ok(()),
    }
}

fn handle_cancelled_job(conn: &Connection, config: &ControllerConfig, job: &mut Job) -> Result<()> {
    match job.state {
        // Never dispatched (or already wound down): cancel outright
        State::Pending => set_code(conn, job, StatusCode::CancelledByUser, "Cancelled by user", None),
        State::Running => {
            // Deactivate the RUNJOB and issue a CANCELJOB, then wait for the
            // agent to confirm; the confirmation flips the job terminal.
            let cancels = db::tasks_for_job(conn, &job.id, TaskKind::CancelJob)?;
            if cancels.iter().any(|t| t.active) {
                return Ok(());
            }
            let runjob_active = tasks::runjob_task_for_job(conn, job)?
                .map(|t| t.active)
                .unwrap_or(false);
            if runjob_active {
                tasks::cancel_job_task(conn, config, job)?;
                Ok(())
            } else {
                // Nothing is running anywhere for this job; cancel outright
                set_code(conn, job, StatusCode::CancelledByUser, "Cancelled by user", None)
            }
        }
        State::Failed | State::Succeeded => Ok(()),
    }
}

fn handle_pending_job(conn: &Connection, config: &ControllerConfig, job: &mut Job) -> Result<()> {
    let awaited_states = job_states(conn, &job.wait_for_job_ids)?;
    if awaited_states.contains(&State::Failed) {
        return set_code(
            conn,
            job,
            StatusCode::DependencyFailed,
            "Not starting as dependency failed",
            None,
        );
    }
    if awaited_states.iter().any(|s| *s != State::Succeeded) {
        return set_code(
            conn,
            job,
            StatusCode::WaitingOnDependencies,
            "Waiting on dependencies",
            None,
        );
    }

    if let Some((code, message)) = reason_job_not_started(conn, config, job)? {
        return set_code(conn, job, code, message, None);
    }

    // Admit: issue the task and mark the job running in the same transaction
    let task = tasks::create_runjob_task(conn, config, job)?;
    tracing::info!(job_id = %job.id, task_id = %task.id, "Issued RUNJOB task");
    set_code(
        conn,
        job,
        StatusCode::Initiated,
        "Job executing on the backend",
        None,
    )
}

/// Concurrency admission: both caps must have room. Counts jobs in state
/// RUNNING, which bounds the EXECUTING count the caps are stated over.
fn reason_job_not_started(
    conn: &Connection,
    config: &ControllerConfig,
    job: &Job,
) -> Result<Option<(StatusCode, &'static str)>> {
    let running = db::query_jobs(
        conn,
        "SELECT * FROM job WHERE state = 'running' AND backend = ?1",
        rusqlite::params![job.backend],
    )?;
    let max_workers = config.max_workers.get(&job.backend).copied().unwrap_or(10);
    if running.len() >= max_workers {
        return Ok(Some((
            StatusCode::WaitingOnWorkers,
            "Waiting on available workers",
        )));
    }
    if job.requires_db {
        let running_db_jobs = running.iter().filter(|j| j.requires_db).count();
        let max_db_workers = config.max_db_workers.get(&job.backend).copied().unwrap_or(2);
        if running_db_jobs >= max_db_workers {
            return Ok(Some((
                StatusCode::WaitingOnDbWorkers,
                "Waiting on available database workers",
            )));
        }
    }
    Ok(None)
}

fn handle_running_job(conn: &Connection, config: &ControllerConfig, job: &mut Job) -> Result<()> {
    let Some(task) = tasks::runjob_task_for_job(conn, job)? else {
        // A running job with no task is inconsistent; wind back to pending
        // and let the next tick issue a fresh one.
        return set_code(
            conn,
            job,
            StatusCode::WaitingOnNewTask,
            "Re-issuing lost task",
            None,
        );
    };

    if task.agent_complete {
        let results = task
            .agent_results
            .as_ref()
            .and_then(JobTaskResults::from_value);
        return process_completed_results(
            conn,
            config.max_task_retries,
            job,
            results.as_ref(),
            task.agent_timestamp_ns,
        );
    }

    if !task.active {
        // Deactivated out from under the agent (cancellation, maintenance or
        // reboot); those paths set the job's next code themselves.
        return Ok(());
    }

    // Mirror the last stage the agent reported, if any
    let code = task
        .agent_stage
        .as_deref()
        .and_then(TaskStage::from_str)
        .and_then(|stage| match stage {
            TaskStage::Preparing => Some(StatusCode::Preparing),
            TaskStage::Prepared => Some(StatusCode::Prepared),
            TaskStage::Executing => Some(StatusCode::Executing),
            TaskStage::Executed => Some(StatusCode::Executed),
            TaskStage::Finalizing => Some(StatusCode::Finalizing),
            _ => None,
        })
        .unwrap_or(job.status_code);
    let message = job.status_message.clone();
    set_code(conn, job, code, &message, task.agent_timestamp_ns)
}

/// Decide a job's terminal code from a completed task's results. Shared by
/// the task-update handler and the scheduler's fallback path.
pub fn process_completed_results(
    conn: &Connection,
    max_retries: u32,
    job: &mut Job,
    results: Option<&JobTaskResults>,
    timestamp_ns: Option<i64>,
) -> Result<()> {
    if let Some(error) = results.and_then(|r| r.error.as_ref()) {
        let retries_used = db::tasks_for_job(conn, &job.id, TaskKind::RunJob)?
            .len()
            .saturating_sub(1) as u32;
        if error.retryable && retries_used < max_retries {
            return set_code(
                conn,
                job,
                StatusCode::WaitingOnNewTask,
                "Job encountered an error that can be retried with a new task",
                timestamp_ns,
            );
        }
        return set_code(
            conn,
            job,
            StatusCode::JobError,
            &format!("Job failed: {}", error.message),
            timestamp_ns,
        );
    }
    let Some(results) = results else {
        return set_code(
            conn,
            job,
            StatusCode::InternalError,
            "Agent reported task complete without results",
            timestamp_ns,
        );
    };
    save_results(conn, job, results, timestamp_ns)
}

/// Map finalized results onto a terminal status code.
pub fn save_results(
    conn: &Connection,
    job: &mut Job,
    results: &JobTaskResults,
    timestamp_ns: Option<i64>,
) -> Result<()> {
    let timestamp_ns = results.timestamp_ns.or(timestamp_ns);
    if results.exit_code.unwrap_or(-1) != 0 {
        let mut message = "Job exited with an error".to_string();
        if let Some(extra) = results.status_message.as_deref().filter(|m| !m.is_empty()) {
            message = format!("{message}: {extra}");
        } else if job.requires_db {
            if let Some((_, hint)) = DATABASE_EXIT_CODES
                .iter()
                .find(|(code, _)| Some(*code) == results.exit_code)
            {
                message = format!("{message}: {hint}");
            }
        }
        return set_code(conn, job, StatusCode::NonzeroExit, &message, timestamp_ns);
    }
    if results.has_unmatched_patterns {
        // Often just a typo in the output spec, so worth a pointer
        return set_code(
            conn,
            job,
            StatusCode::UnmatchedPatterns,
            "Outputs matching expected patterns were not found. See job log for details.",
            timestamp_ns,
        );
    }
    let mut message = "Completed successfully".to_string();
    if results.has_level4_excluded_files {
        message.push_str(
            ", but some file(s) marked as moderately_sensitive were excluded. \
             See job log for details.",
        );
    }
    set_code(conn, job, StatusCode::Succeeded, &message, timestamp_ns)
}

fn job_states(conn: &Connection, ids: &[String]) -> Result<Vec<State>> {
    let mut states = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(job) = db::get_job(conn, id)? {
            states.push(job.state);
        }
    }
    Ok(states)
}

/// Set the granular status code, deriving the coarse state and timestamps.
///
/// Terminal states are sticky: once a job is FAILED or SUCCEEDED no further
/// transition is applied. When the code is unchanged only the `updated_at`
/// timestamp moves, at most once a minute.
pub fn set_code(
    conn: &Connection,
    job: &mut Job,
    new_code: StatusCode,
    message: &str,
    task_timestamp_ns: Option<i64>,
) -> Result<()> {
    let current_ns = now_ns();
    let timestamp_ns = task_timestamp_ns.unwrap_or(current_ns);

    if job.status_code == new_code {
        let now = now_secs();
        if now - job.updated_at < TIMESTAMP_REFRESH_SECS {
            return Ok(());
        }
        job.updated_at = now;
        return db::update_job(conn, job);
    }

    if job.state.is_terminal() {
        tracing::warn!(
            job_id = %job.id,
            current = %job.status_code,
            attempted = %new_code,
            "Ignoring status change on terminal job"
        );
        return Ok(());
    }

    // Clamp out-of-order task timestamps rather than recording a negative
    // state duration.
    let timestamp_ns = if timestamp_ns < job.status_code_updated_at {
        job.status_code_updated_at + 1_000_000
    } else {
        timestamp_ns
    };
    let timestamp_s = timestamp_ns / 1_000_000_000;

    if let Some(state) = new_code.implied_state() {
        job.state = state;
    }
    match job.state {
        State::Running => {
            if job.started_at.is_none() {
                job.started_at = Some(timestamp_s);
            }
        }
        State::Pending => {
            // Reset codes wind the job back to pending
            job.started_at = None;
        }
        State::Failed | State::Succeeded => {
            job.completed_at = Some(timestamp_s);
        }
    }

    job.status_code = new_code;
    job.status_message = message.to_string();
    job.updated_at = now_secs();
    job.status_code_updated_at = timestamp_ns;
    db::update_job(conn, job)?;

    tracing::info!(
        job_id = %job.id,
        workspace = %job.workspace,
        action = %job.action,
        status_code = %new_code,
        "{message}"
    );
    Ok(())
}

fn refresh_job_timestamps(conn: &Connection, job: &mut Job) -> Result<()> {
    let code = job.status_code;
    let message = job.status_message.clone();
    set_code(conn, job, code, &message, None)
}
