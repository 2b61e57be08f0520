//! Turns an incoming [`JobRequest`] plus the pipeline fetched from the study
//! repository into a set of [`Job`] rows with dependency edges.
//!
//! Builder failures are modelled as result variants, not panics: a request
//! that cannot be expanded produces job rows already in a terminal FAILED
//! state so the failure shows up in status reports without ever occupying
//! the scheduler.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::process::Command;

use thiserror::Error;

use crate::db::{self, Database};
use crate::error::{Result, RunnerError};
use crate::models::{now_ns, now_secs, Job, JobRequest, State, StatusCode};
use crate::pipeline::{load_pipeline, Pipeline, PipelineError, RUN_ALL};

/// Action name of the placeholder job used to report request-level failures.
/// The only way to tell the job-server a request was broken is to give it a
/// job to look at.
pub const ERROR_ACTION: &str = "__error__";

/// Prior failures which make re-running pointless: the same commit will fail
/// the same way, so dependents fail fast instead.
const NON_RETRIABLE_CODES: &[StatusCode] = &[StatusCode::StaleCodelists, StatusCode::InvalidPipeline];

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Codelists are out of date (required by action {0})")]
    StaleCodelists(String),

    #[error("Could not fetch study code: {0}")]
    Fetch(String),
}

/// Where the builder gets pipeline files and commit hashes from. Git is an
/// external collaborator, so it sits behind this seam; tests supply an
/// in-memory implementation.
pub trait ProjectSource: Send + Sync {
    /// Resolve a branch to a concrete commit hash.
    fn resolve_commit(&self, repo_url: &str, branch: &str) -> std::result::Result<String, BuildError>;

    /// Fetch `project.yaml` as it exists at the given commit.
    fn read_project_file(&self, repo_url: &str, commit: &str) -> std::result::Result<String, BuildError>;
}

/// Fetches study code with the `git` CLI, keeping a bare mirror per repo
/// under the configured cache directory.
pub struct GitProjectSource {
    repos_dir: PathBuf,
    access_token: Option<String>,
}

impl GitProjectSource {
    pub fn new(repos_dir: PathBuf, access_token: Option<String>) -> Self {
        GitProjectSource {
            repos_dir,
            access_token,
        }
    }

    fn authenticated_url(&self, repo_url: &str) -> String {
        match &self.access_token {
            Some(token) => repo_url.replacen("https://", &format!("https://{token}@"), 1),
            None => repo_url.to_string(),
        }
    }

    fn repo_cache_dir(&self, repo_url: &str) -> PathBuf {
        let name: String = repo_url
            .trim_end_matches('/')
            .rsplit('/')
            .take(2)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("-");
        self.repos_dir.join(name)
    }

    fn git(&self, args: &[&str]) -> std::result::Result<String, BuildError> {
        let output = Command::new("git")
            .args(args)
            .output()
            .map_err(|e| BuildError::Fetch(format!("could not run git: {e}")))?;
        if !output.status.success() {
            return Err(BuildError::Fetch(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim(),
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn ensure_mirror(&self, repo_url: &str) -> std::result::Result<PathBuf, BuildError> {
        let cache_dir = self.repo_cache_dir(repo_url);
        let url = self.authenticated_url(repo_url);
        if cache_dir.exists() {
            self.git(&[
                "-C",
                cache_dir.to_str().unwrap_or_default(),
                "fetch",
                "--force",
                &url,
                "+refs/heads/*:refs/heads/*",
            ])?;
        } else {
            std::fs::create_dir_all(&self.repos_dir)
                .map_err(|e| BuildError::Fetch(e.to_string()))?;
            self.git(&[
                "clone",
                "--mirror",
                &url,
                cache_dir.to_str().unwrap_or_default(),
            ])?;
        }
        Ok(cache_dir)
    }
}

impl ProjectSource for GitProjectSource {
    fn resolve_commit(&self, repo_url: &str, branch: &str) -> std::result::Result<String, BuildError> {
        let url = self.authenticated_url(repo_url);
        let output = self.git(&["ls-remote", &url, branch])?;
        output
            .split_whitespace()
            .next()
            .map(|sha| sha.to_string())
            .filter(|sha| !sha.is_empty())
            .ok_or_else(|| BuildError::Fetch(format!("branch '{branch}' not found in {repo_url}")))
    }

    fn read_project_file(&self, repo_url: &str, commit: &str) -> std::result::Result<String, BuildError> {
        let cache_dir = self.ensure_mirror(repo_url)?;
        self.git(&[
            "-C",
            cache_dir.to_str().unwrap_or_default(),
            "show",
            &format!("{commit}:project.yaml"),
        ])
        .map_err(|_| BuildError::Fetch(format!("no project.yaml found at commit {commit}")))
    }
}

/// A resolved commit plus the pipeline file fetched at it.
pub struct FetchedProject {
    pub commit: String,
    pub project_file: String,
}

/// Validate a request and fetch its pipeline. Talks to git, so callers run
/// this before taking the database lock.
pub fn fetch_project(
    source: &dyn ProjectSource,
    request: &JobRequest,
) -> std::result::Result<FetchedProject, BuildError> {
    validate_request(request)?;
    let commit = if request.commit.is_empty() {
        source.resolve_commit(&request.repo_url, &request.branch)?
    } else {
        request.commit.clone()
    };
    let project_file = source.read_project_file(&request.repo_url, &commit)?;
    Ok(FetchedProject {
        commit,
        project_file,
    })
}

/// Expand a job request into job rows. On a build failure the request is
/// still marked expanded and the failure is recorded as terminal job rows,
/// so the scheduler never sees it again.
///
/// Returns the number of new jobs created.
pub fn create_or_update_jobs(
    db: &mut Database,
    request: &JobRequest,
    fetched: std::result::Result<FetchedProject, BuildError>,
) -> Result<usize> {
    match fetched.and_then(|fetched| build_jobs(db, request, &fetched)) {
        Ok(new_jobs) => {
            let count = new_jobs.len();
            db.in_transaction(|conn| {
                for job in &new_jobs {
                    db::insert_job(conn, job)?;
                }
                db::mark_job_request_expanded(conn, &request.id)?;
                Ok(())
            })?;
            tracing::info!(
                job_request_id = %request.id,
                workspace = %request.workspace,
                new_jobs = count,
                "Expanded job request"
            );
            Ok(count)
        }
        Err(err) => {
            tracing::warn!(job_request_id = %request.id, error = %err, "Could not expand job request");
            let placeholder = error_job(request, &err);
            db.in_transaction(|conn| {
                db::insert_job(conn, &placeholder)?;
                db::mark_job_request_expanded(conn, &request.id)?;
                Ok(())
            })?;
            Ok(0)
        }
    }
}

fn build_jobs(
    db: &Database,
    request: &JobRequest,
    fetched: &FetchedProject,
) -> std::result::Result<Vec<Job>, BuildError> {
    let commit = fetched.commit.clone();
    let pipeline = load_pipeline(&fetched.project_file)?;

    let latest_jobs = latest_jobs_by_action(db, request, &pipeline)
        .map_err(|e| BuildError::InvalidRequest(e.to_string()))?;

    let requested = requested_actions(request, &pipeline)?;

    // Reject dependency cycles up front, creating a terminal job per cycle
    // member rather than failing the whole request opaquely.
    let cycle_members = find_cycle_members(&pipeline, &requested)?;
    if !cycle_members.is_empty() {
        return Ok(cycle_members
            .into_iter()
            .map(|action| {
                terminal_job(
                    request,
                    &commit,
                    &action,
                    StatusCode::InvalidPipeline,
                    format!("Action '{action}' is part of a dependency cycle"),
                )
            })
            .collect());
    }

    let mut jobs_by_action: HashMap<String, JobSlot> = latest_jobs
        .into_iter()
        .map(|(action, job)| (action, JobSlot::Existing(job)))
        .collect();

    for action in &requested {
        add_jobs_recursively(&mut jobs_by_action, request, &commit, &pipeline, action)?;
    }

    let new_jobs: Vec<Job> = jobs_by_action
        .into_values()
        .filter_map(|slot| match slot {
            JobSlot::New(job) => Some(job),
            JobSlot::Existing(_) => None,
        })
        .collect();

    // Refuse to run database actions against stale codelists. The check only
    // applies to jobs we are about to create; completed ones already ran.
    if !request.codelists_ok {
        if let Some(job) = new_jobs.iter().find(|j| j.requires_db) {
            return Err(BuildError::StaleCodelists(job.action.clone()));
        }
    }

    Ok(new_jobs)
}

enum JobSlot {
    /// The most recent prior job for this action; dependents link to it.
    Existing(Job),
    /// A job created by this request.
    New(Job),
}

impl JobSlot {
    fn job(&self) -> &Job {
        match self {
            JobSlot::Existing(job) | JobSlot::New(job) => job,
        }
    }
}

fn validate_request(request: &JobRequest) -> std::result::Result<(), BuildError> {
    if request.requested_actions.is_empty() {
        return Err(BuildError::InvalidRequest(
            "At least one action must be supplied".into(),
        ));
    }
    if request.workspace.is_empty() {
        return Err(BuildError::InvalidRequest(
            "Workspace name cannot be blank".into(),
        ));
    }
    if !request
        .workspace
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(BuildError::InvalidRequest(
            "Invalid workspace name (allowed are alphanumeric, dash and underscore)".into(),
        ));
    }
    Ok(())
}

fn requested_actions(
    request: &JobRequest,
    pipeline: &Pipeline,
) -> std::result::Result<Vec<String>, BuildError> {
    if request.requested_actions.iter().any(|a| a == RUN_ALL) {
        return Ok(pipeline.all_action_names());
    }
    for action in &request.requested_actions {
        if !pipeline.actions.contains_key(action) {
            return Err(PipelineError::UnknownAction(action.clone()).into());
        }
    }
    Ok(request.requested_actions.clone())
}

/// The most recent uncancelled job for each action in the pipeline.
/// Placeholder error jobs are ignored; they exist only for reporting.
fn latest_jobs_by_action(
    db: &Database,
    request: &JobRequest,
    pipeline: &Pipeline,
) -> Result<BTreeMap<String, Job>> {
    let mut latest: BTreeMap<String, Job> = BTreeMap::new();
    for job in db.workspace_jobs(&request.backend, &request.workspace)? {
        if job.action == ERROR_ACTION || !pipeline.actions.contains_key(&job.action) {
            continue;
        }
        match latest.get(&job.action) {
            Some(existing) if existing.created_at >= job.created_at => {}
            _ => {
                latest.insert(job.action.clone(), job);
            }
        }
    }
    Ok(latest)
}

/// Find every action on a dependency cycle reachable from the requested
/// actions, using Kahn-style elimination over the reachable subgraph.
fn find_cycle_members(
    pipeline: &Pipeline,
    requested: &[String],
) -> std::result::Result<Vec<String>, BuildError> {
    let mut reachable: HashSet<String> = HashSet::new();
    let mut stack: Vec<String> = requested.to_vec();
    while let Some(action) = stack.pop() {
        if !reachable.insert(action.clone()) {
            continue;
        }
        for dependency in &pipeline.action(&action)?.needs {
            stack.push(dependency.clone());
        }
    }

    let mut remaining: HashSet<String> = reachable.clone();
    loop {
        let resolvable: Vec<String> = remaining
            .iter()
            .filter(|action| {
                pipeline.actions[*action]
                    .needs
                    .iter()
                    .all(|dep| !remaining.contains(dep))
            })
            .cloned()
            .collect();
        if resolvable.is_empty() {
            break;
        }
        for action in resolvable {
            remaining.remove(&action);
        }
    }

    let mut members: Vec<String> = remaining.into_iter().collect();
    members.sort();
    Ok(members)
}

fn add_jobs_recursively(
    jobs_by_action: &mut HashMap<String, JobSlot>,
    request: &JobRequest,
    commit: &str,
    pipeline: &Pipeline,
    action: &str,
) -> std::result::Result<(), BuildError> {
    if let Some(slot) = jobs_by_action.get(action) {
        if !job_should_be_rerun(request, slot.job()) {
            return Ok(());
        }
    }

    let spec = pipeline.action(action)?;

    // Create any jobs our dependencies need first, and collect the ids of
    // the ones this job has to wait for.
    let mut wait_for_job_ids = Vec::new();
    let mut failed_dependency = false;
    for dependency in &spec.needs {
        add_jobs_recursively(jobs_by_action, request, commit, pipeline, dependency)?;
        let dep_job = jobs_by_action[dependency].job();
        match dep_job.state {
            State::Pending | State::Running => wait_for_job_ids.push(dep_job.id.clone()),
            State::Succeeded => {}
            State::Failed => {
                if NON_RETRIABLE_CODES.contains(&dep_job.status_code) {
                    failed_dependency = true;
                }
            }
        }
    }

    let job = if failed_dependency {
        terminal_job(
            request,
            commit,
            action,
            StatusCode::DependencyFailed,
            "Not starting as dependency failed".to_string(),
        )
    } else {
        let timestamp = now_secs();
        Job {
            id: Job::deterministic_id(&request.id, action),
            job_request_id: request.id.clone(),
            backend: request.backend.clone(),
            state: State::Pending,
            repo_url: request.repo_url.clone(),
            commit: commit.to_string(),
            workspace: request.workspace.clone(),
            database_name: request.database_name.clone(),
            action: action.to_string(),
            requires_outputs_from: spec.needs.clone(),
            wait_for_job_ids,
            run_command: spec.run.clone(),
            output_spec: spec.outputs.clone(),
            outputs: BTreeMap::new(),
            unmatched_patterns: Vec::new(),
            status_message: "Created".to_string(),
            status_code: StatusCode::Created,
            cancelled: false,
            requires_db: spec.database_access,
            created_at: timestamp,
            updated_at: timestamp,
            started_at: None,
            completed_at: None,
            status_code_updated_at: now_ns(),
        }
    };

    jobs_by_action.insert(action.to_string(), JobSlot::New(job));
    Ok(())
}

/// Do we need to run the action referenced by this prior job again?
fn job_should_be_rerun(request: &JobRequest, job: &Job) -> bool {
    // Already running or about to: reuse it in flight.
    if matches!(job.state, State::Pending | State::Running) {
        return false;
    }
    // Explicitly requested actions always get re-run.
    if request.requested_actions.iter().any(|a| a == &job.action) {
        return true;
    }
    if request.force_run_dependencies {
        return true;
    }
    match job.state {
        // Succeeded at the same commit: nothing to do. A dependency that
        // succeeded at an older commit is still reused; only an explicit
        // request or the force flag re-runs it.
        State::Succeeded => false,
        // Failed non-retriably: the dependent fails fast instead.
        State::Failed => !NON_RETRIABLE_CODES.contains(&job.status_code),
        State::Pending | State::Running => false,
    }
}

fn terminal_job(
    request: &JobRequest,
    commit: &str,
    action: &str,
    code: StatusCode,
    message: String,
) -> Job {
    let timestamp = now_secs();
    Job {
        id: Job::deterministic_id(&request.id, action),
        job_request_id: request.id.clone(),
        backend: request.backend.clone(),
        state: code.implied_state().unwrap_or(State::Failed),
        repo_url: request.repo_url.clone(),
        commit: commit.to_string(),
        workspace: request.workspace.clone(),
        database_name: request.database_name.clone(),
        action: action.to_string(),
        requires_outputs_from: Vec::new(),
        wait_for_job_ids: Vec::new(),
        run_command: Vec::new(),
        output_spec: BTreeMap::new(),
        outputs: BTreeMap::new(),
        unmatched_patterns: Vec::new(),
        status_message: message,
        status_code: code,
        cancelled: false,
        requires_db: false,
        created_at: timestamp,
        updated_at: timestamp,
        started_at: Some(timestamp),
        completed_at: Some(timestamp),
        status_code_updated_at: now_ns(),
    }
}

/// Build the placeholder job reporting a request-level build failure.
fn error_job(request: &JobRequest, err: &BuildError) -> Job {
    let code = match err {
        BuildError::StaleCodelists(_) => StatusCode::StaleCodelists,
        BuildError::Pipeline(_) => StatusCode::InvalidPipeline,
        BuildError::InvalidRequest(_) | BuildError::Fetch(_) => StatusCode::InternalError,
    };
    terminal_job(request, &request.commit, ERROR_ACTION, code, err.to_string())
}

/// Apply the cancellation list from a request to its jobs. Safe to call on
/// every sync poll; only non-terminal jobs are affected.
pub fn update_cancelled_jobs(db: &mut Database, request: &JobRequest) -> Result<()> {
    if request.cancelled_actions.is_empty() {
        return Ok(());
    }
    if db.jobs_for_request(&request.id)?.is_empty() {
        return Ok(());
    }
    tracing::debug!(
        job_request_id = %request.id,
        actions = ?request.cancelled_actions,
        "Flagging cancelled actions"
    );
    db.set_cancelled_flags(&request.id, &request.cancelled_actions)
}

impl From<BuildError> for RunnerError {
    fn from(err: BuildError) -> Self {
        RunnerError::Internal(err.to_string())
    }
}
