//! Bidirectional bridge to the external job-server: polls for active job
//! requests, posts back the state of the associated jobs.
//!
//! The sync loop never writes job state beyond creating request rows and
//! applying cancellation lists; everything else belongs to the scheduler.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::builder::update_cancelled_jobs;
use crate::config::ControllerConfig;
use crate::error::{Result, RunnerError};
use crate::models::{timestamp_to_isoformat, Flag, Job, JobRequest, Privacy, State, TaskKind};
use crate::redact::redact_message;
use crate::schema::JobTaskResults;

use super::SharedDb;

pub struct SyncLoop {
    db: SharedDb,
    config: ControllerConfig,
    client: reqwest::Client,
}

impl SyncLoop {
    pub fn new(db: SharedDb, config: ControllerConfig) -> Self {
        SyncLoop {
            db,
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Run the sync loop until shutdown. A failed tick is logged and retried
    /// at the next interval; job state is never touched on failure.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            endpoint = %self.config.job_server_endpoint,
            "Sync loop started"
        );
        let mut interval = tokio::time::interval(self.config.sync_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.sync().await {
                        tracing::warn!(error = %err, "Sync failed, will retry next interval");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Sync loop stopped");
                    return;
                }
            }
        }
    }

    pub async fn sync(&self) -> Result<()> {
        for backend in &self.config.backends {
            self.sync_backend(backend).await?;
        }
        Ok(())
    }

    async fn sync_backend(&self, backend: &str) -> Result<()> {
        let response = self.api_get("job-requests", backend).await?;
        let results = response
            .get("results")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();
        let job_requests: Vec<JobRequest> = results
            .iter()
            .map(job_request_from_remote)
            .collect::<Result<_>>()?;

        {
            let mut db = self.db.lock().unwrap();
            for request in &job_requests {
                db.upsert_job_request(request)?;
                update_cancelled_jobs(&mut db, request)?;
            }
        }

        // Push the union of what the job-server thinks is active and what we
        // think is active, so terminal transitions are reported once more
        // after the job-server stops asking.
        let jobs_data = {
            let db = self.db.lock().unwrap();
            let mut request_ids: Vec<String> = job_requests.iter().map(|r| r.id.clone()).collect();
            for id in db.active_job_request_ids()? {
                if !request_ids.contains(&id) {
                    request_ids.push(id);
                }
            }
            let mut jobs_data = Vec::new();
            for request_id in &request_ids {
                for job in db.jobs_for_request(request_id)? {
                    if job.backend == backend {
                        let results = latest_task_results(&db, &job)?;
                        jobs_data.push(job_to_remote(&job, results.as_ref()));
                    }
                }
            }
            jobs_data
        };

        if !jobs_data.is_empty() {
            tracing::debug!(backend, count = jobs_data.len(), "Pushing job statuses");
            self.api_post("jobs", backend, &serde_json::to_value(&jobs_data)?)
                .await?;
        }
        Ok(())
    }

    async fn api_get(&self, path: &str, backend: &str) -> Result<serde_json::Value> {
        self.api_request(reqwest::Method::GET, path, backend, None)
            .await
    }

    async fn api_post(
        &self,
        path: &str,
        backend: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.api_request(reqwest::Method::POST, path, backend, Some(body))
            .await
    }

    async fn api_request(
        &self,
        method: reqwest::Method,
        path: &str,
        backend: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let token = self
            .config
            .job_server_tokens
            .get(backend)
            .ok_or_else(|| RunnerError::Sync(format!("no api token for backend '{backend}'")))?;
        let url = format!(
            "{}/{}/?backend={backend}",
            self.config.job_server_endpoint.trim_end_matches('/'),
            path.trim_matches('/'),
        );

        let flags = {
            let db = self.db.lock().unwrap();
            flags_header(&db.current_flags(backend)?)
        };

        let mut request = self
            .client
            .request(method, &url)
            .header("Authorization", token)
            .header("Flags", serde_json::to_string(&flags)?);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| RunnerError::Sync(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(RunnerError::Sync(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        Ok(response.json().await.unwrap_or(json!({})))
    }
}

/// The most recent RUNJOB results for a job, used for output counts.
fn latest_task_results(db: &crate::db::Database, job: &Job) -> Result<Option<JobTaskResults>> {
    let tasks = db.tasks_for_job(&job.id, TaskKind::RunJob)?;
    Ok(tasks
        .into_iter()
        .last()
        .and_then(|t| t.agent_results)
        .and_then(|v| JobTaskResults::from_value(&v)))
}

/// Flags serialized into the `Flags` request header, so operational state
/// travels with every sync call.
pub fn flags_header(flags: &[Flag]) -> BTreeMap<String, serde_json::Value> {
    flags
        .iter()
        .map(|f| {
            (
                f.id.clone(),
                json!({"v": f.value, "ts": timestamp_to_isoformat(f.timestamp)}),
            )
        })
        .collect()
}

/// Convert a job request from the job-server wire format into our own
/// representation, keeping the original payload verbatim.
pub fn job_request_from_remote(value: &serde_json::Value) -> Result<JobRequest> {
    let string = |path: &[&str]| -> String {
        let mut current = value;
        for key in path {
            current = current.get(key).unwrap_or(&serde_json::Value::Null);
        }
        match current {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => String::new(),
        }
    };
    let string_list = |key: &str| -> Vec<String> {
        value
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    };

    let id = string(&["identifier"]);
    if id.is_empty() {
        return Err(RunnerError::Sync("job request without identifier".into()));
    }
    Ok(JobRequest {
        id,
        repo_url: string(&["workspace", "repo"]),
        branch: string(&["workspace", "branch"]),
        commit: string(&["sha"]),
        requested_actions: string_list("requested_actions"),
        cancelled_actions: string_list("cancelled_actions"),
        workspace: string(&["workspace", "name"]),
        codelists_ok: value
            .get("codelists_ok")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
        database_name: {
            let name = string(&["database_name"]);
            if name.is_empty() {
                "default".to_string()
            } else {
                name
            }
        },
        force_run_dependencies: value
            .get("force_run_dependencies")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        backend: string(&["backend"]),
        original: value.clone(),
    })
}

/// A job's status in the format the job-server expects. File lists never
/// cross this boundary, only counts and the declared patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteJob {
    pub identifier: String,
    pub job_request_id: String,
    pub action: String,
    pub run_command: String,
    pub status: String,
    pub status_code: String,
    pub status_message: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub requires_db: bool,
    pub outputs: RemoteOutputs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteOutputs {
    pub count: u64,
    pub high_privacy_patterns: Vec<String>,
    pub medium_privacy_patterns: Vec<String>,
    pub has_unmatched_patterns: bool,
}

pub fn job_to_remote(job: &Job, results: Option<&JobTaskResults>) -> RemoteJob {
    let mut outputs = RemoteOutputs::default();
    for (pattern, privacy) in &job.output_spec {
        match privacy {
            Privacy::HighlySensitive => outputs.high_privacy_patterns.push(pattern.clone()),
            Privacy::ModeratelySensitive => outputs.medium_privacy_patterns.push(pattern.clone()),
        }
    }
    if let Some(results) = results {
        outputs.count = results.output_count;
        outputs.has_unmatched_patterns = results.has_unmatched_patterns;
    }
    RemoteJob {
        identifier: job.id.clone(),
        job_request_id: job.job_request_id.clone(),
        action: job.action.clone(),
        run_command: job.run_command.join(" "),
        status: job.state.as_str().to_string(),
        status_code: job.status_code.as_str().to_string(),
        status_message: redact_message(&job.status_message, &[]),
        created_at: Some(timestamp_to_isoformat(job.created_at)),
        updated_at: Some(timestamp_to_isoformat(job.updated_at)),
        started_at: job.started_at.map(timestamp_to_isoformat),
        completed_at: job.completed_at.map(timestamp_to_isoformat),
        requires_db: job.requires_db,
        outputs,
    }
}

/// Aggregate state over a set of jobs, for the RAP status endpoint.
pub fn aggregate_state(jobs: &[Job]) -> &'static str {
    if jobs.is_empty() {
        return "unknown";
    }
    if jobs.iter().any(|j| j.state == State::Running) {
        return "running";
    }
    if jobs.iter().any(|j| j.state == State::Pending) {
        return "pending";
    }
    if jobs.iter().any(|j| j.state == State::Failed) {
        return "failed";
    }
    "succeeded"
}
