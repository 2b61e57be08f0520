//! HTTP client for the controller's task API.
//!
//! Transport errors are retried with bounded exponential backoff; task state
//! is only advanced once an update has actually been recorded server-side.

use std::time::Duration;

use rand::Rng;

use crate::config::AgentConfig;
use crate::error::{Result, RunnerError};
use crate::schema::{ActiveTasksResponse, AgentTask, TaskUpdate, TaskUpdateResponse};

/// How the agent talks to the controller. The seam exists so tests can wire
/// the agent loop straight into an in-process controller.
#[allow(async_fn_in_trait)]
pub trait ControllerClient: Send + Sync {
    /// The currently active tasks for this agent's backend.
    async fn active_tasks(&self) -> Result<Vec<AgentTask>>;

    /// Report a stage transition. The response says whether the agent may
    /// stop reporting on the task.
    async fn update_task(&self, update: &TaskUpdate) -> Result<TaskUpdateResponse>;
}

const MAX_ATTEMPTS: u32 = 4;
const BACKOFF_BASE_MS: u64 = 500;

pub struct HttpControllerClient {
    base_url: String,
    backend: String,
    token: String,
    client: reqwest::Client,
}

impl HttpControllerClient {
    pub fn new(config: &AgentConfig) -> Self {
        HttpControllerClient {
            base_url: config.task_api_endpoint.trim_end_matches('/').to_string(),
            backend: config.backend.clone(),
            token: config.task_api_token.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.backend, path)
    }

    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match build().header("Authorization", &self.token).send().await {
                Ok(response) if response.status().is_server_error() && attempt < MAX_ATTEMPTS => {
                    tracing::warn!(status = %response.status(), attempt, "Task API returned server error, retrying");
                }
                Ok(response) => {
                    if !response.status().is_success() {
                        return Err(RunnerError::Sync(format!(
                            "task API returned {}",
                            response.status()
                        )));
                    }
                    return Ok(response);
                }
                Err(err) if attempt < MAX_ATTEMPTS => {
                    tracing::warn!(error = %err, attempt, "Task API request failed, retrying");
                }
                Err(err) => return Err(err.into()),
            }
            let jitter = rand::thread_rng().gen_range(0..BACKOFF_BASE_MS);
            let backoff = BACKOFF_BASE_MS * 2u64.pow(attempt - 1) + jitter;
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
    }
}

impl ControllerClient for HttpControllerClient {
    async fn active_tasks(&self) -> Result<Vec<AgentTask>> {
        let url = self.url("tasks");
        let response = self
            .send_with_retry(|| self.client.get(format!("{url}/")))
            .await?;
        let parsed: ActiveTasksResponse = response.json().await?;
        Ok(parsed.tasks)
    }

    async fn update_task(&self, update: &TaskUpdate) -> Result<TaskUpdateResponse> {
        let url = self.url("task/update");
        let response = self
            .send_with_retry(|| self.client.post(format!("{url}/")).json(update))
            .await?;
        Ok(response.json().await?)
    }
}
