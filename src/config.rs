//! Environment-derived configuration for the controller and agent processes.
//!
//! Configuration is parsed once at startup; reload requires a restart. A
//! missing or malformed variable is a fatal startup error.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, RunnerError};

/// Configuration for the controller process.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Backends this controller owns.
    pub backends: Vec<String>,
    /// Address the task/RAP API listens on.
    pub bind_addr: SocketAddr,
    pub database_path: PathBuf,
    pub job_server_endpoint: String,
    /// Per-backend tokens used when talking to the job-server.
    pub job_server_tokens: HashMap<String, String>,
    /// Per-backend tokens agents use to authenticate to the task API.
    pub task_api_tokens: HashMap<String, String>,
    /// Per-backend token lists for external RAP API clients.
    pub client_tokens: HashMap<String, Vec<String>>,
    pub tick_interval: Duration,
    pub sync_interval: Duration,
    pub maintenance_poll_interval: Duration,
    pub max_workers: HashMap<String, usize>,
    pub max_db_workers: HashMap<String, usize>,
    /// How many fresh RUNJOB tasks a job may consume after retryable errors.
    pub max_task_retries: u32,
    pub job_cpu_count: HashMap<String, f64>,
    pub job_memory_limit: HashMap<String, String>,
    pub docker_registry: String,
    /// Token for fetching private study repositories.
    pub private_repo_token: Option<String>,
    /// Local cache of fetched study repositories.
    pub repos_dir: PathBuf,
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self> {
        let backends = parse_list(&require("BACKENDS")?);
        if backends.is_empty() {
            return Err(RunnerError::Config("BACKENDS must not be empty".into()));
        }
        let bind_addr = require("CONTROLLER_BIND_ADDR")?
            .parse()
            .map_err(|e| RunnerError::Config(format!("invalid CONTROLLER_BIND_ADDR: {e}")))?;
        let mut job_memory_limit =
            parse_per_backend(&optional("JOB_MEMORY_LIMIT"), &backends)?;
        for backend in &backends {
            job_memory_limit
                .entry(backend.clone())
                .or_insert_with(|| "4G".to_string());
        }
        Ok(ControllerConfig {
            bind_addr,
            database_path: PathBuf::from(require("DATABASE_FILE")?),
            job_server_endpoint: require("JOB_SERVER_ENDPOINT")?,
            job_server_tokens: parse_per_backend(&optional("JOB_SERVER_TOKENS"), &backends)?,
            task_api_tokens: parse_per_backend(&optional("TASK_API_TOKENS"), &backends)?,
            client_tokens: parse_per_backend_list(&optional("CLIENT_TOKENS"), &backends)?,
            tick_interval: parse_secs("TICK_INTERVAL", 5)?,
            sync_interval: parse_secs("SYNC_INTERVAL", 30)?,
            maintenance_poll_interval: parse_secs("MAINTENANCE_POLL_INTERVAL", 300)?,
            max_workers: parse_per_backend_parsed(&optional("MAX_WORKERS"), &backends, 10)?,
            max_db_workers: parse_per_backend_parsed(&optional("MAX_DB_WORKERS"), &backends, 2)?,
            max_task_retries: parse_number("MAX_TASK_RETRIES", 3)?,
            job_cpu_count: parse_per_backend_parsed(&optional("JOB_CPU_COUNT"), &backends, 2.0)?,
            job_memory_limit,
            docker_registry: optional("DOCKER_REGISTRY")
                .unwrap_or_else(|| "ghcr.io/opensafely-core".to_string()),
            private_repo_token: optional("PRIVATE_REPO_ACCESS_TOKEN"),
            repos_dir: PathBuf::from(optional("REPOS_DIR").unwrap_or_else(|| "repos".to_string())),
            backends,
        })
    }
}

/// Configuration for the agent process. One agent runs per backend.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub backend: String,
    pub task_api_endpoint: String,
    pub task_api_token: String,
    pub poll_interval: Duration,
    pub high_privacy_dir: PathBuf,
    pub medium_privacy_dir: PathBuf,
    /// Named database connection strings, injected into db jobs at execute
    /// time and never written to the task store.
    pub database_urls: HashMap<String, String>,
    pub using_dummy_data_backend: bool,
    /// Leave containers and volumes in place after finalize, for debugging.
    pub keep_containers: bool,
    pub telemetry_endpoint: Option<String>,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Ok(AgentConfig {
            backend: require("BACKEND")?,
            task_api_endpoint: require("TASK_API_ENDPOINT")?,
            task_api_token: require("TASK_API_TOKEN")?,
            poll_interval: parse_secs("AGENT_POLL_INTERVAL", 5)?,
            high_privacy_dir: PathBuf::from(require("HIGH_PRIVACY_STORAGE_BASE")?),
            medium_privacy_dir: PathBuf::from(require("MEDIUM_PRIVACY_STORAGE_BASE")?),
            database_urls: parse_map(&optional("DATABASE_URLS"))?,
            using_dummy_data_backend: parse_bool("USING_DUMMY_DATA_BACKEND", false)?,
            keep_containers: parse_bool("KEEP_CONTAINERS", false)?,
            telemetry_endpoint: optional("TELEMETRY_ENDPOINT"),
        })
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.high_privacy_dir.join("workspaces")
    }

    pub fn medium_privacy_workspaces_dir(&self) -> PathBuf {
        self.medium_privacy_dir.join("workspaces")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.high_privacy_dir.join("logs")
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.high_privacy_dir.join("volumes")
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.high_privacy_dir.join("repos")
    }
}

fn require(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| RunnerError::Config(format!("missing environment variable {name}")))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `key=value` pairs separated by commas.
fn parse_map(value: &Option<String>) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    let Some(value) = value else {
        return Ok(map);
    };
    for entry in value.split(',').filter(|e| !e.trim().is_empty()) {
        let (key, val) = entry
            .split_once('=')
            .ok_or_else(|| RunnerError::Config(format!("expected key=value, got '{entry}'")))?;
        map.insert(key.trim().to_string(), val.trim().to_string());
    }
    Ok(map)
}

/// Per-backend string values: either `backend=value,...` pairs or a single
/// bare value applied to every backend.
fn parse_per_backend(
    value: &Option<String>,
    backends: &[String],
) -> Result<HashMap<String, String>> {
    let Some(raw) = value else {
        return Ok(HashMap::new());
    };
    if !raw.contains('=') {
        return Ok(backends
            .iter()
            .map(|b| (b.clone(), raw.trim().to_string()))
            .collect());
    }
    parse_map(value)
}

fn parse_per_backend_list(
    value: &Option<String>,
    backends: &[String],
) -> Result<HashMap<String, Vec<String>>> {
    let raw = parse_per_backend(value, backends)?;
    Ok(raw
        .into_iter()
        .map(|(backend, tokens)| {
            let tokens = tokens.split(';').map(|t| t.trim().to_string()).collect();
            (backend, tokens)
        })
        .collect())
}

fn parse_per_backend_parsed<T>(
    value: &Option<String>,
    backends: &[String],
    default: T,
) -> Result<HashMap<String, T>>
where
    T: std::str::FromStr + Clone,
    T::Err: std::fmt::Display,
{
    let raw = parse_per_backend(value, backends)?;
    let mut map = HashMap::new();
    for backend in backends {
        let parsed = match raw.get(backend) {
            Some(v) => v
                .parse()
                .map_err(|e| RunnerError::Config(format!("invalid value for {backend}: {e}")))?,
            None => default.clone(),
        };
        map.insert(backend.clone(), parsed);
    }
    Ok(map)
}

fn parse_secs(name: &str, default: u64) -> Result<Duration> {
    match optional(name) {
        Some(v) => v
            .parse()
            .map(Duration::from_secs)
            .map_err(|e| RunnerError::Config(format!("invalid {name}: {e}"))),
        None => Ok(Duration::from_secs(default)),
    }
}

fn parse_number<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match optional(name) {
        Some(v) => v
            .parse()
            .map_err(|e| RunnerError::Config(format!("invalid {name}: {e}"))),
        None => Ok(default),
    }
}

fn parse_bool(name: &str, default: bool) -> Result<bool> {
    match optional(name) {
        Some(v) => match v.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(RunnerError::Config(format!("invalid {name}: '{other}'"))),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_map_handles_pairs_and_empties() {
        let map = parse_map(&Some("a=1,b=2".into())).unwrap();
        assert_eq!(map.get("a"), Some(&"1".to_string()));
        assert_eq!(map.get("b"), Some(&"2".to_string()));
        assert!(parse_map(&None).unwrap().is_empty());
    }

    #[test]
    fn bare_value_applies_to_all_backends() {
        let backends = vec!["tpp".to_string(), "emis".to_string()];
        let map = parse_per_backend_parsed::<usize>(&Some("7".into()), &backends, 1).unwrap();
        assert_eq!(map.get("tpp"), Some(&7));
        assert_eq!(map.get("emis"), Some(&7));
    }

    #[test]
    fn per_backend_values_override_default() {
        let backends = vec!["tpp".to_string(), "emis".to_string()];
        let map = parse_per_backend_parsed::<usize>(&Some("tpp=4".into()), &backends, 1).unwrap();
        assert_eq!(map.get("tpp"), Some(&4));
        assert_eq!(map.get("emis"), Some(&1));
    }
}
