//! Thin adapter over the `docker` CLI.
//!
//! Containers are labelled `job-runner` plus `jobrunner-job=<job_id>`;
//! labels are the only identifier used for lookup.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;

use super::ExecutorError;

/// Label applied to every object we create, so strays can be found.
pub const MANAGED_LABEL: &str = "job-runner";
/// Label carrying the owning job id.
pub const JOB_LABEL_KEY: &str = "jobrunner-job";

/// Subset of `docker inspect` output we care about.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerMetadata {
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "State")]
    pub state: ContainerState,
    #[serde(rename = "Config", default)]
    pub config: ContainerConfig,
    #[serde(rename = "HostConfig", default)]
    pub host_config: HostConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerState {
    #[serde(rename = "Running")]
    pub running: bool,
    #[serde(rename = "ExitCode")]
    pub exit_code: i64,
    #[serde(rename = "OOMKilled", default)]
    pub oom_killed: bool,
    #[serde(rename = "StartedAt", default)]
    pub started_at: String,
    #[serde(rename = "FinishedAt", default)]
    pub finished_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Labels", default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostConfig {
    #[serde(rename = "Memory", default)]
    pub memory: i64,
}

/// Options for starting a job container.
#[derive(Debug, Clone)]
pub struct RunSpec<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub args: &'a [String],
    pub env: &'a BTreeMap<String, String>,
    pub volume: (&'a Path, &'a str),
    pub labels: BTreeMap<String, String>,
    pub cpu_count: Option<f64>,
    pub memory_limit: Option<&'a str>,
    pub allow_network_access: bool,
}

async fn docker(args: &[&str], env: &BTreeMap<String, String>) -> Result<String, ExecutorError> {
    let output = Command::new("docker")
        .args(args)
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ExecutorError::Docker(format!("could not run docker: {e}")))?;
    if !output.status.success() {
        return Err(ExecutorError::Docker(format!(
            "docker {} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr).trim(),
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub async fn image_exists(image: &str) -> bool {
    docker(&["image", "inspect", image], &BTreeMap::new())
        .await
        .is_ok()
}

pub async fn pull(image: &str) -> Result<(), ExecutorError> {
    docker(&["pull", "--quiet", image], &BTreeMap::new()).await?;
    Ok(())
}

/// Start a container detached. Returns once the container exists.
pub async fn run(spec: RunSpec<'_>) -> Result<(), ExecutorError> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "--detach".into(),
        "--init".into(),
        format!("--name={}", spec.name),
        format!("--label={MANAGED_LABEL}"),
        "--workdir=/workspace".into(),
    ];
    for (key, value) in &spec.labels {
        args.push(format!("--label={key}={value}"));
    }
    let (host_dir, mount_point) = spec.volume;
    args.push(format!("--volume={}:{}", host_dir.display(), mount_point));
    for key in spec.env.keys() {
        args.push(format!("--env={key}"));
    }
    if let Some(cpus) = spec.cpu_count {
        args.push(format!("--cpus={cpus}"));
    }
    if let Some(memory) = spec.memory_limit {
        args.push(format!("--memory={memory}"));
    }
    if !spec.allow_network_access {
        args.push("--network=none".into());
    }
    args.push(spec.image.to_string());
    args.extend(spec.args.iter().cloned());

    let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    docker(&arg_refs, spec.env).await?;
    Ok(())
}

/// Inspect a container, returning None if it does not exist.
pub async fn container_inspect(name: &str) -> Result<Option<ContainerMetadata>, ExecutorError> {
    let output = Command::new("docker")
        .args(["container", "inspect", name])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ExecutorError::Docker(format!("could not run docker: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.to_lowercase().contains("no such") {
            return Ok(None);
        }
        return Err(ExecutorError::Docker(format!(
            "docker inspect failed: {}",
            stderr.trim()
        )));
    }
    let parsed: Vec<ContainerMetadata> = serde_json::from_slice(&output.stdout)
        .map_err(|e| ExecutorError::Docker(format!("could not parse inspect output: {e}")))?;
    Ok(parsed.into_iter().next())
}

pub async fn kill(name: &str) -> Result<(), ExecutorError> {
    match docker(&["kill", name], &BTreeMap::new()).await {
        Ok(_) => Ok(()),
        // Killing an already-gone container is not an error
        Err(ExecutorError::Docker(message))
            if message.contains("No such") || message.contains("no such") || message.contains("is not running") =>
        {
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Remove a container if it exists. Idempotent.
pub async fn delete_container(name: &str) -> Result<(), ExecutorError> {
    match docker(&["rm", "--force", name], &BTreeMap::new()).await {
        Ok(_) => Ok(()),
        Err(ExecutorError::Docker(message))
            if message.contains("No such") || message.contains("no such") =>
        {
            Ok(())
        }
        Err(err) => Err(err),
    }
}

pub async fn logs(name: &str) -> Result<String, ExecutorError> {
    let output = Command::new("docker")
        .args(["logs", "--timestamps", name])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ExecutorError::Docker(format!("could not run docker: {e}")))?;
    // docker logs interleaves the container's stdout and stderr
    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(combined)
}

/// Run a short-lived container to completion and return its stdout.
pub async fn run_capture(
    image: &str,
    args: &[&str],
    env: &BTreeMap<String, String>,
    network: Option<&str>,
) -> Result<String, ExecutorError> {
    let mut run_args: Vec<String> = vec!["run".into(), "--rm".into()];
    for key in env.keys() {
        run_args.push(format!("--env={key}"));
    }
    if let Some(network) = network {
        run_args.push(format!("--network={network}"));
    }
    run_args.push(image.to_string());
    run_args.extend(args.iter().map(|a| a.to_string()));
    let arg_refs: Vec<&str> = run_args.iter().map(|s| s.as_str()).collect();
    docker(&arg_refs, env).await
}

/// Parse a docker RFC3339 timestamp into integer nanoseconds. Docker uses
/// `0001-01-01T00:00:00Z` as its null value.
pub fn timestamp_ns(value: &str) -> Option<i64> {
    if value.is_empty() || value.starts_with("0001-") {
        return None;
    }
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .and_then(|dt| dt.timestamp_nanos_opt())
}
