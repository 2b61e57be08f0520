//! Docker-backed executor.
//!
//! Volumes are host directories bind-mounted at `/workspace`. Finalized job
//! state lives in a per-job metadata file in the log directory; the rest of
//! the state is derived from docker itself, so the agent can be restarted at
//! any point and rediscover where it was.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use globset::{Glob, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::AgentConfig;
use crate::models::{now_ns, now_secs, Privacy};
use crate::schema::{JobDefinition, JobTaskResults, TaskError, TaskStage};

use super::docker::{self, ContainerMetadata, RunSpec};
use super::{Executor, ExecutorError, JobStatus};

const METADATA_FILE: &str = "metadata.json";
const MANIFEST_FILE: &str = "manifest.json";
const LOGS_FILE: &str = "logs.txt";
/// Directory inside the workspace where per-action logs are copied.
const METADATA_DIR: &str = "metadata";
/// Marker file written at the end of prepare; its presence distinguishes a
/// prepared volume from one that is still being populated.
const TIMESTAMP_REFERENCE_FILE: &str = ".jobrunner-timestamp";

/// File types allowed in moderately sensitive storage, where files are
/// reviewed for release.
const LEVEL4_FILE_TYPES: &[&str] = &["csv", "tsv", "txt", "log", "json", "md", "html", "svg", "png"];
const LEVEL4_MAX_FILESIZE: u64 = 16 * 1024 * 1024;

const DB_PROBE_IMAGE: &str = "ghcr.io/opensafely-core/tpp-database-utils";

pub fn container_name(job_id: &str) -> String {
    format!("os-job-{job_id}")
}

pub struct LocalDockerExecutor {
    config: AgentConfig,
}

impl LocalDockerExecutor {
    pub fn new(config: AgentConfig) -> Self {
        LocalDockerExecutor { config }
    }

    fn volume_dir(&self, job_id: &str) -> PathBuf {
        self.config.volumes_dir().join(job_id)
    }

    fn workspace_dir(&self, workspace: &str) -> PathBuf {
        self.config.workspaces_dir().join(workspace)
    }

    fn medium_privacy_dir(&self, workspace: &str) -> PathBuf {
        self.config.medium_privacy_workspaces_dir().join(workspace)
    }

    /// Log directories are split by month to keep them manageable.
    fn new_log_dir(&self, job_id: &str) -> PathBuf {
        let month = Utc::now().format("%Y-%m").to_string();
        self.config
            .logs_dir()
            .join(month)
            .join(container_name(job_id))
    }

    /// Find the metadata file for a job, which may have completed in an
    /// earlier month.
    fn find_metadata_path(&self, job_id: &str) -> Option<PathBuf> {
        let logs_dir = self.config.logs_dir();
        let entries = std::fs::read_dir(&logs_dir).ok()?;
        for entry in entries.flatten() {
            let candidate = entry
                .path()
                .join(container_name(job_id))
                .join(METADATA_FILE);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    fn read_metadata(&self, job: &JobDefinition) -> Option<JobMetadata> {
        let path = self.find_metadata_path(&job.id)?;
        let raw = std::fs::read_to_string(path).ok()?;
        let metadata: JobMetadata = serde_json::from_str(&raw).ok()?;
        // Metadata written by a superseded task does not count: the new task
        // must run the job again from scratch.
        if metadata.task_id != job.task_id {
            return None;
        }
        Some(metadata)
    }

    async fn checkout_commit(&self, job: &JobDefinition, dest: &Path) -> Result<(), ExecutorError> {
        let repos_dir = self.config.repos_dir();
        std::fs::create_dir_all(&repos_dir)?;
        let repo_name = job
            .repo_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("repo");
        let mirror = repos_dir.join(format!("{repo_name}.git"));

        if mirror.exists() {
            // A partial cache is fine; fetch whatever the remote has now
            git(&[
                "-C",
                path_str(&mirror),
                "fetch",
                "--force",
                &job.repo_url,
                "+refs/heads/*:refs/heads/*",
            ])
            .await?;
        } else {
            git(&["clone", "--mirror", &job.repo_url, path_str(&mirror)]).await?;
        }

        git(&[
            "--git-dir",
            path_str(&mirror),
            "--work-tree",
            path_str(dest),
            "checkout",
            "--force",
            &job.commit,
            "--",
            ".",
        ])
        .await
        .map_err(|_| ExecutorError::Prep {
            message: format!(
                "Could not checkout commit {} from {}",
                job.commit, job.repo_url
            ),
            retryable: false,
        })?;
        Ok(())
    }

    fn stage_inputs(&self, job: &JobDefinition, volume: &Path) -> Result<(), ExecutorError> {
        let workspace_dir = self.workspace_dir(&job.workspace);
        for input_job_id in &job.input_job_ids {
            let Some(metadata) = self.read_any_metadata(input_job_id) else {
                return Err(ExecutorError::Prep {
                    message: format!("No metadata found for dependency job {input_job_id}"),
                    retryable: false,
                });
            };
            for filename in metadata.outputs.keys() {
                let src = workspace_dir.join(filename);
                if !src.exists() {
                    return Err(ExecutorError::Prep {
                        message: format!(
                            "The file {filename} doesn't exist in workspace {} as requested for job {}",
                            job.workspace, job.id
                        ),
                        retryable: false,
                    });
                }
                let dst = volume.join(filename);
                copy_file(&src, &dst)?;
            }
        }
        Ok(())
    }

    /// Like [`read_metadata`] but for dependency jobs, where we accept
    /// whichever task finalized them.
    fn read_any_metadata(&self, job_id: &str) -> Option<JobMetadata> {
        let path = self.find_metadata_path(job_id)?;
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn match_outputs(
        &self,
        job: &JobDefinition,
        volume: &Path,
    ) -> Result<(BTreeMap<String, Privacy>, Vec<String>, Vec<String>), ExecutorError> {
        let mut files = Vec::new();
        walk_files(volume, volume, &mut files)?;
        files.retain(|f| {
            f != TIMESTAMP_REFERENCE_FILE && !f.starts_with(&format!("{METADATA_DIR}/"))
        });

        let mut outputs = BTreeMap::new();
        let mut unmatched_patterns = Vec::new();
        let mut matched: Vec<bool> = vec![false; files.len()];
        for (pattern, privacy) in &job.output_spec {
            let glob = Glob::new(pattern)
                .map_err(|e| ExecutorError::Other(format!("invalid output pattern: {e}")))?;
            let set = GlobSetBuilder::new().add(glob).build().map_err(|e| {
                ExecutorError::Other(format!("invalid output pattern: {e}"))
            })?;
            let mut any = false;
            for (index, file) in files.iter().enumerate() {
                if set.is_match(file) {
                    outputs.insert(file.clone(), *privacy);
                    matched[index] = true;
                    any = true;
                }
            }
            if !any {
                unmatched_patterns.push(pattern.clone());
            }
        }
        let unmatched_outputs: Vec<String> = files
            .iter()
            .zip(&matched)
            .filter(|(_, matched)| !**matched)
            .map(|(file, _)| file.clone())
            .collect();
        Ok((outputs, unmatched_patterns, unmatched_outputs))
    }

    /// Copy outputs into long-term storage. Moderately sensitive files that
    /// fail the release checks are excluded and recorded.
    fn persist_outputs(
        &self,
        job: &JobDefinition,
        volume: &Path,
        outputs: &BTreeMap<String, Privacy>,
    ) -> Result<BTreeMap<String, String>, ExecutorError> {
        let workspace_dir = self.workspace_dir(&job.workspace);
        let medium_dir = self.medium_privacy_dir(&job.workspace);
        let mut excluded = BTreeMap::new();

        for (filename, privacy) in outputs {
            let src = volume.join(filename);
            copy_file(&src, &workspace_dir.join(filename))?;

            if *privacy == Privacy::ModeratelySensitive {
                if let Some(reason) = level4_excluded_reason(&src, filename)? {
                    excluded.insert(filename.clone(), reason);
                    continue;
                }
                copy_file(&src, &medium_dir.join(filename))?;
            }
        }
        Ok(excluded)
    }

    async fn write_log_bundle(
        &self,
        job: &JobDefinition,
        metadata: &JobMetadata,
        copy_log_to_workspace: bool,
    ) -> Result<(), ExecutorError> {
        let log_dir = self.new_log_dir(&job.id);
        std::fs::create_dir_all(&log_dir)?;

        let container_logs = docker::logs(&container_name(job.id.as_str()))
            .await
            .unwrap_or_default();
        std::fs::write(log_dir.join(LOGS_FILE), &container_logs)?;
        std::fs::write(
            log_dir.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&metadata.outputs)
                .map_err(|e| ExecutorError::Other(e.to_string()))?,
        )?;
        std::fs::write(
            log_dir.join(METADATA_FILE),
            serde_json::to_string_pretty(metadata)
                .map_err(|e| ExecutorError::Other(e.to_string()))?,
        )?;

        if copy_log_to_workspace {
            let log_name = format!("{}.log", job.action);
            let workspace_log = self
                .workspace_dir(&job.workspace)
                .join(METADATA_DIR)
                .join(&log_name);
            copy_file(&log_dir.join(LOGS_FILE), &workspace_log)?;
            copy_file(
                &workspace_log,
                &self
                    .medium_privacy_dir(&job.workspace)
                    .join(METADATA_DIR)
                    .join(&log_name),
            )?;
        }
        Ok(())
    }
}

impl Executor for LocalDockerExecutor {
    async fn prepare(&self, job: &JobDefinition) -> Result<JobStatus, ExecutorError> {
        let current = self.get_status(job).await?;
        if current.stage != TaskStage::Unknown {
            return Ok(current);
        }

        if !docker::image_exists(&job.image).await {
            tracing::info!(image = %job.image, "Image not found locally, pulling");
            docker::pull(&job.image).await.map_err(|_| ExecutorError::Prep {
                message: format!("Docker image {} is not currently available", job.image),
                retryable: true,
            })?;
        }

        let volume = self.volume_dir(&job.id);
        std::fs::create_dir_all(&volume)?;
        self.checkout_commit(job, &volume).await?;
        self.stage_inputs(job, &volume)?;
        std::fs::write(volume.join(TIMESTAMP_REFERENCE_FILE), now_ns().to_string())?;

        self.get_status(job).await
    }

    async fn execute(&self, job: &JobDefinition) -> Result<JobStatus, ExecutorError> {
        let current = self.get_status(job).await?;
        if current.stage != TaskStage::Prepared {
            return Ok(current);
        }

        let name = container_name(&job.id);
        let volume = self.volume_dir(&job.id);
        let labels = BTreeMap::from([
            (docker::JOB_LABEL_KEY.to_string(), job.id.clone()),
            ("workspace".to_string(), job.workspace.clone()),
            ("action".to_string(), job.action.clone()),
        ]);
        docker::run(RunSpec {
            name: &name,
            image: &job.image,
            args: &job.args,
            env: &job.env,
            volume: (&volume, "/workspace"),
            labels,
            cpu_count: job.cpu_count,
            memory_limit: job.memory_limit.as_deref(),
            allow_network_access: job.allow_database_access,
        })
        .await?;

        self.get_status(job).await
    }

    async fn finalize(
        &self,
        job: &JobDefinition,
        cancelled: bool,
        error: Option<TaskError>,
    ) -> Result<JobStatus, ExecutorError> {
        let current = self.get_status(job).await?;
        if matches!(current.stage, TaskStage::Finalized | TaskStage::Error) {
            return Ok(current);
        }
        // A job that never started only gets finalized to record its
        // cancelled or errored state.
        if current.stage == TaskStage::Unknown && !cancelled && error.is_none() {
            return Ok(current);
        }

        let container = docker::container_inspect(&container_name(&job.id)).await?;
        let volume = self.volume_dir(&job.id);

        let (outputs, unmatched_patterns, unmatched_outputs) = if cancelled || error.is_some() {
            (BTreeMap::new(), Vec::new(), Vec::new())
        } else {
            self.match_outputs(job, &volume)?
        };

        let (status_message, hint) = finalize_message(
            &container,
            cancelled,
            error.as_ref(),
            &unmatched_patterns,
            &unmatched_outputs,
        );

        let mut metadata = JobMetadata {
            job_id: job.id.clone(),
            job_request_id: job.job_request_id.clone(),
            task_id: job.task_id.clone(),
            workspace: job.workspace.clone(),
            action: job.action.clone(),
            commit: job.commit.clone(),
            database_name: job.database_name.clone(),
            created_at: job.created_at,
            completed_at: now_secs(),
            exit_code: container.as_ref().map(|c| c.state.exit_code),
            image_id: container.as_ref().map(|c| c.image.clone()),
            oom_killed: container.as_ref().is_some_and(|c| c.state.oom_killed),
            status_message,
            hint,
            timestamp_ns: now_ns(),
            outputs,
            unmatched_patterns,
            unmatched_outputs,
            level4_excluded_files: BTreeMap::new(),
            cancelled,
            error,
        };

        if !cancelled && metadata.error.is_none() {
            metadata.level4_excluded_files =
                self.persist_outputs(job, &volume, &metadata.outputs)?;
            self.write_log_bundle(job, &metadata, true).await?;
        } else {
            // No outputs to persist; keep the logs and the record of why
            self.write_log_bundle(job, &metadata, false).await?;
        }

        self.get_status(job).await
    }

    async fn terminate(&self, job: &JobDefinition) -> Result<JobStatus, ExecutorError> {
        let current = self.get_status(job).await?;
        if current.stage == TaskStage::Executing {
            docker::kill(&container_name(&job.id)).await?;
        }
        self.get_status(job).await
    }

    async fn cleanup(&self, job: &JobDefinition) -> Result<JobStatus, ExecutorError> {
        if self.config.keep_containers {
            tracing::info!(job_id = %job.id, "Leaving container and volume in place");
            return self.get_status(job).await;
        }
        docker::delete_container(&container_name(&job.id)).await?;
        let volume = self.volume_dir(&job.id);
        if volume.exists() {
            std::fs::remove_dir_all(&volume)?;
        }
        self.get_status(job).await
    }

    async fn get_status(&self, job: &JobDefinition) -> Result<JobStatus, ExecutorError> {
        if let Some(metadata) = self.read_metadata(job) {
            let stage = if metadata.error.is_some() {
                TaskStage::Error
            } else {
                TaskStage::Finalized
            };
            return Ok(JobStatus {
                stage,
                exit_code: metadata.exit_code,
                timestamp_ns: Some(metadata.timestamp_ns),
                results: Some(metadata.to_results()),
            });
        }

        if let Some(container) = docker::container_inspect(&container_name(&job.id)).await? {
            if container.state.running {
                return Ok(JobStatus {
                    stage: TaskStage::Executing,
                    exit_code: None,
                    timestamp_ns: docker::timestamp_ns(&container.state.started_at),
                    results: None,
                });
            }
            return Ok(JobStatus {
                stage: TaskStage::Executed,
                exit_code: Some(container.state.exit_code),
                timestamp_ns: docker::timestamp_ns(&container.state.finished_at),
                results: None,
            });
        }

        let volume = self.volume_dir(&job.id);
        let marker = volume.join(TIMESTAMP_REFERENCE_FILE);
        if marker.exists() {
            let timestamp_ns = std::fs::read_to_string(&marker)
                .ok()
                .and_then(|raw| raw.trim().parse().ok());
            return Ok(JobStatus {
                stage: TaskStage::Prepared,
                exit_code: None,
                timestamp_ns,
                results: None,
            });
        }

        Ok(JobStatus::new(TaskStage::Unknown))
    }

    async fn db_status(&self, database_name: &str) -> Result<String, ExecutorError> {
        let Some(database_url) = self.config.database_urls.get(database_name) else {
            return Err(ExecutorError::Other(format!(
                "Database name '{database_name}' is not defined for backend '{}'",
                self.config.backend
            )));
        };
        let env = BTreeMap::from([("DATABASE_URL".to_string(), database_url.clone())]);
        let stdout = docker::run_capture(
            DB_PROBE_IMAGE,
            &["in_maintenance_mode"],
            &env,
            None,
        )
        .await?;
        let last_line = stdout.lines().last().unwrap_or("").trim().to_string();
        // Restrict what the probe can report so a compromised status-check
        // container cannot exfiltrate data through this channel.
        if !last_line.is_empty() && last_line != crate::schema::DB_MAINTENANCE_STATUS {
            return Err(ExecutorError::Other(format!(
                "Invalid status '{last_line}' from maintenance probe"
            )));
        }
        Ok(last_line)
    }
}

/// Everything we know about a finished job, written beside its logs. The
/// presence of this file is what makes a job FINALIZED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub job_id: String,
    pub job_request_id: String,
    pub task_id: String,
    pub workspace: String,
    pub action: String,
    pub commit: String,
    pub database_name: Option<String>,
    pub created_at: i64,
    pub completed_at: i64,
    pub exit_code: Option<i64>,
    pub image_id: Option<String>,
    pub oom_killed: bool,
    pub status_message: String,
    pub hint: Option<String>,
    pub timestamp_ns: i64,
    pub outputs: BTreeMap<String, Privacy>,
    pub unmatched_patterns: Vec<String>,
    pub unmatched_outputs: Vec<String>,
    pub level4_excluded_files: BTreeMap<String, String>,
    pub cancelled: bool,
    pub error: Option<TaskError>,
}

impl JobMetadata {
    /// The redacted results sent to the controller: counts and booleans
    /// only, never filenames. Messages mentioning filenames are blanked.
    pub fn to_results(&self) -> JobTaskResults {
        let has_unmatched =
            !self.unmatched_patterns.is_empty() || !self.unmatched_outputs.is_empty();
        JobTaskResults {
            exit_code: self.exit_code,
            image_id: self.image_id.clone(),
            status_message: if has_unmatched {
                None
            } else {
                Some(self.status_message.clone())
            },
            hint: if has_unmatched { None } else { self.hint.clone() },
            timestamp_ns: Some(self.timestamp_ns),
            output_count: self.outputs.len() as u64,
            has_unmatched_patterns: !self.unmatched_patterns.is_empty(),
            has_level4_excluded_files: !self.level4_excluded_files.is_empty(),
            cancelled: self.cancelled,
            error: self.error.clone(),
        }
    }
}

fn finalize_message(
    container: &Option<ContainerMetadata>,
    cancelled: bool,
    error: Option<&TaskError>,
    unmatched_patterns: &[String],
    unmatched_outputs: &[String],
) -> (String, Option<String>) {
    if let Some(error) = error {
        return (format!("Job errored: {}", error.message), None);
    }
    let Some(container) = container else {
        return ("Job cancelled by system".to_string(), None);
    };
    let exit_code = container.state.exit_code;

    if exit_code == 137 && cancelled {
        return ("Job cancelled by system".to_string(), None);
    }
    // Nb. the OOMKilled flag has been observed to be unreliable on some
    // kernel versions
    if exit_code == 137 && container.state.oom_killed {
        let mut message = "Job ran out of memory".to_string();
        if container.host_config.memory > 0 {
            let gb = container.host_config.memory as f64 / (1024f64 * 1024.0 * 1024.0);
            message.push_str(&format!(" (limit was {gb:.2}GB)"));
        }
        return (message, None);
    }
    if cancelled {
        return ("Job cancelled by system".to_string(), None);
    }
    if exit_code != 0 {
        return (format!("Job exited with error code {exit_code}"), None);
    }
    if !unmatched_patterns.is_empty() {
        let message = format!(
            "No outputs found matching patterns:\n - {}",
            unmatched_patterns.join("\n - ")
        );
        let hint = if unmatched_outputs.is_empty() {
            None
        } else {
            Some(format!(
                "Did you mean to match one of these files instead?\n - {}",
                unmatched_outputs.join("\n - ")
            ))
        };
        return (message, hint);
    }
    ("Completed successfully".to_string(), None)
}

fn level4_excluded_reason(path: &Path, filename: &str) -> Result<Option<String>, ExecutorError> {
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    if !LEVEL4_FILE_TYPES.contains(&extension.as_str()) {
        return Ok(Some(format!(
            "File type '{extension}' is not allowed in moderately sensitive storage"
        )));
    }
    let size = std::fs::metadata(path)?.len();
    if size > LEVEL4_MAX_FILESIZE {
        return Ok(Some(format!(
            "File size {size} exceeds the {LEVEL4_MAX_FILESIZE} byte limit"
        )));
    }
    Ok(None)
}

fn walk_files(root: &Path, dir: &Path, files: &mut Vec<String>) -> Result<(), ExecutorError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_files(root, &path, files)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            files.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

fn copy_file(src: &Path, dst: &Path) -> Result<u64, ExecutorError> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(std::fs::copy(src, dst)?)
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_default()
}

async fn git(args: &[&str]) -> Result<(), ExecutorError> {
    let output = Command::new("git")
        .args(args)
        .output()
        .await
        .map_err(|e| ExecutorError::Other(format!("could not run git: {e}")))?;
    if !output.status.success() {
        return Err(ExecutorError::Prep {
            message: format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            retryable: true,
        });
    }
    Ok(())
}
