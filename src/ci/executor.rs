//! Container job runner
//!
//! One runner exists per pipeline run. It owns a Docker volume shared by all
//! jobs of the run and starts one container per job on top of it.

use crate::ci::artifacts::{artifact_key, ArtifactSink};
use crate::ci::config::{JobConfig, PipelineConfig};
use crate::ci::connectors::{ContainerEngine, ContainerLogs, ContainerSpec};
use crate::ci::pipeline::{JobLog, JobStatus};
use crate::error::{AppError, Result};
use chrono::Utc;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Mount point of the run volume inside every job container.
pub const WORKSPACE_MOUNT: &str = "/app";

/// Job status derived from the container's stderr.
///
/// Exit codes are ignored: a job failed iff its stderr mentions `error` or `fatal`.
pub fn classify_status(stderr: &str) -> JobStatus {
    if stderr.contains("error") || stderr.contains("fatal") {
        JobStatus::Failed
    } else {
        JobStatus::Success
    }
}

/// Restricts `name` to the characters Docker accepts in volume and container names.
pub fn sanitize_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if !sanitized
        .chars()
        .next()
        .map_or(false, |c| c.is_ascii_alphanumeric())
    {
        sanitized.insert(0, 'x');
    }
    sanitized
}

pub struct JobRunner {
    engine: Arc<dyn ContainerEngine>,
    sink: Arc<dyn ArtifactSink>,
    config: PipelineConfig,
    volume: String,
    cancelled: Mutex<HashSet<String>>,
    torn_down: AtomicBool,
}

impl JobRunner {
    /// Creates the run volume `rustci-<repo>-<pipeline>-<run>`.
    pub async fn new(
        engine: Arc<dyn ContainerEngine>,
        sink: Arc<dyn ArtifactSink>,
        repo_name: &str,
        config: PipelineConfig,
        run_number: i64,
    ) -> Result<Self> {
        let volume = sanitize_name(&format!(
            "rustci-{}-{}-{}",
            repo_name,
            config.pipeline_name(),
            run_number
        ));
        engine.create_volume(&volume).await?;

        Ok(Self {
            engine,
            sink,
            config,
            volume,
            cancelled: Mutex::new(HashSet::new()),
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn volume_name(&self) -> &str {
        &self.volume
    }

    pub fn container_name(&self, job_name: &str) -> String {
        sanitize_name(&format!("{}-{}", self.volume, job_name))
    }

    /// Copies a checked-out workspace into the run volume.
    pub async fn seed_workspace(&self, source: &Path, image: &str) -> Result<()> {
        info!(
            "📂 Seeding volume {} from {}",
            self.volume,
            source.display()
        );
        self.engine.seed_volume(&self.volume, source, image).await
    }

    fn is_cancelled(&self, job_name: &str) -> bool {
        self.cancelled
            .lock()
            .map(|set| set.contains(job_name))
            .unwrap_or(false)
    }

    /// Runs one job to completion. Never fails: every problem ends up in the returned log.
    pub async fn run_job(&self, job_name: &str, job: &JobConfig) -> JobLog {
        let mut log = JobLog::pending(job_name, job.allow_failure, &self.config);
        log.start_time = Some(Utc::now());
        log.job_status = JobStatus::Running;

        if let Err(message) = validate_job(job) {
            warn!("⚠️ Job {} is not runnable: {}", job_name, message);
            log.job_status = JobStatus::Failed;
            log.job_logs = message;
            log.completion_time = Some(Utc::now());
            return log;
        }

        if self.is_cancelled(job_name) {
            log.job_status = JobStatus::Cancelled;
            log.completion_time = Some(Utc::now());
            return log;
        }

        let container = self.container_name(job_name);
        match self.execute(job_name, &container, job).await {
            Ok(logs) => {
                log.job_logs = logs.combined();
                log.job_status = if self.is_cancelled(job_name) {
                    JobStatus::Cancelled
                } else {
                    classify_status(&logs.stderr)
                };

                if let Err(e) = self.collect_artifacts(job_name, &container, job, log.job_status).await {
                    error!("❌ Artifact extraction failed for {}: {}", job_name, e);
                    log.job_status = JobStatus::Failed;
                    append_line(&mut log.job_logs, &format!("artifact extraction failed: {}", e));
                }
            }
            Err(e) => {
                error!("❌ Job {} failed in the container engine: {}", job_name, e);
                log.job_status = if self.is_cancelled(job_name) {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Failed
                };
                append_line(&mut log.job_logs, &e.to_string());
            }
        }

        if let Err(e) = self.engine.remove_container(&container).await {
            warn!("⚠️ Failed to remove container {}: {}", container, e);
        }

        log.completion_time = Some(Utc::now());
        info!(
            job = job_name,
            status = %log.job_status,
            "🏁 Job finished"
        );
        log
    }

    async fn execute(&self, job_name: &str, container: &str, job: &JobConfig) -> Result<ContainerLogs> {
        let spec = ContainerSpec {
            name: container.to_string(),
            image: job.docker.image_reference(),
            command: job.shell_command(),
            volume: self.volume.clone(),
            mount_path: WORKSPACE_MOUNT.to_string(),
            working_dir: WORKSPACE_MOUNT.to_string(),
        };

        info!("🚀 Starting job {} in {}", job_name, container);
        self.engine.run_container(&spec).await?;

        // A stop requested while the container was starting.
        if self.is_cancelled(job_name) {
            self.engine.stop_container(container).await?;
        }

        let exit_code = self.engine.wait_container(container).await?;
        debug!("Container {} exited with {}", container, exit_code);
        self.engine.container_logs(container).await
    }

    async fn collect_artifacts(
        &self,
        job_name: &str,
        container: &str,
        job: &JobConfig,
        status: JobStatus,
    ) -> Result<()> {
        let Some(artifacts) = &job.artifacts else {
            return Ok(());
        };
        let eligible = match status {
            JobStatus::Success => true,
            JobStatus::Failed => !artifacts.on_success_only,
            _ => false,
        };
        if !eligible {
            debug!("Skipping artifacts of {} ({})", job_name, status);
            return Ok(());
        }

        let upload_path = job
            .artifact_upload_path
            .as_deref()
            .unwrap_or(&self.config.global.artifact_upload_path);

        for path in &artifacts.paths {
            let source = if path.starts_with('/') {
                path.clone()
            } else {
                format!("{}/{}", WORKSPACE_MOUNT, path.trim_start_matches("./"))
            };
            let bytes = self.engine.copy_from_container(container, &source).await?;
            let key = artifact_key(upload_path, &self.volume, job_name, path);
            self.sink.put(&key, bytes).await?;
        }
        Ok(())
    }

    /// Stops a running job. The job's log will report `cancelled`.
    pub async fn stop_job(&self, job_name: &str) -> Result<()> {
        let first = self
            .cancelled
            .lock()
            .map(|mut set| set.insert(job_name.to_string()))
            .map_err(|_| AppError::ContainerError("runner state poisoned".to_string()))?;
        if first {
            info!("🛑 Stopping job {}", job_name);
        }
        self.engine.stop_container(&self.container_name(job_name)).await
    }

    /// Removes the run volume. Calling it again is a no-op.
    pub async fn teardown(&self) -> Result<()> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.engine.remove_volume(&self.volume).await
    }
}

impl Drop for JobRunner {
    fn drop(&mut self) {
        if self.torn_down.load(Ordering::SeqCst) {
            return;
        }
        let engine = self.engine.clone();
        let volume = self.volume.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("⚠️ Runner dropped without teardown, removing {}", volume);
                handle.spawn(async move {
                    if let Err(e) = engine.remove_volume(&volume).await {
                        error!("❌ Failed to remove volume {}: {}", volume, e);
                    }
                });
            }
            Err(_) => error!("❌ Volume {} leaked: no runtime to remove it", volume),
        }
    }
}

fn validate_job(job: &JobConfig) -> std::result::Result<(), String> {
    if job.scripts.is_empty() {
        return Err("job has no scripts".to_string());
    }
    if job.docker.image.is_empty() {
        return Err("job has no docker image".to_string());
    }
    if let Some(artifacts) = &job.artifacts {
        if artifacts.paths.is_empty() {
            return Err("artifacts declare no paths".to_string());
        }
        if job
            .artifact_upload_path
            .as_deref()
            .map_or(true, str::is_empty)
        {
            return Err("artifacts declared without an artifact_upload_path".to_string());
        }
    }
    Ok(())
}

fn append_line(logs: &mut String, line: &str) {
    if !logs.is_empty() && !logs.ends_with('\n') {
        logs.push('\n');
    }
    logs.push_str(line);
}
