//! Pipeline run orchestration
//!
//! Resolves the pipeline to run, guards the run with the store's `running`
//! flag and drives stages and job groups through a [`JobRunner`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ci::artifacts::ArtifactSink;
use crate::ci::checker::ConfigChecker;
use crate::ci::config::PipelineConfig;
use crate::ci::connectors::ContainerEngine;
use crate::ci::executor::JobRunner;
use crate::ci::overrides::apply_overrides;
use crate::ci::pipeline::{
    JobLog, JobRecord, JobStatus, JobUpdate, PipelineInfo, RepoConfig, RepoKey, SessionDetail,
};
use crate::ci::yaml_parser::{self, DEFAULT_PIPELINE_FILE, PIPELINES_DIR};
use crate::domain::repositories::PipelineStore;
use crate::error::{AppError, Result};

use super::dry_run;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    /// Only consider pipeline files in the workspace, never stored pipelines.
    pub local: bool,
    pub yaml_output: bool,
    pub override_configs: Vec<String>,
    pub pipeline_name: Option<String>,
    pub file_path: Option<PathBuf>,
    /// Checked-out repository; copied into the run volume when set.
    pub workspace: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub pipeline_name: String,
    pub run_number: i64,
    pub status: PipelineStatus,
    /// Every job of the run, in planned order.
    pub jobs: Vec<JobLog>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    DryRun(String),
    Completed(RunSummary),
}

/// Where the pipeline being run came from.
enum PipelineSource {
    File { file_name: String },
    Store,
}

/// A job of the current run with its history record id.
struct PlannedJob {
    stage: String,
    job_name: String,
    job_run_id: String,
}

pub struct PipelineOrchestrator {
    store: Arc<dyn PipelineStore>,
    engine: Arc<dyn ContainerEngine>,
    sink: Arc<dyn ArtifactSink>,
    checker: ConfigChecker,
    max_parallel: usize,
    seed_image: String,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        engine: Arc<dyn ContainerEngine>,
        sink: Arc<dyn ArtifactSink>,
    ) -> Self {
        Self {
            store,
            engine,
            sink,
            checker: ConfigChecker::new(),
            max_parallel: crate::config::DEFAULT_MAX_PARALLEL_JOBS,
            seed_image: crate::config::DEFAULT_SEED_IMAGE.to_string(),
        }
    }

    /// Caps the number of containers running at once within a job group.
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_seed_image(mut self, image: impl Into<String>) -> Self {
        self.seed_image = image.into();
        self
    }

    pub async fn run_pipeline(
        &self,
        session: &SessionDetail,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        if options.pipeline_name.is_some() && options.file_path.is_some() {
            return Err(AppError::InvalidInvocation(
                "--pipeline and --file cannot be used together".to_string(),
            ));
        }

        let key = session.repo_key();
        let (base_config, source) = self.resolve_pipeline(&key, options).await?;
        let config = apply_overrides(&self.checker, &base_config, &options.override_configs)?;

        if options.dry_run {
            let rendered = if options.yaml_output {
                dry_run::format_yaml(&config)?
            } else {
                dry_run::format_plaintext(&config)
            };
            return Ok(RunOutcome::DryRun(rendered));
        }

        let pipeline_name = config.pipeline_name().to_string();
        if let PipelineSource::File { file_name } = &source {
            let info = PipelineInfo::new(file_name.clone(), &session.commit_hash, base_config);
            self.store
                .upsert_repo_pipelines(&RepoConfig::new(&key).with_pipeline(info))
                .await?;
        }

        let run_number = self
            .store
            .try_start_run(&key, &pipeline_name)
            .await?
            .ok_or_else(|| AppError::AlreadyRunning(pipeline_name.clone()))?;
        info!(
            pipeline = %pipeline_name,
            run = run_number,
            repo = %key,
            "▶️ Starting pipeline run"
        );

        let result = self
            .execute_run(session, &key, config, run_number, options, &cancel)
            .await;

        let finished = self.store.finish_run(&key, &pipeline_name).await;
        match (result, finished) {
            (Ok(summary), Ok(())) => {
                info!(
                    pipeline = %pipeline_name,
                    run = run_number,
                    status = ?summary.status,
                    "🏁 Pipeline run finished"
                );
                Ok(RunOutcome::Completed(summary))
            }
            (Ok(_), Err(e)) => {
                error!("❌ Failed to clear running flag of {}: {}", pipeline_name, e);
                Err(e)
            }
            (Err(e), finished) => {
                if let Err(clear) = finished {
                    error!("❌ Failed to clear running flag of {}: {}", pipeline_name, clear);
                }
                error!(pipeline = %pipeline_name, run = run_number, "❌ Pipeline run aborted: {}", e);
                Err(e)
            }
        }
    }

    async fn resolve_pipeline(
        &self,
        key: &RepoKey,
        options: &RunOptions,
    ) -> Result<(PipelineConfig, PipelineSource)> {
        if let Some(path) = &options.file_path {
            return self.load_file(&self.resolve_path(path, options));
        }

        if let Some(name) = &options.pipeline_name {
            if !options.local {
                if let Some(info) = self.store.get_pipeline_info(key, name).await? {
                    debug!("Using stored pipeline {}", name);
                    return Ok((info.pipeline_config, PipelineSource::Store));
                }
            }
            if let Some(workspace) = &options.workspace {
                let dir = workspace.join(PIPELINES_DIR);
                if dir.is_dir() {
                    let file = yaml_parser::parse_by_pipeline_name(name, &dir)?;
                    return self.load_file(&file.path);
                }
            }
            return Err(AppError::NotFound(format!(
                "pipeline '{}' for {}",
                name, key
            )));
        }

        if let Some(workspace) = &options.workspace {
            let default_path = yaml_parser::default_pipeline_path(workspace);
            if default_path.is_file() {
                return self.load_file(&default_path);
            }
        }
        if !options.local {
            if let Some(repo) = self.store.get_repo_config(key).await? {
                if let Some(info) = repo
                    .pipelines
                    .into_values()
                    .find(|info| info.pipeline_file_name == DEFAULT_PIPELINE_FILE)
                {
                    return Ok((info.pipeline_config, PipelineSource::Store));
                }
            }
        }

        Err(AppError::FileNotFound(format!(
            "{}/{}",
            PIPELINES_DIR, DEFAULT_PIPELINE_FILE
        )))
    }

    fn resolve_path(&self, path: &Path, options: &RunOptions) -> PathBuf {
        match &options.workspace {
            Some(workspace) if path.is_relative() && !path.exists() => workspace.join(path),
            _ => path.to_path_buf(),
        }
    }

    fn load_file(&self, path: &Path) -> Result<(PipelineConfig, PipelineSource)> {
        let document = yaml_parser::parse_file(path)?;
        let file_name = document
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| path.display().to_string());
        let label = document
            .pipeline_name()
            .map(str::to_string)
            .unwrap_or_else(|| file_name.clone());

        let config = self
            .checker
            .validate(&label, &document, Some(&file_name), true)
            .into_result()?;
        Ok((config, PipelineSource::File { file_name }))
    }

    async fn execute_run(
        &self,
        session: &SessionDetail,
        key: &RepoKey,
        config: PipelineConfig,
        run_number: i64,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let pipeline_name = config.pipeline_name().to_string();

        let mut planned = Vec::new();
        for (stage, job_name) in config.execution_order() {
            let allow_failure = config.jobs.get(job_name).map_or(false, |j| j.allow_failure);
            let record = JobRecord::new(
                &session.repo_url,
                run_number,
                stage,
                JobLog::pending(job_name, allow_failure, &config),
            );
            let job_run_id = self.store.insert_job(&record).await?;
            planned.push(PlannedJob {
                stage: stage.to_string(),
                job_name: job_name.to_string(),
                job_run_id,
            });
        }
        let ids: Vec<String> = planned.iter().map(|p| p.job_run_id.clone()).collect();
        self.store
            .append_job_history(key, &pipeline_name, &ids)
            .await?;

        let runner = JobRunner::new(
            self.engine.clone(),
            self.sink.clone(),
            &session.repo_name,
            config.clone(),
            run_number,
        )
        .await;
        let runner = match runner {
            Ok(runner) => runner,
            Err(e) => {
                self.cancel_jobs(&planned).await?;
                return Err(e);
            }
        };

        let result = self
            .run_stages(&runner, &config, &planned, run_number, options, cancel)
            .await;

        if let Err(e) = runner.teardown().await {
            warn!("⚠️ Failed to remove volume {}: {}", runner.volume_name(), e);
        }
        result
    }

    async fn run_stages(
        &self,
        runner: &JobRunner,
        config: &PipelineConfig,
        planned: &[PlannedJob],
        run_number: i64,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let ids: HashMap<&str, &str> = planned
            .iter()
            .map(|p| (p.job_name.as_str(), p.job_run_id.as_str()))
            .collect();
        let mut logs: HashMap<String, JobLog> = HashMap::new();
        let mut status = PipelineStatus::Success;

        if let Some(workspace) = &options.workspace {
            if let Err(e) = runner.seed_workspace(workspace, &self.seed_image).await {
                self.cancel_jobs(planned).await?;
                return Err(e);
            }
        }

        'stages: for (stage, plan) in &config.stages {
            info!(stage = %stage, run = run_number, "📋 Running stage");
            for group in &plan.job_groups {
                if cancel.is_cancelled() {
                    self.cancel_unfinished(planned, &logs).await?;
                    return Err(AppError::Cancelled);
                }

                let (group_logs, interrupted) = self
                    .run_group(runner, config, group, &ids, cancel)
                    .await?;

                let blocking = group_logs.iter().any(JobLog::is_blocking_failure);
                for log in group_logs {
                    if log.job_status == JobStatus::Failed && log.allow_failure {
                        warn!("⚠️ Job {} failed but is allowed to fail", log.job_name);
                    }
                    logs.insert(log.job_name.clone(), log);
                }

                if interrupted {
                    self.cancel_unfinished(planned, &logs).await?;
                    return Err(AppError::Cancelled);
                }
                if blocking {
                    error!(stage = %stage, "❌ Job failure stops the pipeline");
                    status = PipelineStatus::Failed;
                    break 'stages;
                }
            }
        }

        let cancelled = self.cancel_unfinished(planned, &logs).await?;
        let jobs = planned
            .iter()
            .map(|p| {
                logs.remove(&p.job_name)
                    .or_else(|| cancelled.iter().find(|l| l.job_name == p.job_name).cloned())
                    .unwrap_or_else(|| JobLog::pending(&p.job_name, false, config))
            })
            .collect();

        Ok(RunSummary {
            pipeline_name: config.pipeline_name().to_string(),
            run_number,
            status,
            jobs,
        })
    }

    /// Runs one job group concurrently. Returns the logs and whether the run was cancelled.
    async fn run_group(
        &self,
        runner: &JobRunner,
        config: &PipelineConfig,
        group: &[String],
        ids: &HashMap<&str, &str>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<JobLog>, bool)> {
        let now = Utc::now();
        for job_name in group {
            if let Some(id) = ids.get(job_name.as_str()) {
                self.store.update_job(id, &JobUpdate::started(now)).await?;
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let tasks = group.iter().filter_map(|job_name| {
            let job = config.jobs.get(job_name)?;
            let semaphore = semaphore.clone();
            Some(async move {
                let _permit = semaphore.acquire().await.ok();
                runner.run_job(job_name, job).await
            })
        });
        let all = join_all(tasks);
        tokio::pin!(all);

        let mut interrupted = false;
        let group_logs = tokio::select! {
            logs = &mut all => logs,
            _ = cancel.cancelled() => {
                warn!("🛑 Cancellation requested, stopping {} job(s)", group.len());
                interrupted = true;
                for job_name in group {
                    if let Err(e) = runner.stop_job(job_name).await {
                        warn!("⚠️ Failed to stop job {}: {}", job_name, e);
                    }
                }
                all.await
            }
        };

        for log in &group_logs {
            if let Some(id) = ids.get(log.job_name.as_str()) {
                self.store.update_job(id, &JobUpdate::from_log(log)).await?;
            }
        }
        Ok((group_logs, interrupted))
    }

    /// Marks every planned job without a final log as cancelled.
    async fn cancel_unfinished(
        &self,
        planned: &[PlannedJob],
        finished: &HashMap<String, JobLog>,
    ) -> Result<Vec<JobLog>> {
        let remaining: Vec<&PlannedJob> = planned
            .iter()
            .filter(|p| !finished.contains_key(&p.job_name))
            .collect();
        self.cancel_planned(&remaining).await
    }

    async fn cancel_jobs(&self, planned: &[PlannedJob]) -> Result<Vec<JobLog>> {
        let all: Vec<&PlannedJob> = planned.iter().collect();
        self.cancel_planned(&all).await
    }

    async fn cancel_planned(&self, jobs: &[&PlannedJob]) -> Result<Vec<JobLog>> {
        let now = Utc::now();
        let mut cancelled = Vec::with_capacity(jobs.len());
        for job in jobs {
            debug!("Cancelling {} ({})", job.job_name, job.stage);
            self.store
                .update_job(&job.job_run_id, &JobUpdate::cancelled(now))
                .await?;
            if let Some(record) = self.store.get_job(&job.job_run_id).await? {
                cancelled.push(record.log);
            }
        }
        Ok(cancelled)
    }
}
