use async_trait::async_trait;

use crate::ci::pipeline::{
    HistoryQuery, JobRecord, JobUpdate, PipelineInfo, RepoConfig, RepoKey, SessionDetail,
};
use crate::error::Result;

/// Storage for sessions, repository pipelines and job history.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Creates or replaces the session of `session.user_id`.
    async fn upsert_session(&self, session: &SessionDetail) -> Result<()>;

    async fn get_session(&self, user_id: &str) -> Result<Option<SessionDetail>>;

    /// Creates the repository if needed and writes every pipeline in `repo`.
    ///
    /// Pipelines already stored keep their `running`, `run_count` and
    /// `job_run_history`; pipelines not mentioned in `repo` are left as they are.
    async fn upsert_repo_pipelines(&self, repo: &RepoConfig) -> Result<()>;

    async fn get_repo_config(&self, key: &RepoKey) -> Result<Option<RepoConfig>>;

    async fn get_pipeline_info(
        &self,
        key: &RepoKey,
        pipeline_name: &str,
    ) -> Result<Option<PipelineInfo>>;

    /// Replaces a stored pipeline if its `running` flag equals `expected_running`.
    ///
    /// Returns `false` when the pipeline is missing or the flag did not match.
    async fn update_pipeline_info(
        &self,
        key: &RepoKey,
        pipeline_name: &str,
        info: &PipelineInfo,
        expected_running: bool,
    ) -> Result<bool>;

    /// Atomically flips `running` from false to true and allocates the next run number.
    ///
    /// Returns `None` if the pipeline is already running and `NotFound` if it
    /// does not exist.
    async fn try_start_run(&self, key: &RepoKey, pipeline_name: &str) -> Result<Option<i64>>;

    /// Clears `running`.
    async fn finish_run(&self, key: &RepoKey, pipeline_name: &str) -> Result<()>;

    async fn append_job_history(
        &self,
        key: &RepoKey,
        pipeline_name: &str,
        job_run_ids: &[String],
    ) -> Result<()>;

    /// Stores a new job record, rejecting a second record for the same
    /// repository, pipeline, run number and job.
    async fn insert_job(&self, record: &JobRecord) -> Result<String>;

    async fn update_job(&self, job_run_id: &str, update: &JobUpdate) -> Result<()>;

    async fn get_job(&self, job_run_id: &str) -> Result<Option<JobRecord>>;

    async fn delete_job(&self, job_run_id: &str) -> Result<()>;

    /// Job records reachable from the matching pipelines' run history,
    /// ordered by run number then planned execution order.
    async fn query_history(&self, query: &HistoryQuery) -> Result<Vec<JobRecord>>;
}

/// Orders `records` by run number, keeping the relative order of `history`
/// within a run.
pub fn order_by_history(history: &[String], mut records: Vec<JobRecord>) -> Vec<JobRecord> {
    let position: std::collections::HashMap<&str, usize> = history
        .iter()
        .enumerate()
        .map(|(idx, id)| (id.as_str(), idx))
        .collect();
    records.sort_by_key(|record| {
        (
            record.run_number,
            position.get(record.id.as_str()).copied().unwrap_or(usize::MAX),
        )
    });
    records
}
