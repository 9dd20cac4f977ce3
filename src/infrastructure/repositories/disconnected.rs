use async_trait::async_trait;

use crate::{
    ci::pipeline::{
        HistoryQuery, JobRecord, JobUpdate, PipelineInfo, RepoConfig, RepoKey, SessionDetail,
    },
    domain::repositories::PipelineStore,
    error::{AppError, Result},
};

/// Store used when no database is reachable. Every operation fails.
pub struct DisconnectedStore {
    reason: String,
}

impl DisconnectedStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn unavailable<T>(&self) -> Result<T> {
        Err(AppError::DatabaseError(format!(
            "pipeline store unavailable: {}",
            self.reason
        )))
    }
}

#[async_trait]
impl PipelineStore for DisconnectedStore {
    async fn upsert_session(&self, _session: &SessionDetail) -> Result<()> {
        self.unavailable()
    }

    async fn get_session(&self, _user_id: &str) -> Result<Option<SessionDetail>> {
        self.unavailable()
    }

    async fn upsert_repo_pipelines(&self, _repo: &RepoConfig) -> Result<()> {
        self.unavailable()
    }

    async fn get_repo_config(&self, _key: &RepoKey) -> Result<Option<RepoConfig>> {
        self.unavailable()
    }

    async fn get_pipeline_info(
        &self,
        _key: &RepoKey,
        _pipeline_name: &str,
    ) -> Result<Option<PipelineInfo>> {
        self.unavailable()
    }

    async fn update_pipeline_info(
        &self,
        _key: &RepoKey,
        _pipeline_name: &str,
        _info: &PipelineInfo,
        _expected_running: bool,
    ) -> Result<bool> {
        self.unavailable()
    }

    async fn try_start_run(&self, _key: &RepoKey, _pipeline_name: &str) -> Result<Option<i64>> {
        self.unavailable()
    }

    async fn finish_run(&self, _key: &RepoKey, _pipeline_name: &str) -> Result<()> {
        self.unavailable()
    }

    async fn append_job_history(
        &self,
        _key: &RepoKey,
        _pipeline_name: &str,
        _job_run_ids: &[String],
    ) -> Result<()> {
        self.unavailable()
    }

    async fn insert_job(&self, _record: &JobRecord) -> Result<String> {
        self.unavailable()
    }

    async fn update_job(&self, _job_run_id: &str, _update: &JobUpdate) -> Result<()> {
        self.unavailable()
    }

    async fn get_job(&self, _job_run_id: &str) -> Result<Option<JobRecord>> {
        self.unavailable()
    }

    async fn delete_job(&self, _job_run_id: &str) -> Result<()> {
        self.unavailable()
    }

    async fn query_history(&self, _query: &HistoryQuery) -> Result<Vec<JobRecord>> {
        self.unavailable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_operation_fails() {
        let store = DisconnectedStore::new("MONGO_DB_URL is not set");
        let err = store.get_session("alice").await.unwrap_err();
        assert!(matches!(err, AppError::DatabaseError(ref msg) if msg.contains("MONGO_DB_URL")));
        assert!(store.delete_job("x").await.is_err());
    }
}
