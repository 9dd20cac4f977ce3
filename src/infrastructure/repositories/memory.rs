use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use crate::{
    ci::pipeline::{
        HistoryQuery, JobRecord, JobUpdate, PipelineInfo, RepoConfig, RepoKey, SessionDetail,
    },
    domain::repositories::{order_by_history, PipelineStore},
    error::{AppError, Result},
};

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, SessionDetail>,
    repos: BTreeMap<RepoKey, RepoConfig>,
    jobs: HashMap<String, JobRecord>,
}

/// In-process pipeline store. A single lock makes every operation atomic.
#[derive(Default)]
pub struct MemoryPipelineStore {
    state: RwLock<MemoryState>,
    fail_job_writes: AtomicBool,
}

impl MemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent job insert/update fail, simulating a lost store.
    pub fn set_fail_job_writes(&self, fail: bool) {
        self.fail_job_writes.store(fail, Ordering::SeqCst);
    }

    /// Every stored job record, in no particular order.
    pub async fn all_jobs(&self) -> Vec<JobRecord> {
        self.state.read().await.jobs.values().cloned().collect()
    }

    fn check_job_writes(&self) -> Result<()> {
        if self.fail_job_writes.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(
                "job history is unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

fn pipeline_not_found(key: &RepoKey, pipeline_name: &str) -> AppError {
    AppError::NotFound(format!("pipeline '{}' in {}", pipeline_name, key))
}

#[async_trait]
impl PipelineStore for MemoryPipelineStore {
    async fn upsert_session(&self, session: &SessionDetail) -> Result<()> {
        self.state
            .write()
            .await
            .sessions
            .insert(session.user_id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, user_id: &str) -> Result<Option<SessionDetail>> {
        Ok(self.state.read().await.sessions.get(user_id).cloned())
    }

    async fn upsert_repo_pipelines(&self, repo: &RepoConfig) -> Result<()> {
        let mut state = self.state.write().await;
        let stored = state
            .repos
            .entry(repo.key())
            .or_insert_with(|| RepoConfig::new(&repo.key()));

        for (name, info) in &repo.pipelines {
            match stored.pipelines.get_mut(name) {
                Some(existing) => {
                    existing.pipeline_file_name = info.pipeline_file_name.clone();
                    existing.last_commit_hash = info.last_commit_hash.clone();
                    existing.pipeline_config = info.pipeline_config.clone();
                    existing.active = info.active;
                }
                None => {
                    let mut fresh = info.clone();
                    fresh.running = false;
                    fresh.run_count = 0;
                    fresh.job_run_history.clear();
                    stored.pipelines.insert(name.clone(), fresh);
                }
            }
        }
        Ok(())
    }

    async fn get_repo_config(&self, key: &RepoKey) -> Result<Option<RepoConfig>> {
        Ok(self.state.read().await.repos.get(key).cloned())
    }

    async fn get_pipeline_info(
        &self,
        key: &RepoKey,
        pipeline_name: &str,
    ) -> Result<Option<PipelineInfo>> {
        Ok(self
            .state
            .read()
            .await
            .repos
            .get(key)
            .and_then(|repo| repo.pipelines.get(pipeline_name))
            .cloned())
    }

    async fn update_pipeline_info(
        &self,
        key: &RepoKey,
        pipeline_name: &str,
        info: &PipelineInfo,
        expected_running: bool,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(existing) = state
            .repos
            .get_mut(key)
            .and_then(|repo| repo.pipelines.get_mut(pipeline_name))
        else {
            return Ok(false);
        };

        if existing.running != expected_running {
            return Ok(false);
        }
        *existing = info.clone();
        Ok(true)
    }

    async fn try_start_run(&self, key: &RepoKey, pipeline_name: &str) -> Result<Option<i64>> {
        let mut state = self.state.write().await;
        let info = state
            .repos
            .get_mut(key)
            .and_then(|repo| repo.pipelines.get_mut(pipeline_name))
            .ok_or_else(|| pipeline_not_found(key, pipeline_name))?;

        if info.running {
            return Ok(None);
        }
        info.running = true;
        info.run_count += 1;
        Ok(Some(info.run_count))
    }

    async fn finish_run(&self, key: &RepoKey, pipeline_name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(info) = state
            .repos
            .get_mut(key)
            .and_then(|repo| repo.pipelines.get_mut(pipeline_name))
        {
            info.running = false;
        }
        Ok(())
    }

    async fn append_job_history(
        &self,
        key: &RepoKey,
        pipeline_name: &str,
        job_run_ids: &[String],
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let info = state
            .repos
            .get_mut(key)
            .and_then(|repo| repo.pipelines.get_mut(pipeline_name))
            .ok_or_else(|| pipeline_not_found(key, pipeline_name))?;
        info.job_run_history.extend(job_run_ids.iter().cloned());
        Ok(())
    }

    async fn insert_job(&self, record: &JobRecord) -> Result<String> {
        self.check_job_writes()?;
        let mut state = self.state.write().await;

        if state.jobs.contains_key(&record.id)
            || state
                .jobs
                .values()
                .any(|existing| existing.run_key() == record.run_key())
        {
            return Err(AppError::DatabaseError(format!(
                "job '{}' already recorded for run {} of pipeline '{}'",
                record.log.job_name, record.run_number, record.pipeline_name
            )));
        }

        state.jobs.insert(record.id.clone(), record.clone());
        Ok(record.id.clone())
    }

    async fn update_job(&self, job_run_id: &str, update: &JobUpdate) -> Result<()> {
        self.check_job_writes()?;
        let mut state = self.state.write().await;
        let record = state
            .jobs
            .get_mut(job_run_id)
            .ok_or_else(|| AppError::NotFound(format!("job run {}", job_run_id)))?;
        record.log.apply(update);
        Ok(())
    }

    async fn get_job(&self, job_run_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.state.read().await.jobs.get(job_run_id).cloned())
    }

    async fn delete_job(&self, job_run_id: &str) -> Result<()> {
        self.state.write().await.jobs.remove(job_run_id);
        Ok(())
    }

    async fn query_history(&self, query: &HistoryQuery) -> Result<Vec<JobRecord>> {
        let state = self.state.read().await;
        let history: Vec<String> = state
            .repos
            .values()
            .filter(|repo| query.matches_repo(repo))
            .flat_map(|repo| repo.pipelines.values())
            .filter(|info| query.matches_pipeline(&info.pipeline_name))
            .flat_map(|info| info.job_run_history.iter().cloned())
            .collect();

        let records = history
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|record| query.matches_record(record))
            .cloned()
            .collect();

        Ok(order_by_history(&history, records))
    }
}
