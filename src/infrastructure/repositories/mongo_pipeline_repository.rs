use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, to_bson, Document},
    options::{FindOneAndUpdateOptions, ReplaceOptions, ReturnDocument, UpdateOptions},
};
use tracing::debug;

use crate::{
    ci::pipeline::{
        HistoryQuery, JobRecord, JobUpdate, PipelineInfo, RepoConfig, RepoKey, SessionDetail,
    },
    domain::repositories::{order_by_history, PipelineStore},
    error::{AppError, Result},
    infrastructure::database::DatabaseManager,
};

/// MongoDB implementation of the pipeline store.
///
/// Pipelines live inside their repository document under
/// `pipelines.<pipeline_name>`, so every pipeline write is a single-document
/// update and the run guard is a single `find_one_and_update`.
pub struct MongoPipelineStore {
    db: DatabaseManager,
}

impl MongoPipelineStore {
    pub fn new(db: DatabaseManager) -> Self {
        Self { db }
    }

    fn repo_filter(key: &RepoKey) -> Document {
        doc! {
            "repo_name": &key.repo_name,
            "repo_url": &key.repo_url,
            "branch": &key.branch,
        }
    }

    fn pipeline_field(pipeline_name: &str, field: &str) -> String {
        format!("pipelines.{}.{}", pipeline_name, field)
    }

    fn pipeline_filter(key: &RepoKey, pipeline_name: &str) -> Document {
        let mut filter = Self::repo_filter(key);
        filter.insert(
            Self::pipeline_field(pipeline_name, "pipeline_name"),
            pipeline_name,
        );
        filter
    }
}

fn db_error(context: &str) -> impl Fn(mongodb::error::Error) -> AppError + '_ {
    move |e| AppError::DatabaseError(format!("{}: {}", context, e))
}

#[async_trait]
impl PipelineStore for MongoPipelineStore {
    async fn upsert_session(&self, session: &SessionDetail) -> Result<()> {
        let options = ReplaceOptions::builder().upsert(true).build();
        self.db
            .sessions()
            .replace_one(doc! { "user_id": &session.user_id }, session, options)
            .await
            .map_err(db_error("Failed to save session"))?;
        Ok(())
    }

    async fn get_session(&self, user_id: &str) -> Result<Option<SessionDetail>> {
        self.db
            .sessions()
            .find_one(doc! { "user_id": user_id }, None)
            .await
            .map_err(db_error("Failed to load session"))
    }

    async fn upsert_repo_pipelines(&self, repo: &RepoConfig) -> Result<()> {
        let mut set = Document::new();
        for (name, info) in &repo.pipelines {
            set.insert(
                Self::pipeline_field(name, "pipeline_name"),
                info.pipeline_name.clone(),
            );
            set.insert(
                Self::pipeline_field(name, "pipeline_file_name"),
                info.pipeline_file_name.clone(),
            );
            set.insert(
                Self::pipeline_field(name, "last_commit_hash"),
                info.last_commit_hash.clone(),
            );
            set.insert(
                Self::pipeline_field(name, "pipeline_config"),
                to_bson(&info.pipeline_config)?,
            );
            set.insert(Self::pipeline_field(name, "active"), info.active);
        }

        let update = if set.is_empty() {
            doc! { "$setOnInsert": { "pipelines": {} } }
        } else {
            doc! { "$set": set }
        };

        let options = UpdateOptions::builder().upsert(true).build();
        self.db
            .repo_configs()
            .update_one(Self::repo_filter(&repo.key()), update, options)
            .await
            .map_err(db_error("Failed to save repository pipelines"))?;

        debug!(
            repo = %repo.key(),
            pipelines = repo.pipelines.len(),
            "Saved repository pipelines"
        );
        Ok(())
    }

    async fn get_repo_config(&self, key: &RepoKey) -> Result<Option<RepoConfig>> {
        self.db
            .repo_configs()
            .find_one(Self::repo_filter(key), None)
            .await
            .map_err(db_error("Failed to load repository"))
    }

    async fn get_pipeline_info(
        &self,
        key: &RepoKey,
        pipeline_name: &str,
    ) -> Result<Option<PipelineInfo>> {
        Ok(self
            .get_repo_config(key)
            .await?
            .and_then(|mut repo| repo.pipelines.remove(pipeline_name)))
    }

    async fn update_pipeline_info(
        &self,
        key: &RepoKey,
        pipeline_name: &str,
        info: &PipelineInfo,
        expected_running: bool,
    ) -> Result<bool> {
        let mut filter = Self::pipeline_filter(key, pipeline_name);
        let running_field = Self::pipeline_field(pipeline_name, "running");
        if expected_running {
            filter.insert(running_field, true);
        } else {
            filter.insert(running_field, doc! { "$ne": true });
        }

        let pipeline_path = format!("pipelines.{}", pipeline_name);
        let update = doc! { "$set": { pipeline_path: to_bson(info)? } };
        let result = self
            .db
            .repo_configs()
            .update_one(filter, update, None)
            .await
            .map_err(db_error("Failed to update pipeline"))?;

        Ok(result.matched_count > 0)
    }

    async fn try_start_run(&self, key: &RepoKey, pipeline_name: &str) -> Result<Option<i64>> {
        let mut filter = Self::pipeline_filter(key, pipeline_name);
        filter.insert(
            Self::pipeline_field(pipeline_name, "running"),
            doc! { "$ne": true },
        );
        let running_field = Self::pipeline_field(pipeline_name, "running");
        let count_field = Self::pipeline_field(pipeline_name, "run_count");
        let update = doc! {
            "$set": { running_field: true },
            "$inc": { count_field: 1_i64 },
        };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        let updated = self
            .db
            .repo_configs()
            .find_one_and_update(filter, update, options)
            .await
            .map_err(db_error("Failed to start pipeline run"))?;

        match updated.and_then(|mut repo| repo.pipelines.remove(pipeline_name)) {
            Some(info) => Ok(Some(info.run_count)),
            None => match self.get_pipeline_info(key, pipeline_name).await? {
                Some(_) => Ok(None),
                None => Err(AppError::NotFound(format!(
                    "pipeline '{}' in {}",
                    pipeline_name, key
                ))),
            },
        }
    }

    async fn finish_run(&self, key: &RepoKey, pipeline_name: &str) -> Result<()> {
        let running_field = Self::pipeline_field(pipeline_name, "running");
        let update = doc! { "$set": { running_field: false } };
        self.db
            .repo_configs()
            .update_one(Self::pipeline_filter(key, pipeline_name), update, None)
            .await
            .map_err(db_error("Failed to finish pipeline run"))?;
        Ok(())
    }

    async fn append_job_history(
        &self,
        key: &RepoKey,
        pipeline_name: &str,
        job_run_ids: &[String],
    ) -> Result<()> {
        if job_run_ids.is_empty() {
            return Ok(());
        }
        let history_field = Self::pipeline_field(pipeline_name, "job_run_history");
        let update = doc! {
            "$push": { history_field: { "$each": job_run_ids.to_vec() } }
        };
        let result = self
            .db
            .repo_configs()
            .update_one(Self::pipeline_filter(key, pipeline_name), update, None)
            .await
            .map_err(db_error("Failed to append job history"))?;

        if result.matched_count == 0 {
            return Err(AppError::NotFound(format!(
                "pipeline '{}' in {}",
                pipeline_name, key
            )));
        }
        Ok(())
    }

    async fn insert_job(&self, record: &JobRecord) -> Result<String> {
        self.db
            .jobs_history()
            .insert_one(record, None)
            .await
            .map_err(db_error("Failed to insert job"))?;
        Ok(record.id.clone())
    }

    async fn update_job(&self, job_run_id: &str, update: &JobUpdate) -> Result<()> {
        let mut set = Document::new();
        if let Some(status) = &update.job_status {
            set.insert("log.job_status", to_bson(status)?);
        }
        if let Some(start) = &update.start_time {
            set.insert("log.start_time", to_bson(start)?);
        }
        if let Some(completion) = &update.completion_time {
            set.insert("log.completion_time", to_bson(completion)?);
        }
        if let Some(logs) = &update.job_logs {
            set.insert("log.job_logs", logs.clone());
        }
        if set.is_empty() {
            return Ok(());
        }

        let result = self
            .db
            .jobs_history()
            .update_one(doc! { "_id": job_run_id }, doc! { "$set": set }, None)
            .await
            .map_err(db_error("Failed to update job"))?;

        if result.matched_count == 0 {
            return Err(AppError::NotFound(format!("job run {}", job_run_id)));
        }
        Ok(())
    }

    async fn get_job(&self, job_run_id: &str) -> Result<Option<JobRecord>> {
        self.db
            .jobs_history()
            .find_one(doc! { "_id": job_run_id }, None)
            .await
            .map_err(db_error("Failed to load job"))
    }

    async fn delete_job(&self, job_run_id: &str) -> Result<()> {
        self.db
            .jobs_history()
            .delete_one(doc! { "_id": job_run_id }, None)
            .await
            .map_err(db_error("Failed to delete job"))?;
        Ok(())
    }

    async fn query_history(&self, query: &HistoryQuery) -> Result<Vec<JobRecord>> {
        let mut repo_filter = doc! { "repo_url": &query.repo_url };
        if let Some(branch) = &query.branch {
            repo_filter.insert("branch", branch.clone());
        }

        let repos: Vec<RepoConfig> = self
            .db
            .repo_configs()
            .find(repo_filter, None)
            .await
            .map_err(db_error("Failed to query repositories"))?
            .try_collect()
            .await
            .map_err(db_error("Failed to read repositories"))?;

        let history: Vec<String> = repos
            .iter()
            .flat_map(|repo| repo.pipelines.values())
            .filter(|info| query.matches_pipeline(&info.pipeline_name))
            .flat_map(|info| info.job_run_history.iter().cloned())
            .collect();
        if history.is_empty() {
            return Ok(Vec::new());
        }

        let mut filter = doc! { "_id": { "$in": history.clone() } };
        if let Some(stage) = &query.stage {
            filter.insert("stage", stage.clone());
        }
        if let Some(job_name) = &query.job_name {
            filter.insert("log.job_name", job_name.clone());
        }
        if let Some(run_number) = query.run_number {
            filter.insert("run_number", run_number);
        }

        let records: Vec<JobRecord> = self
            .db
            .jobs_history()
            .find(filter, None)
            .await
            .map_err(db_error("Failed to query job history"))?
            .try_collect()
            .await
            .map_err(db_error("Failed to read job history"))?;

        Ok(order_by_history(&history, records))
    }
}
