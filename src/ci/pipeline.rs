//! Persisted pipeline records: sessions, repositories, pipelines and job runs.

use crate::ci::config::PipelineConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Repository currently bound to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDetail {
    pub user_id: String,
    pub repo_url: String,
    pub repo_name: String,
    pub branch: String,
    pub commit_hash: String,
    pub is_remote: bool,
    pub time: DateTime<Utc>,
}

impl SessionDetail {
    pub fn repo_key(&self) -> RepoKey {
        RepoKey {
            repo_name: self.repo_name.clone(),
            repo_url: self.repo_url.clone(),
            branch: self.branch.clone(),
        }
    }
}

/// Identity of a [`RepoConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoKey {
    pub repo_name: String,
    pub repo_url: String,
    pub branch: String,
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repo_url, self.branch)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub repo_name: String,
    pub repo_url: String,
    pub branch: String,
    #[serde(default)]
    pub pipelines: BTreeMap<String, PipelineInfo>,
}

impl RepoConfig {
    pub fn new(key: &RepoKey) -> Self {
        Self {
            repo_name: key.repo_name.clone(),
            repo_url: key.repo_url.clone(),
            branch: key.branch.clone(),
            pipelines: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> RepoKey {
        RepoKey {
            repo_name: self.repo_name.clone(),
            repo_url: self.repo_url.clone(),
            branch: self.branch.clone(),
        }
    }

    pub fn with_pipeline(mut self, info: PipelineInfo) -> Self {
        self.pipelines.insert(info.pipeline_name.clone(), info);
        self
    }
}

/// A stored pipeline definition plus its run bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub pipeline_name: String,
    pub pipeline_file_name: String,
    pub last_commit_hash: String,
    pub pipeline_config: PipelineConfig,
    #[serde(default)]
    pub job_run_history: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub run_count: i64,
}

fn default_active() -> bool {
    true
}

impl PipelineInfo {
    pub fn new(
        pipeline_file_name: impl Into<String>,
        last_commit_hash: impl Into<String>,
        pipeline_config: PipelineConfig,
    ) -> Self {
        Self {
            pipeline_name: pipeline_config.pipeline_name().to_string(),
            pipeline_file_name: pipeline_file_name.into(),
            last_commit_hash: last_commit_hash.into(),
            pipeline_config,
            job_run_history: Vec::new(),
            active: true,
            running: false,
            run_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLog {
    pub job_name: String,
    pub job_status: JobStatus,
    pub allow_failure: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub job_logs: String,
    pub pipeline_config_used: PipelineConfig,
}

impl JobLog {
    pub fn pending(job_name: &str, allow_failure: bool, config: &PipelineConfig) -> Self {
        Self {
            job_name: job_name.to_string(),
            job_status: JobStatus::Pending,
            allow_failure,
            start_time: None,
            completion_time: None,
            job_logs: String::new(),
            pipeline_config_used: config.clone(),
        }
    }

    /// A failed job whose outcome does not permit the pipeline to continue.
    pub fn is_blocking_failure(&self) -> bool {
        self.job_status == JobStatus::Failed && !self.allow_failure
    }

    pub fn apply(&mut self, update: &JobUpdate) {
        if let Some(status) = update.job_status {
            self.job_status = status;
        }
        if let Some(start) = update.start_time {
            self.start_time = Some(start);
        }
        if let Some(completion) = update.completion_time {
            self.completion_time = Some(completion);
        }
        if let Some(logs) = &update.job_logs {
            self.job_logs = logs.clone();
        }
    }
}

/// One job of one run, as stored in the job history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub repo_url: String,
    pub pipeline_name: String,
    pub run_number: i64,
    pub stage: String,
    pub log: JobLog,
}

impl JobRecord {
    pub fn new(repo_url: &str, run_number: i64, stage: &str, log: JobLog) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            repo_url: repo_url.to_string(),
            pipeline_name: log.pipeline_config_used.pipeline_name().to_string(),
            run_number,
            stage: stage.to_string(),
            log,
        }
    }

    /// Identity that must be unique across the job history.
    pub fn run_key(&self) -> (&str, &str, i64, &str) {
        (
            &self.repo_url,
            &self.pipeline_name,
            self.run_number,
            &self.log.job_name,
        )
    }
}

/// Partial update of a stored [`JobLog`]; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub job_status: Option<JobStatus>,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub job_logs: Option<String>,
}

impl JobUpdate {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            job_status: Some(JobStatus::Running),
            start_time: Some(at),
            ..Self::default()
        }
    }

    pub fn cancelled(at: DateTime<Utc>) -> Self {
        Self {
            job_status: Some(JobStatus::Cancelled),
            completion_time: Some(at),
            ..Self::default()
        }
    }

    /// Full outcome of a finished job.
    pub fn from_log(log: &JobLog) -> Self {
        Self {
            job_status: Some(log.job_status),
            start_time: log.start_time,
            completion_time: log.completion_time,
            job_logs: Some(log.job_logs.clone()),
        }
    }
}

/// Filters for [`crate::domain::repositories::PipelineStore::query_history`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    pub repo_url: String,
    pub branch: Option<String>,
    pub pipeline_name: Option<String>,
    pub stage: Option<String>,
    pub job_name: Option<String>,
    pub run_number: Option<i64>,
}

impl HistoryQuery {
    pub fn for_repo(repo_url: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            ..Self::default()
        }
    }

    pub fn matches_repo(&self, repo: &RepoConfig) -> bool {
        repo.repo_url == self.repo_url
            && self.branch.as_ref().map_or(true, |b| b == &repo.branch)
    }

    pub fn matches_pipeline(&self, pipeline_name: &str) -> bool {
        self.pipeline_name
            .as_deref()
            .map_or(true, |name| name == pipeline_name)
    }

    pub fn matches_record(&self, record: &JobRecord) -> bool {
        record.repo_url == self.repo_url
            && self.matches_pipeline(&record.pipeline_name)
            && self.stage.as_deref().map_or(true, |s| s == record.stage)
            && self
                .job_name
                .as_deref()
                .map_or(true, |j| j == record.log.job_name)
            && self.run_number.map_or(true, |n| n == record.run_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ci::config::{DockerConfig, GlobalConfig};
    use indexmap::IndexMap;

    fn config() -> PipelineConfig {
        PipelineConfig {
            global: GlobalConfig {
                pipeline_name: "demo".into(),
                docker: DockerConfig::default(),
                artifact_upload_path: String::new(),
            },
            stages: IndexMap::new(),
            jobs: IndexMap::new(),
        }
    }

    #[test]
    fn test_job_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
        let status: JobStatus = serde_json::from_str("\"success\"").unwrap();
        assert_eq!(status, JobStatus::Success);
        assert!(status.is_finished());
        assert!(!JobStatus::Running.is_finished());
    }

    #[test]
    fn test_pipeline_info_runtime_fields_default() {
        let info = PipelineInfo::new("pipelines.yml", "abc123", config());
        let mut value = serde_json::to_value(&info).unwrap();
        let object = value.as_object_mut().unwrap();
        object.remove("running");
        object.remove("run_count");
        object.remove("job_run_history");
        object.remove("active");

        let restored: PipelineInfo = serde_json::from_value(value).unwrap();
        assert!(!restored.running);
        assert!(restored.active);
        assert_eq!(restored.run_count, 0);
        assert!(restored.job_run_history.is_empty());
    }

    #[test]
    fn test_job_update_applies_only_present_fields() {
        let mut log = JobLog::pending("build", false, &config());
        let now = Utc::now();
        log.apply(&JobUpdate::started(now));
        assert_eq!(log.job_status, JobStatus::Running);
        assert_eq!(log.start_time, Some(now));
        assert!(log.completion_time.is_none());

        log.apply(&JobUpdate {
            job_logs: Some("done".into()),
            ..JobUpdate::default()
        });
        assert_eq!(log.job_status, JobStatus::Running);
        assert_eq!(log.job_logs, "done");
    }

    #[test]
    fn test_history_query_filters() {
        let record = JobRecord::new(
            "https://example.com/repo.git",
            3,
            "test",
            JobLog::pending("unit", false, &config()),
        );
        assert_eq!(record.pipeline_name, "demo");

        let mut query = HistoryQuery::for_repo("https://example.com/repo.git");
        assert!(query.matches_record(&record));

        query.run_number = Some(3);
        query.stage = Some("test".into());
        assert!(query.matches_record(&record));

        query.job_name = Some("lint".into());
        assert!(!query.matches_record(&record));
    }
}
