//! Pipeline file checking, saving and overrides.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::ci::checker::ConfigChecker;
use crate::ci::config::PipelineConfig;
use crate::ci::overrides::apply_overrides;
use crate::ci::pipeline::{PipelineInfo, RepoConfig, SessionDetail};
use crate::ci::yaml_parser::{self, DocumentTree};
use crate::domain::repositories::PipelineStore;
use crate::error::{AppError, Result};

/// Validation outcome for one pipeline file.
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub pipeline_name: String,
    pub file_name: String,
    pub outcome: std::result::Result<PipelineConfig, String>,
}

impl CheckReport {
    pub fn is_valid(&self) -> bool {
        self.outcome.is_ok()
    }
}

pub struct ConfigService {
    store: Arc<dyn PipelineStore>,
    checker: ConfigChecker,
}

impl ConfigService {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self {
            store,
            checker: ConfigChecker::new(),
        }
    }

    fn check_document(&self, document: &DocumentTree, file_name: &str) -> CheckReport {
        let pipeline_name = document
            .pipeline_name()
            .map(str::to_string)
            .unwrap_or_else(|| file_name.to_string());
        let result = self
            .checker
            .validate(&pipeline_name, document, Some(file_name), true);

        let outcome = match result.pipeline_config {
            Some(config) if result.valid => Ok(config),
            _ => Err(result.error_msg),
        };
        CheckReport {
            pipeline_name,
            file_name: file_name.to_string(),
            outcome,
        }
    }

    /// Validates one pipeline file; saves it to the session's repository when `save` is set.
    pub async fn check_file(
        &self,
        path: &Path,
        session: Option<&SessionDetail>,
        save: bool,
    ) -> Result<CheckReport> {
        let document = yaml_parser::parse_file(path)?;
        let file_name = document
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| path.display().to_string());
        let report = self.check_document(&document, &file_name);

        if save {
            self.save_valid(std::slice::from_ref(&report), session).await?;
        }
        Ok(report)
    }

    /// Validates every pipeline under `dir`; saves the valid ones when `save` is set.
    pub async fn check_directory(
        &self,
        dir: &Path,
        session: Option<&SessionDetail>,
        save: bool,
    ) -> Result<Vec<CheckReport>> {
        let files = yaml_parser::parse_directory(dir)?;
        let reports: Vec<CheckReport> = files
            .values()
            .map(|file| self.check_document(&file.document, &file.file_name))
            .collect();

        if save {
            self.save_valid(&reports, session).await?;
        }
        Ok(reports)
    }

    async fn save_valid(
        &self,
        reports: &[CheckReport],
        session: Option<&SessionDetail>,
    ) -> Result<()> {
        let Some(session) = session else {
            warn!("⚠️ No repository bound, validated pipelines were not saved");
            return Ok(());
        };

        let mut repo = RepoConfig::new(&session.repo_key());
        for report in reports {
            if let Ok(config) = &report.outcome {
                repo = repo.with_pipeline(PipelineInfo::new(
                    report.file_name.clone(),
                    session.commit_hash.clone(),
                    config.clone(),
                ));
            }
        }
        if repo.pipelines.is_empty() {
            return Ok(());
        }

        self.store.upsert_repo_pipelines(&repo).await?;
        info!(
            "💾 Saved {} pipeline(s) for {}",
            repo.pipelines.len(),
            session.repo_key()
        );
        Ok(())
    }

    /// Applies overrides to a stored pipeline, persisting the result when `save` is set.
    pub async fn override_pipeline(
        &self,
        session: &SessionDetail,
        pipeline_name: &str,
        overrides: &[String],
        save: bool,
    ) -> Result<PipelineConfig> {
        let key = session.repo_key();
        let info = self
            .store
            .get_pipeline_info(&key, pipeline_name)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("pipeline '{}' for {}", pipeline_name, key))
            })?;

        let updated = apply_overrides(&self.checker, &info.pipeline_config, overrides)?;

        if save {
            let mut new_info = info.clone();
            new_info.pipeline_config = updated.clone();
            let saved = self
                .store
                .update_pipeline_info(&key, pipeline_name, &new_info, false)
                .await?;
            if !saved {
                return Err(AppError::AlreadyRunning(pipeline_name.to_string()));
            }
            info!("💾 Saved overridden pipeline {}", pipeline_name);
        }
        Ok(updated)
    }

    /// Serializes a pipeline for display.
    pub fn render(config: &PipelineConfig, json: bool) -> Result<String> {
        if json {
            Ok(serde_json::to_string_pretty(config)?)
        } else {
            Ok(serde_yaml::to_string(&config.to_document())?)
        }
    }
}
