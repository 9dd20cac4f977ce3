//! Repository binding for the current user.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::ci::pipeline::SessionDetail;
use crate::ci::repository::{CheckoutRequest, RepositoryCheckout};
use crate::ci::yaml_parser::PIPELINES_DIR;
use crate::domain::repositories::PipelineStore;
use crate::error::{AppError, Result};

use super::config_service::{CheckReport, ConfigService};

pub struct SessionService {
    store: Arc<dyn PipelineStore>,
    checkout: Arc<dyn RepositoryCheckout>,
    user_id: String,
}

/// Result of binding a repository.
#[derive(Debug, Clone)]
pub struct BoundRepository {
    pub session: SessionDetail,
    pub workspace: PathBuf,
    pub pipelines: Vec<CheckReport>,
}

impl SessionService {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        checkout: Arc<dyn RepositoryCheckout>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            checkout,
            user_id: user_id.into(),
        }
    }

    /// Checks the repository out, binds it to the user and saves its valid pipelines.
    pub async fn set_repo(&self, request: &CheckoutRequest) -> Result<BoundRepository> {
        let checkout = self.checkout.checkout(request).await?;
        let workspace = checkout.workspace.clone();
        let session = checkout.into_session(&self.user_id);
        self.store.upsert_session(&session).await?;
        info!(
            user = %self.user_id,
            repo = %session.repo_key(),
            "🔗 Repository bound"
        );

        let dir = workspace.join(PIPELINES_DIR);
        let pipelines = if dir.is_dir() {
            ConfigService::new(self.store.clone())
                .check_directory(&dir, Some(&session), true)
                .await?
        } else {
            Vec::new()
        };

        Ok(BoundRepository {
            session,
            workspace,
            pipelines,
        })
    }

    pub async fn get_repo(&self) -> Result<SessionDetail> {
        self.store
            .get_session(&self.user_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "no repository bound for user '{}'; run `config set-repo` first",
                    self.user_id
                ))
            })
    }

    pub fn workspace(&self, session: &SessionDetail) -> PathBuf {
        self.checkout.workspace_for(session)
    }
}
