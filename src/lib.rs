//! RustCI - container-based CI/CD pipelines for a bound repository.
//!
//! Pipelines are described in `.cicd-pipelines/*.yml`, validated into a
//! typed plan and executed stage by stage in containers sharing one volume.
//! Repository bindings, pipeline definitions and job history are stored in
//! MongoDB.

use std::sync::Arc;

use tracing::{info, warn};

pub mod application;
pub mod ci;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod testing;

// Re-export commonly used types
pub use error::{AppError, Result};

use application::services::{ConfigService, ReportService, SessionService};
use ci::artifacts::{ArtifactSink, LocalArtifactSink};
use ci::connectors::{ContainerEngine, DockerCli};
use ci::engine::PipelineOrchestrator;
use ci::repository::{GitRepositoryManager, RepositoryCheckout};
use domain::repositories::PipelineStore;
use infrastructure::database::DatabaseManager;
use infrastructure::repositories::{DisconnectedStore, MongoPipelineStore};

/// Application state shared across commands
#[derive(Clone)]
pub struct AppState {
    pub env: Arc<config::Config>,
    pub store: Arc<dyn PipelineStore>,
    pub engine: Arc<dyn ContainerEngine>,
    pub sink: Arc<dyn ArtifactSink>,
    pub checkout: Arc<dyn RepositoryCheckout>,
}

impl AppState {
    /// Wires the production components.
    ///
    /// A database that cannot be reached does not stop the process: file
    /// validation and dry runs still work, store operations fail.
    pub async fn connect(config: config::Config) -> Self {
        let store: Arc<dyn PipelineStore> =
            match DatabaseManager::new(&config.mongodb_uri, &config.mongodb_database).await {
                Ok(db) => {
                    info!("🗄️ MongoDB database: {}", config.mongodb_database);
                    Arc::new(MongoPipelineStore::new(db))
                }
                Err(e) => {
                    warn!("⚠️ Running without a pipeline store: {}", e);
                    Arc::new(DisconnectedStore::new(e.to_string()))
                }
            };

        Self {
            engine: Arc::new(DockerCli::new()),
            sink: Arc::new(LocalArtifactSink::new(config.artifact_dir.clone())),
            checkout: Arc::new(GitRepositoryManager::new(config.workspace_root.clone())),
            store,
            env: Arc::new(config),
        }
    }

    pub fn orchestrator(&self) -> PipelineOrchestrator {
        PipelineOrchestrator::new(self.store.clone(), self.engine.clone(), self.sink.clone())
            .with_max_parallel(self.env.max_parallel_jobs)
            .with_seed_image(self.env.seed_image.clone())
    }

    pub fn session_service(&self) -> SessionService {
        SessionService::new(
            self.store.clone(),
            self.checkout.clone(),
            self.env.user_id.clone(),
        )
    }

    pub fn config_service(&self) -> ConfigService {
        ConfigService::new(self.store.clone())
    }

    pub fn report_service(&self) -> ReportService {
        ReportService::new(self.store.clone())
    }
}
