#![allow(dead_code)]

use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use rustci_engine::ci::engine::{PipelineOrchestrator, RunOptions};
use rustci_engine::ci::pipeline::{PipelineInfo, SessionDetail};
use rustci_engine::ci::yaml_parser::{DEFAULT_PIPELINE_FILE, PIPELINES_DIR};
use rustci_engine::domain::repositories::PipelineStore;
use rustci_engine::infrastructure::repositories::MemoryPipelineStore;
use rustci_engine::testing::{FakeContainerEngine, MemoryArtifactSink};

/// A two-stage pipeline: `j1` builds, `j2` tests.
pub const TWO_STAGE_PIPELINE: &str = "\
global:
  pipeline_name: app
  docker:
    image: alpine:latest
stages: [build, test]
jobs:
  j1:
    stage: build
    scripts: [make]
  j2:
    stage: test
    scripts: [make test]
";

/// Test environment setup: in-memory store, scripted engine and a checkout on disk.
pub struct TestEnvironment {
    pub store: Arc<MemoryPipelineStore>,
    pub engine: Arc<FakeContainerEngine>,
    pub sink: Arc<MemoryArtifactSink>,
    pub workspace: TempDir,
    pub session: SessionDetail,
}

impl TestEnvironment {
    pub fn new(engine: FakeContainerEngine) -> Self {
        let workspace = TempDir::new().unwrap();
        fs::create_dir(workspace.path().join(PIPELINES_DIR)).unwrap();
        let session = SessionDetail {
            user_id: "tester".to_string(),
            repo_url: workspace.path().display().to_string(),
            repo_name: "demo".to_string(),
            branch: "main".to_string(),
            commit_hash: "abc123".to_string(),
            is_remote: false,
            time: Utc::now(),
        };

        Self {
            store: Arc::new(MemoryPipelineStore::new()),
            engine: Arc::new(engine),
            sink: Arc::new(MemoryArtifactSink::new()),
            workspace,
            session,
        }
    }

    pub fn write_pipeline(&self, file_name: &str, source: &str) -> PathBuf {
        let path = self.workspace.path().join(PIPELINES_DIR).join(file_name);
        fs::write(&path, source).unwrap();
        path
    }

    pub fn write_default_pipeline(&self, source: &str) -> PathBuf {
        self.write_pipeline(DEFAULT_PIPELINE_FILE, source)
    }

    pub fn workspace_path(&self) -> &Path {
        self.workspace.path()
    }

    pub fn orchestrator(&self) -> PipelineOrchestrator {
        PipelineOrchestrator::new(self.store.clone(), self.engine.clone(), self.sink.clone())
    }

    /// Options running the workspace's default pipeline.
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            workspace: Some(self.workspace.path().to_path_buf()),
            ..RunOptions::default()
        }
    }

    pub async fn pipeline_info(&self, name: &str) -> PipelineInfo {
        self.store
            .get_pipeline_info(&self.session.repo_key(), name)
            .await
            .unwrap()
            .expect("pipeline should be stored")
    }
}
