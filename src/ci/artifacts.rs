//! Artifact sinks

use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::info;

/// Destination for artifact archives, addressed by a slash-separated key.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
}

/// Writes artifacts below a local directory.
pub struct LocalArtifactSink {
    root: PathBuf,
}

impl LocalArtifactSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        if relative.as_os_str().is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(AppError::IoError(format!("invalid artifact key '{}'", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactSink for LocalArtifactSink {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let size = bytes.len();
        tokio::fs::write(&path, bytes).await?;
        info!("📦 Stored artifact {} ({} bytes)", path.display(), size);
        Ok(())
    }
}

/// Sink key for one artifact path of a job.
pub fn artifact_key(upload_path: &str, run_name: &str, job_name: &str, path: &str) -> String {
    let base = upload_path.trim_matches('/');
    let path = path.trim_start_matches("./").trim_matches('/');
    let path = if path.is_empty() { "workspace" } else { path };
    if base.is_empty() {
        format!("{}/{}/{}.tar", run_name, job_name, path)
    } else {
        format!("{}/{}/{}/{}.tar", base, run_name, job_name, path)
    }
}
