//! Repository checkout
//!
//! Turns a repository argument (a local directory or a git URL) into a
//! workspace directory plus the metadata a session records.

use crate::ci::pipeline::SessionDetail;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, error, info};
use url::Url;

/// Branch recorded for local directories that are not git repositories.
pub const LOCAL_BRANCH: &str = "local";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckoutRequest {
    /// Local directory or remote git URL.
    pub repo: String,
    pub branch: Option<String>,
    pub commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkout {
    pub workspace: PathBuf,
    pub repo_url: String,
    pub repo_name: String,
    pub branch: String,
    pub commit_hash: String,
    pub is_remote: bool,
}

impl Checkout {
    pub fn into_session(self, user_id: &str) -> SessionDetail {
        SessionDetail {
            user_id: user_id.to_string(),
            repo_url: self.repo_url,
            repo_name: self.repo_name,
            branch: self.branch,
            commit_hash: self.commit_hash,
            is_remote: self.is_remote,
            time: Utc::now(),
        }
    }
}

#[async_trait]
pub trait RepositoryCheckout: Send + Sync {
    async fn checkout(&self, request: &CheckoutRequest) -> Result<Checkout>;

    /// Workspace directory of a session bound earlier.
    fn workspace_for(&self, session: &SessionDetail) -> PathBuf;
}

/// Repository name derived from a URL: the last path segment without `.git`.
///
/// Accepts scp-like addresses (`git@host:org/repo.git`) as well.
pub fn repo_name_from_url(repo: &str) -> Option<String> {
    let path = match Url::parse(repo) {
        Ok(url) if url.has_host() || url.scheme() == "file" => url.path().to_string(),
        _ => {
            let (user_host, path) = repo.split_once(':')?;
            if !user_host.contains('@') || path.starts_with("//") {
                return None;
            }
            path.to_string()
        }
    };

    let name = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()?
        .trim_end_matches(".git")
        .to_string();
    (!name.is_empty()).then_some(name)
}

/// Checks repositories out with the `git` CLI below a workspace root.
pub struct GitRepositoryManager {
    workspace_root: PathBuf,
}

impl GitRepositoryManager {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    fn clone_dir(&self, repo_name: &str, branch: &str) -> PathBuf {
        let branch: String = branch
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.workspace_root.join(format!("{}-{}", repo_name, branch))
    }

    async fn git(&self, dir: Option<&Path>, args: &[&str]) -> Result<String> {
        debug!("🔧 git {}", args.join(" "));
        let mut command = Command::new("git");
        command.args(args);
        if let Some(dir) = dir {
            command.current_dir(dir);
        }

        let output = command.output().await.map_err(|e| {
            AppError::ExternalServiceError(format!("Failed to execute git: {}", e))
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("❌ git {} failed: {}", args.first().copied().unwrap_or_default(), stderr.trim());
            return Err(AppError::ExternalServiceError(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn checkout_local(&self, path: &Path, request: &CheckoutRequest) -> Result<Checkout> {
        if request.commit.is_some() {
            return Err(AppError::InvalidInvocation(
                "--commit is only supported for remote repositories".to_string(),
            ));
        }

        let workspace = fs::canonicalize(path).await?;
        let repo_name = workspace
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "workspace".to_string());

        let (branch, commit_hash) = if workspace.join(".git").exists() {
            let branch = match &request.branch {
                Some(branch) => branch.clone(),
                None => {
                    self.git(Some(&workspace), &["rev-parse", "--abbrev-ref", "HEAD"])
                        .await?
                }
            };
            let commit = self.git(Some(&workspace), &["rev-parse", "HEAD"]).await?;
            (branch, commit)
        } else {
            (
                request
                    .branch
                    .clone()
                    .unwrap_or_else(|| LOCAL_BRANCH.to_string()),
                String::new(),
            )
        };

        info!("📁 Using local repository {}", workspace.display());
        Ok(Checkout {
            repo_url: workspace.display().to_string(),
            workspace,
            repo_name,
            branch,
            commit_hash,
            is_remote: false,
        })
    }

    async fn checkout_remote(&self, repo_name: String, request: &CheckoutRequest) -> Result<Checkout> {
        let requested_branch = request.branch.as_deref().unwrap_or("default");
        let target = self.clone_dir(&repo_name, requested_branch);
        fs::create_dir_all(&self.workspace_root).await?;

        if target.join(".git").exists() {
            info!("🔄 Updating {} in {}", request.repo, target.display());
            self.git(Some(&target), &["fetch", "--prune", "origin"]).await?;
            if let Some(branch) = &request.branch {
                self.git(Some(&target), &["checkout", branch]).await?;
                let upstream = format!("origin/{}", branch);
                self.git(Some(&target), &["reset", "--hard", &upstream]).await?;
            }
        } else {
            info!("📥 Cloning repository: {}", request.repo);
            let target_str = target.display().to_string();
            let mut args = vec!["clone"];
            if let Some(branch) = &request.branch {
                args.push("--branch");
                args.push(branch);
            }
            args.push("--");
            args.push(&request.repo);
            args.push(&target_str);
            self.git(None, &args).await?;
        }

        if let Some(commit) = &request.commit {
            self.git(Some(&target), &["checkout", commit]).await?;
        }

        let branch = match &request.branch {
            Some(branch) => branch.clone(),
            None => self.git(Some(&target), &["rev-parse", "--abbrev-ref", "HEAD"]).await?,
        };
        let commit_hash = self.git(Some(&target), &["rev-parse", "HEAD"]).await?;

        // Sessions locate the checkout by the resolved branch.
        let resolved = self.clone_dir(&repo_name, &branch);
        let target = if resolved != target {
            if resolved.exists() {
                fs::remove_dir_all(&resolved).await?;
            }
            fs::rename(&target, &resolved).await?;
            debug!("Moved checkout to {}", resolved.display());
            resolved
        } else {
            target
        };

        info!("✅ Checked out {}@{} ({})", repo_name, branch, commit_hash);
        Ok(Checkout {
            workspace: target,
            repo_url: request.repo.clone(),
            repo_name,
            branch,
            commit_hash,
            is_remote: true,
        })
    }
}

#[async_trait]
impl RepositoryCheckout for GitRepositoryManager {
    async fn checkout(&self, request: &CheckoutRequest) -> Result<Checkout> {
        let path = Path::new(&request.repo);
        if path.is_dir() {
            return self.checkout_local(path, request).await;
        }
        if request.repo.starts_with('-') {
            return Err(AppError::InvalidInvocation(format!(
                "repository '{}' must not start with '-'",
                request.repo
            )));
        }

        let repo_name = repo_name_from_url(&request.repo).ok_or_else(|| {
            AppError::InvalidInvocation(format!(
                "'{}' is neither a directory nor a repository URL",
                request.repo
            ))
        })?;
        self.checkout_remote(repo_name, request).await
    }

    fn workspace_for(&self, session: &SessionDetail) -> PathBuf {
        if session.is_remote {
            self.clone_dir(&session.repo_name, &session.branch)
        } else {
            PathBuf::from(&session.repo_url)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_repo_name_from_url() {
        assert_eq!(
            repo_name_from_url("https://github.com/acme/widgets.git").as_deref(),
            Some("widgets")
        );
        assert_eq!(
            repo_name_from_url("https://gitlab.com/acme/tools/").as_deref(),
            Some("tools")
        );
        assert_eq!(
            repo_name_from_url("git@github.com:acme/widgets.git").as_deref(),
            Some("widgets")
        );
        assert_eq!(repo_name_from_url("not a repo"), None);
        assert_eq!(repo_name_from_url("https://github.com/"), None);
    }

    #[tokio::test]
    async fn test_local_directory_checkout() {
        let repo = TempDir::new().unwrap();
        let manager = GitRepositoryManager::new(repo.path().join("unused"));

        let checkout = manager
            .checkout(&CheckoutRequest {
                repo: repo.path().display().to_string(),
                ..CheckoutRequest::default()
            })
            .await
            .unwrap();

        assert!(!checkout.is_remote);
        assert_eq!(checkout.branch, LOCAL_BRANCH);
        assert_eq!(checkout.workspace, std::fs::canonicalize(repo.path()).unwrap());

        let session = checkout.clone().into_session("alice");
        assert_eq!(manager.workspace_for(&session), checkout.workspace);
    }

    #[tokio::test]
    async fn test_invalid_repository_is_rejected() {
        let manager = GitRepositoryManager::new(std::env::temp_dir());
        let err = manager
            .checkout(&CheckoutRequest {
                repo: "definitely not a repo".into(),
                ..CheckoutRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInvocation(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_commit_on_local_directory_is_rejected() {
        let repo = TempDir::new().unwrap();
        let manager = GitRepositoryManager::new(repo.path());
        let err = manager
            .checkout(&CheckoutRequest {
                repo: repo.path().display().to_string(),
                branch: None,
                commit: Some("abc".into()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInvocation(_)));
    }

    #[tokio::test]
    async fn test_option_like_repository_is_rejected() {
        let root = TempDir::new().unwrap();
        let manager = GitRepositoryManager::new(root.path());
        let repo = "--upload-pack=touch pwned@host:org/repo.git";
        assert!(repo_name_from_url(repo).is_some());

        let err = manager
            .checkout(&CheckoutRequest {
                repo: repo.into(),
                ..CheckoutRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInvocation(_)));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
