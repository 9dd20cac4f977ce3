//! Docker engine driven through the `docker` CLI.

use super::traits::{ContainerEngine, ContainerLogs, ContainerSpec};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    async fn output(&self, args: &[&str]) -> Result<Output> {
        debug!("🐳 {} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                AppError::ContainerError(format!("Failed to execute {}: {}", self.binary, e))
            })
    }

    /// Runs a command and fails on a non-zero exit status.
    async fn run(&self, args: &[&str]) -> Result<Output> {
        let output = self.output(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::ContainerError(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(output)
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

fn is_missing(output: &Output) -> bool {
    String::from_utf8_lossy(&output.stderr).contains("No such")
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn create_volume(&self, name: &str) -> Result<()> {
        self.run(&["volume", "create", name]).await?;
        info!("📦 Created volume {}", name);
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let output = self.output(&["volume", "rm", "-f", name]).await?;
        if !output.status.success() && !is_missing(&output) {
            return Err(AppError::ContainerError(format!(
                "Failed to remove volume {}: {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!("🧹 Removed volume {}", name);
        Ok(())
    }

    async fn seed_volume(&self, volume: &str, source: &Path, image: &str) -> Result<()> {
        let source_mount = format!("{}:/src:ro", source.display());
        let volume_mount = format!("{}:/app", volume);
        self.run(&[
            "run",
            "--rm",
            "-v",
            &source_mount,
            "-v",
            &volume_mount,
            image,
            "sh",
            "-c",
            "cp -a /src/. /app/",
        ])
        .await?;
        debug!("Seeded volume {} from {}", volume, source.display());
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<()> {
        let mount = format!("{}:{}", spec.volume, spec.mount_path);
        info!(
            "🐳 Starting container {} with image {}",
            spec.name, spec.image
        );
        self.run(&[
            "run",
            "-d",
            "--name",
            &spec.name,
            "-v",
            &mount,
            "-w",
            &spec.working_dir,
            &spec.image,
            "sh",
            "-c",
            &spec.command,
        ])
        .await?;
        Ok(())
    }

    async fn wait_container(&self, name: &str) -> Result<i64> {
        let output = self.run(&["wait", name]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout.trim().parse::<i64>().map_err(|e| {
            AppError::ContainerError(format!(
                "Unexpected exit code '{}' for {}: {}",
                stdout.trim(),
                name,
                e
            ))
        })
    }

    async fn container_logs(&self, name: &str) -> Result<ContainerLogs> {
        let output = self.run(&["logs", name]).await?;
        Ok(ContainerLogs {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn copy_from_container(&self, name: &str, path: &str) -> Result<Vec<u8>> {
        let source = format!("{}:{}", name, path);
        let output = self.run(&["cp", &source, "-"]).await?;
        Ok(output.stdout)
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        let output = self.output(&["stop", name]).await?;
        if !output.status.success() {
            if is_missing(&output) {
                debug!("Container {} already gone", name);
                return Ok(());
            }
            warn!(
                "⚠️ Failed to stop container {}: {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Err(AppError::ContainerError(format!(
                "Failed to stop container {}",
                name
            )));
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let output = self.output(&["rm", "-f", name]).await?;
        if !output.status.success() && !is_missing(&output) {
            return Err(AppError::ContainerError(format!(
                "Failed to remove container {}: {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}
