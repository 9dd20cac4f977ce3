use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// A detached container to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Passed to `sh -c`.
    pub command: String,
    pub volume: String,
    pub mount_path: String,
    pub working_dir: String,
}

/// Output of a finished container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerLogs {
    pub stdout: String,
    pub stderr: String,
}

impl ContainerLogs {
    /// Everything the container printed, stdout first.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => {
                let mut combined = self.stdout.clone();
                if !combined.ends_with('\n') {
                    combined.push('\n');
                }
                combined.push_str(&self.stderr);
                combined
            }
        }
    }
}

/// Container runtime used by the job runner.
///
/// Implementations must be safe to share between concurrently running jobs.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn create_volume(&self, name: &str) -> Result<()>;

    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Copies the contents of `source` into the root of `volume`.
    async fn seed_volume(&self, volume: &str, source: &Path, image: &str) -> Result<()>;

    /// Starts a detached container.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<()>;

    /// Blocks until the container exits and returns its exit code.
    async fn wait_container(&self, name: &str) -> Result<i64>;

    async fn container_logs(&self, name: &str) -> Result<ContainerLogs>;

    /// Reads `path` out of the container as a tar stream.
    async fn copy_from_container(&self, name: &str, path: &str) -> Result<Vec<u8>>;

    /// Stops the container. Stopping a missing or finished container succeeds.
    async fn stop_container(&self, name: &str) -> Result<()>;

    async fn remove_container(&self, name: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_logs() {
        let logs = ContainerLogs {
            stdout: "compiling".into(),
            stderr: "warning: unused".into(),
        };
        assert_eq!(logs.combined(), "compiling\nwarning: unused");

        let only_err = ContainerLogs {
            stdout: String::new(),
            stderr: "fatal: boom\n".into(),
        };
        assert_eq!(only_err.combined(), "fatal: boom\n");
    }
}
