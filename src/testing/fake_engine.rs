use crate::ci::connectors::{ContainerEngine, ContainerLogs, ContainerSpec};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Scripted behaviour of one job in a [`FakeContainerEngine`].
#[derive(Debug, Clone, Default)]
pub struct FakeJob {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    /// How long the container "runs" before exiting on its own.
    pub duration: Option<Duration>,
    /// Makes `run_container` fail.
    pub start_error: Option<String>,
    /// Files available to `copy_from_container`, keyed by absolute path.
    pub files: HashMap<String, Vec<u8>>,
}

impl FakeJob {
    pub fn succeeding(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            ..Self::default()
        }
    }

    pub fn failing(stderr: &str) -> Self {
        Self {
            stderr: stderr.to_string(),
            exit_code: 1,
            ..Self::default()
        }
    }

    pub fn running_for(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_file(mut self, path: &str, bytes: &[u8]) -> Self {
        self.files.insert(path.to_string(), bytes.to_vec());
        self
    }
}

#[derive(Default)]
struct FakeState {
    jobs: HashMap<String, FakeJob>,
    volumes: HashSet<String>,
    removed_volumes: Vec<String>,
    seeded: Vec<(String, PathBuf)>,
    containers: HashMap<String, String>,
    started: Vec<String>,
    stopped: HashSet<String>,
    specs: Vec<ContainerSpec>,
    active: usize,
    max_active: usize,
}

/// In-process container engine for tests.
///
/// Containers are matched to scripted jobs by stripping the `<volume>-`
/// prefix from the container name. Unscripted jobs succeed with no output.
#[derive(Default)]
pub struct FakeContainerEngine {
    state: Mutex<FakeState>,
    notify: Arc<Notify>,
}

impl FakeContainerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job(self, job_name: &str, job: FakeJob) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.jobs.insert(job_name.to_string(), job);
        }
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Job names in the order their containers were started.
    pub fn started_jobs(&self) -> Vec<String> {
        self.lock().started.clone()
    }

    pub fn container_specs(&self) -> Vec<ContainerSpec> {
        self.lock().specs.clone()
    }

    pub fn live_volumes(&self) -> Vec<String> {
        self.lock().volumes.iter().cloned().collect()
    }

    pub fn removed_volumes(&self) -> Vec<String> {
        self.lock().removed_volumes.clone()
    }

    pub fn seeded_volumes(&self) -> Vec<(String, PathBuf)> {
        self.lock().seeded.clone()
    }

    pub fn stopped_containers(&self) -> Vec<String> {
        self.lock().stopped.iter().cloned().collect()
    }

    /// Highest number of containers that were running at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.lock().max_active
    }

    fn job_for(&self, container: &str) -> Result<(String, FakeJob)> {
        let state = self.lock();
        let job_name = state
            .containers
            .get(container)
            .cloned()
            .ok_or_else(|| AppError::ContainerError(format!("No such container: {}", container)))?;
        let job = state.jobs.get(&job_name).cloned().unwrap_or_default();
        Ok((job_name, job))
    }
}

#[async_trait]
impl ContainerEngine for FakeContainerEngine {
    async fn create_volume(&self, name: &str) -> Result<()> {
        self.lock().volumes.insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.volumes.remove(name);
        state.removed_volumes.push(name.to_string());
        Ok(())
    }

    async fn seed_volume(&self, volume: &str, source: &Path, _image: &str) -> Result<()> {
        self.lock()
            .seeded
            .push((volume.to_string(), source.to_path_buf()));
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<()> {
        let mut state = self.lock();
        if !state.volumes.contains(&spec.volume) {
            return Err(AppError::ContainerError(format!(
                "No such volume: {}",
                spec.volume
            )));
        }
        let job_name = spec
            .name
            .strip_prefix(&format!("{}-", spec.volume))
            .unwrap_or(&spec.name)
            .to_string();
        if let Some(message) = state.jobs.get(&job_name).and_then(|j| j.start_error.clone()) {
            return Err(AppError::ContainerError(message));
        }

        state.containers.insert(spec.name.clone(), job_name.clone());
        state.started.push(job_name);
        state.specs.push(spec.clone());
        state.active += 1;
        state.max_active = state.max_active.max(state.active);
        Ok(())
    }

    async fn wait_container(&self, name: &str) -> Result<i64> {
        let (_, job) = self.job_for(name)?;

        if let Some(duration) = job.duration {
            let deadline = tokio::time::Instant::now() + duration;
            loop {
                let notified = self.notify.notified();
                if self.lock().stopped.contains(name) {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = notified => {}
                }
            }
        }

        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
        if state.stopped.contains(name) {
            Ok(137)
        } else {
            Ok(job.exit_code)
        }
    }

    async fn container_logs(&self, name: &str) -> Result<ContainerLogs> {
        let (_, job) = self.job_for(name)?;
        Ok(ContainerLogs {
            stdout: job.stdout,
            stderr: job.stderr,
        })
    }

    async fn copy_from_container(&self, name: &str, path: &str) -> Result<Vec<u8>> {
        let (_, job) = self.job_for(name)?;
        job.files.get(path).cloned().ok_or_else(|| {
            AppError::ContainerError(format!(
                "Could not find the file {} in container {}",
                path, name
            ))
        })
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.lock().stopped.insert(name.to_string());
        self.notify.notify_waiters();
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.lock().containers.remove(name);
        Ok(())
    }
}
