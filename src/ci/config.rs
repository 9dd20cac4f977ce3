//! Validated pipeline configuration.
//!
//! These types are produced only by the config checker; every field is
//! populated with its resolved default. The raw YAML stays weakly typed in
//! [`crate::ci::yaml_parser::DocumentTree`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

pub const DEFAULT_REGISTRY: &str = "dockerhub";
pub const DEFAULT_STAGES: [&str; 4] = ["build", "test", "doc", "deploy"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConfig {
    pub registry: String,
    pub image: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            registry: DEFAULT_REGISTRY.to_string(),
            image: String::new(),
        }
    }
}

impl DockerConfig {
    /// Image reference handed to the container engine.
    ///
    /// Images from a registry other than Docker Hub are prefixed with the
    /// registry host unless they already carry it.
    pub fn image_reference(&self) -> String {
        let registry = self.registry.trim_end_matches('/');
        if registry.is_empty()
            || registry == DEFAULT_REGISTRY
            || self.image.starts_with(&format!("{}/", registry))
        {
            self.image.clone()
        } else {
            format!("{}/{}", registry, self.image)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub pipeline_name: String,
    pub docker: DockerConfig,
    pub artifact_upload_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactConfig {
    pub on_success_only: bool,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub stage: String,
    pub allow_failure: bool,
    pub needs: Vec<String>,
    pub docker: DockerConfig,
    pub artifact_upload_path: Option<String>,
    pub scripts: Vec<String>,
    pub artifacts: Option<ArtifactConfig>,
}

impl JobConfig {
    /// Shell command running every script in order, stopping at the first failure.
    pub fn shell_command(&self) -> String {
        self.scripts.join(" && ")
    }
}

/// Execution plan for one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePlan {
    /// Each job mapped to the jobs that need it, in declaration order.
    pub job_graph: IndexMap<String, Vec<String>>,
    /// Topological layers; jobs within a layer are independent.
    pub job_groups: Vec<Vec<String>>,
}

impl StagePlan {
    pub fn execution_order(&self) -> impl Iterator<Item = &String> {
        self.job_groups.iter().flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub global: GlobalConfig,
    pub stages: IndexMap<String, StagePlan>,
    pub jobs: IndexMap<String, JobConfig>,
}

impl PipelineConfig {
    pub fn pipeline_name(&self) -> &str {
        &self.global.pipeline_name
    }

    /// `(stage, job)` pairs in planned execution order.
    pub fn execution_order(&self) -> Vec<(&str, &str)> {
        self.stages
            .iter()
            .flat_map(|(stage, plan)| {
                plan.execution_order()
                    .map(move |job| (stage.as_str(), job.as_str()))
            })
            .collect()
    }

    /// Re-emits the resolved configuration as a pipeline document.
    ///
    /// Validating the result yields a configuration equal to `self`.
    pub fn to_document(&self) -> Value {
        let mut root = Mapping::new();
        root.insert(str_value("global"), self.global_document());
        root.insert(
            str_value("stages"),
            Value::Sequence(self.stages.keys().map(|s| str_value(s)).collect()),
        );

        let mut jobs = Mapping::new();
        for (name, job) in &self.jobs {
            jobs.insert(str_value(name), job_document(job));
        }
        root.insert(str_value("jobs"), Value::Mapping(jobs));

        Value::Mapping(root)
    }

    /// Document emitted by dry runs: `global` plus jobs in execution order,
    /// each carrying its resolved stage.
    pub fn to_flattened_document(&self) -> Value {
        let mut root = Mapping::new();
        root.insert(str_value("global"), self.global_document());

        let mut jobs = Mapping::new();
        for (_, job_name) in self.execution_order() {
            if let Some(job) = self.jobs.get(job_name) {
                jobs.insert(str_value(job_name), job_document(job));
            }
        }
        root.insert(str_value("jobs"), Value::Mapping(jobs));

        Value::Mapping(root)
    }

    fn global_document(&self) -> Value {
        let mut global = Mapping::new();
        global.insert(
            str_value("pipeline_name"),
            str_value(&self.global.pipeline_name),
        );
        global.insert(str_value("docker"), docker_document(&self.global.docker));
        global.insert(
            str_value("artifact_upload_path"),
            str_value(&self.global.artifact_upload_path),
        );
        Value::Mapping(global)
    }
}

fn str_value(value: &str) -> Value {
    Value::String(value.to_string())
}

fn string_list(values: &[String]) -> Value {
    Value::Sequence(values.iter().map(|v| str_value(v)).collect())
}

fn docker_document(docker: &DockerConfig) -> Value {
    let mut map = Mapping::new();
    map.insert(str_value("registry"), str_value(&docker.registry));
    map.insert(str_value("image"), str_value(&docker.image));
    Value::Mapping(map)
}

fn job_document(job: &JobConfig) -> Value {
    let mut map = Mapping::new();
    map.insert(str_value("stage"), str_value(&job.stage));
    map.insert(str_value("allow_failure"), Value::Bool(job.allow_failure));
    map.insert(str_value("needs"), string_list(&job.needs));
    map.insert(str_value("docker"), docker_document(&job.docker));
    if let Some(path) = &job.artifact_upload_path {
        map.insert(str_value("artifact_upload_path"), str_value(path));
    }
    map.insert(str_value("scripts"), string_list(&job.scripts));
    if let Some(artifacts) = &job.artifacts {
        let mut artifact_map = Mapping::new();
        artifact_map.insert(
            str_value("on_success_only"),
            Value::Bool(artifacts.on_success_only),
        );
        artifact_map.insert(str_value("paths"), string_list(&artifacts.paths));
        map.insert(str_value("artifacts"), Value::Mapping(artifact_map));
    }
    Value::Mapping(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_reference() {
        let hub = DockerConfig {
            registry: "dockerhub".into(),
            image: "rust:1.75".into(),
        };
        assert_eq!(hub.image_reference(), "rust:1.75");

        let private = DockerConfig {
            registry: "ghcr.io/acme".into(),
            image: "builder:latest".into(),
        };
        assert_eq!(private.image_reference(), "ghcr.io/acme/builder:latest");

        let qualified = DockerConfig {
            registry: "ghcr.io".into(),
            image: "ghcr.io/acme/builder".into(),
        };
        assert_eq!(qualified.image_reference(), "ghcr.io/acme/builder");
    }

    #[test]
    fn test_shell_command_chains_scripts() {
        let job = JobConfig {
            stage: "build".into(),
            allow_failure: false,
            needs: vec![],
            docker: DockerConfig::default(),
            artifact_upload_path: None,
            scripts: vec!["cargo fmt --check".into(), "cargo build".into()],
            artifacts: None,
        };
        assert_eq!(job.shell_command(), "cargo fmt --check && cargo build");
    }
}
