//! Pipeline configuration checker
//!
//! Validates a parsed pipeline document in three passes (global section,
//! stages and job dependencies, jobs), filling every default and building a
//! per-stage execution plan. Errors are accumulated across all passes so one
//! invocation reports as much as possible.

use crate::ci::config::{
    ArtifactConfig, DockerConfig, GlobalConfig, JobConfig, PipelineConfig, StagePlan,
    DEFAULT_REGISTRY, DEFAULT_STAGES,
};
use crate::ci::graph::topological_groups;
use crate::ci::yaml_locator::join_path;
use crate::ci::yaml_parser::DocumentTree;
use crate::error::{AppError, Result};
use indexmap::IndexMap;
use serde_yaml::{Mapping, Value};
use std::collections::{HashMap, HashSet};
use tracing::debug;

const TOP_LEVEL_KEYS: &[&str] = &["global", "stages", "jobs"];
const GLOBAL_KEYS: &[&str] = &["pipeline_name", "docker", "artifact_upload_path"];
const DOCKER_KEYS: &[&str] = &["registry", "image"];
const JOB_KEYS: &[&str] = &[
    "stage",
    "allow_failure",
    "needs",
    "docker",
    "artifact_upload_path",
    "scripts",
    "artifacts",
];
const ARTIFACT_KEYS: &[&str] = &["on_success_only", "paths"];

/// Outcome of a validation run.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub valid: bool,
    /// Newline-joined accumulation of every error found.
    pub error_msg: String,
    /// Present only when `valid` is true.
    pub pipeline_config: Option<PipelineConfig>,
}

impl ValidationResult {
    pub fn into_result(self) -> Result<PipelineConfig> {
        match self.pipeline_config {
            Some(config) if self.valid => Ok(config),
            _ => Err(AppError::ConfigError(self.error_msg)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigChecker;

impl ConfigChecker {
    pub fn new() -> Self {
        Self
    }

    /// Validates `document` and resolves it into a [`PipelineConfig`].
    ///
    /// `pipeline_name` and `file_name` label the error messages; with
    /// `error_lc` each message also carries the source line and column.
    pub fn validate(
        &self,
        pipeline_name: &str,
        document: &DocumentTree,
        file_name: Option<&str>,
        error_lc: bool,
    ) -> ValidationResult {
        let mut pass = CheckPass {
            label: match file_name {
                Some(file) => format!("{} ({})", pipeline_name, file),
                None => pipeline_name.to_string(),
            },
            document,
            error_lc,
            errors: Vec::new(),
            job_stage: HashMap::new(),
            job_needs: HashMap::new(),
        };

        let config = pass.run();
        debug!(
            pipeline = pipeline_name,
            errors = pass.errors.len(),
            "Pipeline validation finished"
        );

        match config {
            Some(config) if pass.errors.is_empty() => ValidationResult {
                valid: true,
                error_msg: String::new(),
                pipeline_config: Some(config),
            },
            _ => ValidationResult {
                valid: false,
                error_msg: pass.errors.join("\n"),
                pipeline_config: None,
            },
        }
    }
}

struct CheckPass<'a> {
    label: String,
    document: &'a DocumentTree,
    error_lc: bool,
    errors: Vec<String>,
    /// Stage of every job whose `stage` key resolved to a declared stage.
    job_stage: HashMap<String, String>,
    /// Dependencies that passed the stage-level checks.
    job_needs: HashMap<String, Vec<String>>,
}

impl<'a> CheckPass<'a> {
    fn run(&mut self) -> Option<PipelineConfig> {
        let document = self.document;
        let Some(root) = document.root().as_mapping() else {
            self.error("", "pipeline document must be a mapping");
            return None;
        };

        self.check_unknown_keys(root, "", TOP_LEVEL_KEYS);

        let global = self.check_global(root);
        let stages = self.check_stages(root);
        let jobs = self.check_jobs(root, global.as_ref());

        Some(PipelineConfig {
            global: global?,
            stages: stages?,
            jobs: jobs?,
        })
    }

    // Pass 1: global section.

    fn check_global(&mut self, root: &Mapping) -> Option<GlobalConfig> {
        let before = self.errors.len();

        let global = match root.get("global") {
            None | Some(Value::Null) => {
                self.error("global", "missing required section 'global'");
                return None;
            }
            Some(Value::Mapping(global)) => global,
            Some(_) => {
                self.error("global", "expected a mapping");
                return None;
            }
        };
        self.check_unknown_keys(global, "global", GLOBAL_KEYS);

        let pipeline_name = match self.string_field(global, "global", "pipeline_name") {
            Ok(Some(name)) => {
                if name.is_empty() {
                    self.error("global.pipeline_name", "must not be empty");
                } else if name.contains('.') || name.starts_with('$') {
                    self.error(
                        "global.pipeline_name",
                        "must not contain '.' or start with '$'",
                    );
                }
                name
            }
            Ok(None) => {
                self.error("global.pipeline_name", "missing required key 'pipeline_name'");
                String::new()
            }
            Err(()) => String::new(),
        };

        let docker = self
            .docker_field(global, "global", &DockerConfig::default())
            .unwrap_or_default();

        let artifact_upload_path = self
            .string_field(global, "global", "artifact_upload_path")
            .ok()
            .flatten()
            .unwrap_or_default();

        (self.errors.len() == before).then_some(GlobalConfig {
            pipeline_name,
            docker,
            artifact_upload_path,
        })
    }

    // Pass 2: stages and per-stage dependency graphs.

    fn check_stages(&mut self, root: &Mapping) -> Option<IndexMap<String, StagePlan>> {
        let before = self.errors.len();

        let stage_names = self.stage_names(root)?;
        let jobs = self.jobs_mapping(root)?;

        let mut stage_jobs: IndexMap<String, Vec<String>> = stage_names
            .iter()
            .map(|stage| (stage.clone(), Vec::new()))
            .collect();

        for (key, value) in jobs {
            let Some(job_name) = self.job_name(key) else {
                continue;
            };
            let Some(job) = value.as_mapping() else {
                continue;
            };
            let job_path = join_path("jobs", &job_name);

            match self.string_field(job, &job_path, "stage") {
                Ok(Some(stage)) => match stage_jobs.get_mut(&stage) {
                    Some(members) => {
                        members.push(job_name.clone());
                        self.job_stage.insert(job_name, stage);
                    }
                    None => self.error(
                        &join_path(&job_path, "stage"),
                        format!(
                            "job '{}' references unknown stage '{}' (declared stages: {})",
                            job_name,
                            stage,
                            stage_names.join(", ")
                        ),
                    ),
                },
                Ok(None) => self.error(
                    &job_path,
                    format!("job '{}' has no 'stage' key", job_name),
                ),
                Err(()) => {}
            }
        }

        let mut plans = IndexMap::new();
        for (stage, members) in &stage_jobs {
            if members.is_empty() {
                self.error("stages", format!("stage '{}' has no jobs", stage));
                continue;
            }
            if let Some(plan) = self.plan_stage(stage, members, jobs) {
                plans.insert(stage.clone(), plan);
            }
        }

        (self.errors.len() == before).then_some(plans)
    }

    fn stage_names(&mut self, root: &Mapping) -> Option<Vec<String>> {
        let defaults = || -> Vec<String> { DEFAULT_STAGES.iter().map(|s| s.to_string()).collect() };

        let items = match root.get("stages") {
            None | Some(Value::Null) => return Some(defaults()),
            Some(Value::Sequence(items)) if items.is_empty() => return Some(defaults()),
            Some(Value::Sequence(items)) => items,
            Some(_) => {
                self.error("stages", "expected a list of stage names");
                return None;
            }
        };

        let mut names = Vec::with_capacity(items.len());
        let mut ok = true;
        for (idx, item) in items.iter().enumerate() {
            let path = join_path("stages", &idx.to_string());
            match item.as_str() {
                Some(name) if names.iter().any(|n| n == name) => {
                    self.error(&path, format!("stage '{}' is declared more than once", name));
                    ok = false;
                }
                Some(name) => names.push(name.to_string()),
                None => {
                    self.error(&path, "stage names must be strings");
                    ok = false;
                }
            }
        }
        ok.then_some(names)
    }

    fn jobs_mapping<'m>(&mut self, root: &'m Mapping) -> Option<&'m Mapping> {
        match root.get("jobs") {
            None | Some(Value::Null) => {
                self.error("jobs", "missing required section 'jobs'");
                None
            }
            Some(Value::Mapping(jobs)) => Some(jobs),
            Some(_) => {
                self.error("jobs", "expected a mapping of job names to job definitions");
                None
            }
        }
    }

    fn plan_stage(
        &mut self,
        stage: &str,
        members: &[String],
        jobs: &Mapping,
    ) -> Option<StagePlan> {
        let before = self.errors.len();
        let mut job_graph: IndexMap<String, Vec<String>> = members
            .iter()
            .map(|job| (job.clone(), Vec::new()))
            .collect();

        for job_name in members {
            let job_path = join_path("jobs", job_name);
            let needs_path = join_path(&job_path, "needs");
            let needs = match jobs.get(job_name.as_str()).and_then(|job| job.get("needs")) {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Sequence(needs)) => needs.clone(),
                Some(_) => {
                    self.error(&needs_path, "needs must be a list of job names");
                    continue;
                }
            };

            let mut resolved: Vec<String> = Vec::new();
            for (idx, need) in needs.iter().enumerate() {
                let need_path = join_path(&needs_path, &idx.to_string());
                let Some(need) = need.as_str() else {
                    self.error(&need_path, "job names in needs must be strings");
                    continue;
                };

                if need == job_name {
                    self.error(
                        &need_path,
                        format!("job '{}' cannot depend on itself", job_name),
                    );
                } else if resolved.iter().any(|n| n == need) {
                    self.error(
                        &need_path,
                        format!("job '{}' lists '{}' more than once", job_name, need),
                    );
                } else if !jobs.contains_key(need) {
                    self.error(
                        &need_path,
                        format!("job '{}' needs unknown job '{}'", job_name, need),
                    );
                } else {
                    match self.job_stage.get(need) {
                        Some(need_stage) if need_stage == stage => {
                            resolved.push(need.to_string());
                            if let Some(consumers) = job_graph.get_mut(need) {
                                consumers.push(job_name.clone());
                            }
                        }
                        Some(need_stage) => self.error(
                            &need_path,
                            format!(
                                "job '{}' in stage '{}' needs '{}' from stage '{}'; \
                                 dependencies must stay within one stage",
                                job_name, stage, need, need_stage
                            ),
                        ),
                        // The needed job's own stage is already reported.
                        None => {}
                    }
                }
            }
            self.job_needs.insert(job_name.clone(), resolved);
        }

        if self.errors.len() != before {
            return None;
        }

        match topological_groups(&job_graph) {
            Ok(job_groups) => Some(StagePlan {
                job_graph,
                job_groups,
            }),
            Err(cycle) => {
                let path = join_path(&join_path("jobs", &cycle[0]), "needs");
                self.error(
                    &path,
                    format!(
                        "dependency cycle in stage '{}' between jobs [{}]",
                        stage,
                        cycle.join(", ")
                    ),
                );
                None
            }
        }
    }

    // Pass 3: jobs.

    fn check_jobs(
        &mut self,
        root: &Mapping,
        global: Option<&GlobalConfig>,
    ) -> Option<IndexMap<String, JobConfig>> {
        let before = self.errors.len();
        let jobs = root.get("jobs")?.as_mapping()?;
        let mut resolved = IndexMap::new();

        for (key, value) in jobs {
            // Non-string names are reported while grouping jobs by stage.
            let Some(job_name) = key.as_str().map(str::to_string) else {
                continue;
            };
            let job_path = join_path("jobs", &job_name);
            let Some(job) = value.as_mapping() else {
                self.error(&job_path, "job definition must be a mapping");
                continue;
            };
            if let Some(config) = self.check_job(&job_name, &job_path, job, global) {
                resolved.insert(job_name, config);
            }
        }

        (self.errors.len() == before).then_some(resolved)
    }

    fn check_job(
        &mut self,
        job_name: &str,
        job_path: &str,
        job: &Mapping,
        global: Option<&GlobalConfig>,
    ) -> Option<JobConfig> {
        let before = self.errors.len();
        self.check_unknown_keys(job, job_path, JOB_KEYS);

        let scripts = match self.string_list_field(job, job_path, "scripts") {
            Ok(Some(scripts)) if scripts.is_empty() => {
                self.error(&join_path(job_path, "scripts"), "scripts must not be empty");
                Vec::new()
            }
            Ok(Some(scripts)) => scripts,
            Ok(None) => {
                self.error(job_path, format!("job '{}' has no 'scripts' key", job_name));
                Vec::new()
            }
            Err(()) => Vec::new(),
        };

        let allow_failure = self
            .bool_field(job, job_path, "allow_failure")
            .ok()
            .flatten()
            .unwrap_or(false);

        let inherited_docker = global.map(|g| g.docker.clone()).unwrap_or_default();
        let docker = self.docker_field(job, job_path, &inherited_docker);
        if let (Some(docker), Some(_)) = (&docker, global) {
            if docker.image.is_empty() {
                self.error(
                    job_path,
                    format!(
                        "job '{}' has no docker image; set {}.docker.image or global.docker.image",
                        job_name, job_path
                    ),
                );
            }
        }

        let artifact_upload_path = match self.string_field(job, job_path, "artifact_upload_path")
        {
            Ok(Some(path)) => Some(path),
            Ok(None) => global
                .map(|g| g.artifact_upload_path.clone())
                .filter(|path| !path.is_empty()),
            Err(()) => None,
        };

        let artifacts = self.artifacts_field(job, job_path);
        if let (Some(_), Some(_)) = (&artifacts, global) {
            if artifact_upload_path.as_deref().unwrap_or("").is_empty() {
                self.error(
                    &join_path(job_path, "artifacts"),
                    format!(
                        "job '{}' declares artifacts but no artifact_upload_path is set \
                         on the job or in global",
                        job_name
                    ),
                );
            }
        }

        if self.errors.len() != before {
            return None;
        }

        Some(JobConfig {
            stage: self.job_stage.get(job_name)?.clone(),
            allow_failure,
            needs: self.job_needs.get(job_name).cloned().unwrap_or_default(),
            docker: docker?,
            artifact_upload_path,
            scripts,
            artifacts,
        })
    }

    fn artifacts_field(&mut self, job: &Mapping, job_path: &str) -> Option<ArtifactConfig> {
        let path = join_path(job_path, "artifacts");
        let artifacts = match job.get("artifacts") {
            None | Some(Value::Null) => return None,
            Some(Value::Mapping(artifacts)) => artifacts,
            Some(_) => {
                self.error(&path, "expected a mapping with 'paths' and 'on_success_only'");
                return None;
            }
        };
        self.check_unknown_keys(artifacts, &path, ARTIFACT_KEYS);

        let paths = match self.string_list_field(artifacts, &path, "paths") {
            Ok(Some(paths)) if !paths.is_empty() => Some(paths),
            Ok(Some(_)) => {
                self.error(&join_path(&path, "paths"), "paths must not be empty");
                None
            }
            Ok(None) => {
                self.error(&path, "missing required key 'paths'");
                None
            }
            Err(()) => None,
        };
        let on_success_only = self
            .bool_field(artifacts, &path, "on_success_only")
            .ok()
            .flatten()
            .unwrap_or(true);

        Some(ArtifactConfig {
            on_success_only,
            paths: paths?,
        })
    }

    // Field helpers. `Err(())` means an error was already recorded.

    fn docker_field(
        &mut self,
        map: &Mapping,
        parent: &str,
        inherited: &DockerConfig,
    ) -> Option<DockerConfig> {
        let path = join_path(parent, "docker");
        let docker = match map.get("docker") {
            None | Some(Value::Null) => return Some(inherited.clone()),
            Some(Value::Mapping(docker)) => docker,
            Some(_) => {
                self.error(&path, "expected a mapping with 'registry' and 'image'");
                return None;
            }
        };
        self.check_unknown_keys(docker, &path, DOCKER_KEYS);

        let registry = self.string_field(docker, &path, "registry").ok()?;
        let image = self.string_field(docker, &path, "image").ok()?;

        Some(DockerConfig {
            registry: registry.unwrap_or_else(|| {
                if inherited.registry.is_empty() {
                    DEFAULT_REGISTRY.to_string()
                } else {
                    inherited.registry.clone()
                }
            }),
            image: image.unwrap_or_else(|| inherited.image.clone()),
        })
    }

    fn string_field(
        &mut self,
        map: &Mapping,
        parent: &str,
        key: &str,
    ) -> std::result::Result<Option<String>, ()> {
        match map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(other) => {
                self.error(
                    &join_path(parent, key),
                    format!("expected a string, found {}", describe(other)),
                );
                Err(())
            }
        }
    }

    fn bool_field(
        &mut self,
        map: &Mapping,
        parent: &str,
        key: &str,
    ) -> std::result::Result<Option<bool>, ()> {
        match map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(value)) => Ok(Some(*value)),
            Some(Value::String(value)) if value.eq_ignore_ascii_case("true") => Ok(Some(true)),
            Some(Value::String(value)) if value.eq_ignore_ascii_case("false") => Ok(Some(false)),
            Some(other) => {
                self.error(
                    &join_path(parent, key),
                    format!("expected a boolean, found {}", describe(other)),
                );
                Err(())
            }
        }
    }

    fn string_list_field(
        &mut self,
        map: &Mapping,
        parent: &str,
        key: &str,
    ) -> std::result::Result<Option<Vec<String>>, ()> {
        let path = join_path(parent, key);
        let items = match map.get(key) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Sequence(items)) => items,
            Some(other) => {
                self.error(
                    &path,
                    format!("expected a list of strings, found {}", describe(other)),
                );
                return Err(());
            }
        };

        let mut values = Vec::with_capacity(items.len());
        let mut ok = true;
        for (idx, item) in items.iter().enumerate() {
            match item {
                Value::String(value) => values.push(value.clone()),
                other => {
                    self.error(
                        &join_path(&path, &idx.to_string()),
                        format!("expected a string, found {}", describe(other)),
                    );
                    ok = false;
                }
            }
        }
        if ok {
            Ok(Some(values))
        } else {
            Err(())
        }
    }

    fn job_name(&mut self, key: &Value) -> Option<String> {
        match key {
            Value::String(name) => Some(name.clone()),
            other => {
                self.error("jobs", format!("job names must be strings, found {}", describe(other)));
                None
            }
        }
    }

    fn check_unknown_keys(&mut self, map: &Mapping, parent: &str, allowed: &[&str]) {
        let mut seen = HashSet::new();
        for key in map.keys() {
            let name = key.as_str().map(str::to_string).unwrap_or_else(|| describe(key));
            if !allowed.contains(&name.as_str()) && seen.insert(name.clone()) {
                let section = if parent.is_empty() { "document" } else { parent };
                self.error(
                    &join_path(parent, &name),
                    format!(
                        "unknown key '{}' in {} (expected one of: {})",
                        name,
                        section,
                        allowed.join(", ")
                    ),
                );
            }
        }
    }

    fn error(&mut self, path: &str, message: impl Into<String>) {
        let message = message.into();
        let subject = if path.is_empty() { "<root>" } else { path };
        let mut line = format!("[{}] {}: {}", self.label, subject, message);
        if self.error_lc {
            if let Some(location) = self.locate(path) {
                line.push_str(&format!(" ({})", location));
            }
        }
        self.errors.push(line);
    }

    /// Location of `path`, falling back to its closest located ancestor.
    fn locate(&self, path: &str) -> Option<crate::ci::yaml_locator::Location> {
        let mut current = path;
        loop {
            if current.is_empty() {
                return None;
            }
            if let Some(location) = self.document.location(current) {
                return Some(location);
            }
            current = match current.rfind('.') {
                Some(idx) => &current[..idx],
                None => "",
            };
        }
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("boolean {}", b),
        Value::Number(n) => format!("number {}", n),
        Value::String(s) => format!("string '{}'", s),
        Value::Sequence(_) => "a list".to_string(),
        Value::Mapping(_) => "a mapping".to_string(),
        Value::Tagged(tagged) => format!("tagged value {}", tagged.tag),
    }
}
