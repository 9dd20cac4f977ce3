//! Dry-run rendering of a resolved pipeline.

use crate::ci::config::{JobConfig, PipelineConfig};
use crate::error::Result;
use std::fmt::Write;

/// Renders the execution plan, stage by stage and group by group.
pub fn format_plaintext(config: &PipelineConfig) -> String {
    let mut out = String::new();
    let global = &config.global;
    let _ = writeln!(out, "Pipeline: {}", global.pipeline_name);
    if !global.docker.image.is_empty() {
        let _ = writeln!(out, "Image: {}", global.docker.image_reference());
    }
    if !global.artifact_upload_path.is_empty() {
        let _ = writeln!(out, "Artifact upload path: {}", global.artifact_upload_path);
    }

    for (stage, plan) in &config.stages {
        let _ = writeln!(out, "\nStage: {}", stage);
        for (idx, group) in plan.job_groups.iter().enumerate() {
            let _ = writeln!(out, "  Group {}: {}", idx + 1, group.join(", "));
            for job_name in group {
                if let Some(job) = config.jobs.get(job_name) {
                    write_job(&mut out, job_name, job);
                }
            }
        }
    }
    out
}

fn write_job(out: &mut String, name: &str, job: &JobConfig) {
    let _ = writeln!(out, "    Job: {}", name);
    let _ = writeln!(out, "      image: {}", job.docker.image_reference());
    let _ = writeln!(out, "      allow_failure: {}", job.allow_failure);
    if !job.needs.is_empty() {
        let _ = writeln!(out, "      needs: {}", job.needs.join(", "));
    }
    let _ = writeln!(out, "      scripts:");
    for script in &job.scripts {
        let _ = writeln!(out, "        - {}", script);
    }
    if let Some(artifacts) = &job.artifacts {
        let _ = writeln!(
            out,
            "      artifacts: {} (on_success_only: {}) -> {}",
            artifacts.paths.join(", "),
            artifacts.on_success_only,
            job.artifact_upload_path.as_deref().unwrap_or_default()
        );
    }
}

/// Re-emits the pipeline as YAML with top-level `global` and `jobs`.
pub fn format_yaml(config: &PipelineConfig) -> Result<String> {
    Ok(serde_yaml::to_string(&config.to_flattened_document())?)
}
