//! Dotted-key overrides for validated pipelines.
//!
//! Each override is `dotted.key.path=value`. The value is always assigned as a
//! raw string; the checker applies field typing when the merged document is
//! re-validated, so an override either produces a fully valid configuration
//! or is rejected as a whole.
//!
//! Overrides apply to the stored document, where every job already carries
//! its resolved `docker` settings and upload path. Changing a `global` default
//! therefore does not reach existing jobs; target `jobs.<job>.docker.image`
//! instead. The pipeline name identifies the stored pipeline and is fixed.

use crate::ci::checker::ConfigChecker;
use crate::ci::config::PipelineConfig;
use crate::ci::yaml_parser::DocumentTree;
use crate::error::{AppError, Result};
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

/// A single parsed `key.path=value` override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Override {
    pub path: Vec<String>,
    pub value: String,
}

impl Override {
    pub fn parse(raw: &str) -> Result<Self> {
        let (key, value) = raw.split_once('=').ok_or_else(|| {
            AppError::InvalidOverride(format!("'{}' is not of the form key.path=value", raw))
        })?;

        let path: Vec<String> = key.trim().split('.').map(str::to_string).collect();
        if path.iter().any(|segment| segment.is_empty()) {
            return Err(AppError::InvalidOverride(format!(
                "'{}' has an empty key segment",
                raw
            )));
        }

        Ok(Self {
            path,
            value: value.to_string(),
        })
    }
}

/// Builds the nested override tree. Later overrides win on conflicts.
pub fn build_override_tree(overrides: &[Override]) -> Mapping {
    let mut tree = Mapping::new();
    for item in overrides {
        let mut node = &mut tree;
        let (last, parents) = match item.path.split_last() {
            Some(split) => split,
            None => continue,
        };
        for segment in parents {
            let key = Value::String(segment.clone());
            let entry = node
                .entry(key)
                .or_insert_with(|| Value::Mapping(Mapping::new()));
            if !entry.is_mapping() {
                *entry = Value::Mapping(Mapping::new());
            }
            node = match entry {
                Value::Mapping(inner) => inner,
                _ => unreachable!("entry was just replaced by a mapping"),
            };
        }
        node.insert(Value::String(last.clone()), Value::String(item.value.clone()));
    }
    tree
}

/// Deep-merges `overlay` into `base`: nested mappings merge, anything else is replaced.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Applies `overrides` to `config` and re-validates the result.
pub fn apply_overrides(
    checker: &ConfigChecker,
    config: &PipelineConfig,
    overrides: &[String],
) -> Result<PipelineConfig> {
    if overrides.is_empty() {
        return Ok(config.clone());
    }

    let parsed = overrides
        .iter()
        .map(|raw| Override::parse(raw))
        .collect::<Result<Vec<_>>>()?;
    let tree = build_override_tree(&parsed);
    debug!(count = parsed.len(), "Applying pipeline overrides");

    let mut document = config.to_document();
    deep_merge(&mut document, &Value::Mapping(tree));

    let result = checker.validate(
        config.pipeline_name(),
        &DocumentTree::from_value(document),
        None,
        false,
    );
    let updated = result.into_result().map_err(|e| match e {
        AppError::ConfigError(msg) => {
            AppError::ConfigError(format!("override rejected:\n{}", msg))
        }
        other => other,
    })?;

    if updated.pipeline_name() != config.pipeline_name() {
        return Err(AppError::InvalidOverride(format!(
            "global.pipeline_name cannot be overridden ('{}' -> '{}')",
            config.pipeline_name(),
            updated.pipeline_name()
        )));
    }

    info!(
        "✅ Applied {} override(s) to pipeline {}",
        parsed.len(),
        updated.pipeline_name()
    );
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> PipelineConfig {
        let source = "\
global:
  pipeline_name: demo
  docker:
    image: ubuntu:latest
stages: [build, test]
jobs:
  compile:
    stage: build
    scripts: [make]
  unit:
    stage: test
    scripts: [make test]
";
        let document = DocumentTree::parse_str(source, None).unwrap();
        ConfigChecker::new()
            .validate("demo", &document, None, false)
            .into_result()
            .unwrap()
    }

    #[test]
    fn test_parse_override() {
        let item = Override::parse("global.docker.image=gradle:jdk8").unwrap();
        assert_eq!(item.path, vec!["global", "docker", "image"]);
        assert_eq!(item.value, "gradle:jdk8");

        // Only the first '=' separates key and value.
        let item = Override::parse("jobs.a.scripts=a=b").unwrap();
        assert_eq!(item.value, "a=b");

        assert!(matches!(
            Override::parse("no-equals-sign"),
            Err(AppError::InvalidOverride(_))
        ));
        assert!(matches!(
            Override::parse("global..image=x"),
            Err(AppError::InvalidOverride(_))
        ));
    }

    #[test]
    fn test_override_tree_and_merge() {
        let overrides = vec![
            Override::parse("a.b=1").unwrap(),
            Override::parse("a.c.d=2").unwrap(),
        ];
        let tree = build_override_tree(&overrides);
        let mut base: Value = serde_yaml::from_str("a:\n  b: 0\n  c:\n    e: 3\nz: 9\n").unwrap();
        deep_merge(&mut base, &Value::Mapping(tree));

        let expected: Value =
            serde_yaml::from_str("a:\n  b: '1'\n  c:\n    e: 3\n    d: '2'\nz: 9\n").unwrap();
        assert_eq!(base, expected);
    }

    #[test]
    fn test_no_overrides_returns_same_config() {
        let config = base_config();
        let result = apply_overrides(&ConfigChecker::new(), &config, &[]).unwrap();
        assert_eq!(result, config);
    }

    #[test]
    fn test_override_changes_only_the_target_field() {
        let config = base_config();
        let result = apply_overrides(
            &ConfigChecker::new(),
            &config,
            &["global.docker.image=gradle:jdk8".to_string()],
        )
        .unwrap();

        assert_eq!(result.global.docker.image, "gradle:jdk8");

        let mut expected = config.clone();
        expected.global.docker.image = "gradle:jdk8".to_string();
        assert_eq!(result, expected);
    }

    #[test]
    fn test_bool_override_is_typed() {
        let config = base_config();
        let checker = ConfigChecker::new();

        let result = apply_overrides(
            &checker,
            &config,
            &["jobs.unit.allow_failure=true".to_string()],
        )
        .unwrap();
        assert!(result.jobs["unit"].allow_failure);

        let rejected = apply_overrides(
            &checker,
            &config,
            &["jobs.unit.allow_failure=maybe".to_string()],
        );
        match rejected {
            Err(AppError::ConfigError(msg)) => assert!(msg.contains("expected a boolean")),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_override_to_unknown_key_is_rejected() {
        let config = base_config();
        let rejected = apply_overrides(
            &ConfigChecker::new(),
            &config,
            &["jobs.unit.timeout=30".to_string()],
        );
        assert!(matches!(rejected, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_pipeline_name_cannot_be_overridden() {
        let config = base_config();
        let checker = ConfigChecker::new();

        let rejected = apply_overrides(
            &checker,
            &config,
            &["global.pipeline_name=renamed".to_string()],
        );
        match rejected {
            Err(err @ AppError::InvalidOverride(_)) => {
                assert!(err.to_string().contains("global.pipeline_name"));
                assert_eq!(err.exit_code(), 2);
            }
            other => panic!("expected rename to be rejected, got {:?}", other),
        }

        // Restating the current name is harmless.
        let same = apply_overrides(&checker, &config, &["global.pipeline_name=demo".to_string()])
            .unwrap();
        assert_eq!(same, config);
    }

    #[test]
    fn test_global_image_override_keeps_resolved_job_images() {
        let config = base_config();
        let checker = ConfigChecker::new();

        let result = apply_overrides(
            &checker,
            &config,
            &["global.docker.image=gradle:jdk8".to_string()],
        )
        .unwrap();
        assert_eq!(result.global.docker.image, "gradle:jdk8");
        assert_eq!(result.jobs["compile"].docker.image, "ubuntu:latest");
        assert_eq!(result.jobs["unit"].docker.image, "ubuntu:latest");

        let result = apply_overrides(
            &checker,
            &config,
            &["jobs.compile.docker.image=gradle:jdk8".to_string()],
        )
        .unwrap();
        assert_eq!(result.jobs["compile"].docker.image, "gradle:jdk8");
        assert_eq!(result.jobs["unit"].docker.image, "ubuntu:latest");
    }
}
