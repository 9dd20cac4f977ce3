//! Pipeline YAML loading
//!
//! Loads pipeline documents from single files or from a pipelines directory,
//! keeping a source location for every key so validation errors can point
//! back into the file.

use crate::ci::yaml_locator::{self, Location};
use crate::error::{AppError, Result};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory holding a repository's pipeline definitions.
pub const PIPELINES_DIR: &str = ".cicd-pipelines";
/// File name of the default pipeline inside [`PIPELINES_DIR`].
pub const DEFAULT_PIPELINE_FILE: &str = "pipelines.yml";

/// Path of the default pipeline file inside a repository checkout.
pub fn default_pipeline_path(repo_root: &Path) -> PathBuf {
    repo_root.join(PIPELINES_DIR).join(DEFAULT_PIPELINE_FILE)
}

/// A parsed, still weakly typed pipeline document.
#[derive(Debug, Clone)]
pub struct DocumentTree {
    root: Value,
    locations: HashMap<String, Location>,
    file_name: Option<String>,
}

impl DocumentTree {
    pub fn parse_str(source: &str, file_name: Option<&str>) -> Result<Self> {
        let root: Value = serde_yaml::from_str(source).map_err(|e| {
            let (line, column) = e
                .location()
                .map(|loc| (loc.line(), loc.column()))
                .unwrap_or((0, 0));
            AppError::YamlSyntax {
                file: file_name.unwrap_or("<input>").to_string(),
                line,
                column,
                message: e.to_string(),
            }
        })?;
        let locations = yaml_locator::index_locations(source, &root);

        Ok(Self {
            root,
            locations,
            file_name: file_name.map(str::to_string),
        })
    }

    /// Wraps an in-memory document. No source locations are available.
    pub fn from_value(root: Value) -> Self {
        Self {
            root,
            locations: HashMap::new(),
            file_name: None,
        }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn location(&self, path: &str) -> Option<Location> {
        self.locations.get(path).copied()
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        yaml_locator::lookup_path(&self.root, path)
    }

    /// The `global.pipeline_name` declared by the document, if it is a string.
    pub fn pipeline_name(&self) -> Option<&str> {
        self.get("global.pipeline_name").and_then(Value::as_str)
    }
}

/// A pipeline document discovered on disk.
#[derive(Debug, Clone)]
pub struct PipelineFile {
    pub file_name: String,
    pub path: PathBuf,
    pub document: DocumentTree,
}

pub fn parse_file(path: &Path) -> Result<DocumentTree> {
    if !path.is_file() {
        return Err(AppError::FileNotFound(path.display().to_string()));
    }

    let source = fs::read_to_string(path)?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    debug!("📄 Parsing pipeline file: {}", path.display());
    DocumentTree::parse_str(&source, Some(&file_name))
}

/// Parses every `*.yml` / `*.yaml` under `dir`, keyed by `global.pipeline_name`.
///
/// Files that fail to parse or declare no pipeline name are logged and
/// skipped. Two files declaring the same name fail the whole load.
pub fn parse_directory(dir: &Path) -> Result<BTreeMap<String, PipelineFile>> {
    if !dir.is_dir() {
        return Err(AppError::FileNotFound(dir.display().to_string()));
    }

    let mut paths = Vec::new();
    collect_yaml_files(dir, &mut paths)?;
    paths.sort();

    let mut pipelines: BTreeMap<String, PipelineFile> = BTreeMap::new();
    for path in paths {
        let document = match parse_file(&path) {
            Ok(document) => document,
            Err(e) => {
                warn!("⚠️ Skipping {}: {}", path.display(), e);
                continue;
            }
        };

        let Some(name) = document.pipeline_name().map(str::to_string) else {
            warn!(
                "⚠️ Skipping {}: no global.pipeline_name declared",
                path.display()
            );
            continue;
        };

        if let Some(existing) = pipelines.get(&name) {
            return Err(AppError::DuplicatePipelineName {
                name,
                first: relative_display(dir, &existing.path),
                second: relative_display(dir, &path),
            });
        }

        let file_name = document
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| path.display().to_string());
        pipelines.insert(
            name,
            PipelineFile {
                file_name,
                path,
                document,
            },
        );
    }

    Ok(pipelines)
}

pub fn parse_by_pipeline_name(name: &str, dir: &Path) -> Result<PipelineFile> {
    parse_directory(dir)?.remove(name).ok_or_else(|| {
        AppError::FileNotFound(format!(
            "no pipeline named '{}' under {}",
            name,
            dir.display()
        ))
    })
}

fn collect_yaml_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_yaml_files(&path, out)?;
        } else if matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yml") | Some("yaml")
        ) {
            out.push(path);
        }
    }
    Ok(())
}

fn relative_display(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pipeline_yaml(name: &str) -> String {
        format!(
            "global:\n  pipeline_name: {}\njobs:\n  build:\n    stage: build\n    scripts:\n      - make\n",
            name
        )
    }

    #[test]
    fn test_parse_file_tracks_locations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipelines.yml");
        fs::write(&path, pipeline_yaml("demo")).unwrap();

        let document = parse_file(&path).unwrap();
        assert_eq!(document.pipeline_name(), Some("demo"));
        assert_eq!(document.file_name(), Some("pipelines.yml"));
        assert_eq!(
            document.location("jobs.build.stage"),
            Some(Location { line: 5, column: 5 })
        );
    }

    #[test]
    fn test_parse_file_errors() {
        let dir = TempDir::new().unwrap();
        let missing = parse_file(&dir.path().join("absent.yml"));
        assert!(matches!(missing, Err(AppError::FileNotFound(_))));

        let path = dir.path().join("broken.yml");
        fs::write(&path, "global:\n  pipeline_name: [unclosed\n").unwrap();
        match parse_file(&path) {
            Err(AppError::YamlSyntax { file, line, .. }) => {
                assert_eq!(file, "broken.yml");
                assert!(line > 0);
            }
            other => panic!("expected syntax error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_directory_skips_broken_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.yml"), pipeline_yaml("alpha")).unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/b.yaml"), pipeline_yaml("beta")).unwrap();
        fs::write(dir.path().join("broken.yml"), "jobs: [").unwrap();
        fs::write(dir.path().join("notes.txt"), "not yaml").unwrap();

        let pipelines = parse_directory(dir.path()).unwrap();
        let names: Vec<&String> = pipelines.keys().collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(pipelines["beta"].file_name, "b.yaml");
    }

    #[test]
    fn test_parse_directory_rejects_duplicate_names() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("one.yml"), pipeline_yaml("same")).unwrap();
        fs::write(dir.path().join("two.yml"), pipeline_yaml("same")).unwrap();

        match parse_directory(dir.path()) {
            Err(AppError::DuplicatePipelineName { name, first, second }) => {
                assert_eq!(name, "same");
                assert_eq!(first, "one.yml");
                assert_eq!(second, "two.yml");
            }
            other => panic!("expected duplicate error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_by_pipeline_name() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.yml"), pipeline_yaml("alpha")).unwrap();

        let found = parse_by_pipeline_name("alpha", dir.path()).unwrap();
        assert_eq!(found.file_name, "a.yml");

        let missing = parse_by_pipeline_name("gamma", dir.path());
        assert!(matches!(missing, Err(AppError::FileNotFound(_))));
    }
}
