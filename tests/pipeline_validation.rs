mod common;

use common::{TestEnvironment, TWO_STAGE_PIPELINE};
use rustci_engine::application::services::ConfigService;
use rustci_engine::ci::pipeline::SessionDetail;
use rustci_engine::domain::repositories::PipelineStore;
use rustci_engine::testing::FakeContainerEngine;
use rustci_engine::AppError;

const HEADER: &str = "\
global:
  pipeline_name: graph
  docker:
    image: ubuntu:latest
stages: [build]
";

fn job(name: &str, needs: &[&str]) -> String {
    format!(
        "  {}:\n    stage: build\n    needs: [{}]\n    scripts: [echo {}]\n",
        name,
        needs.join(", "),
        name
    )
}

fn pipeline(jobs: &[String]) -> String {
    format!("{}jobs:\n{}", HEADER, jobs.concat())
}

fn groups(raw: &[&[&str]]) -> Vec<Vec<String>> {
    raw.iter()
        .map(|g| g.iter().map(|s| s.to_string()).collect())
        .collect()
}

async fn check(env: &TestEnvironment, file_name: &str, source: &str) -> rustci_engine::application::services::CheckReport {
    let path = env.write_pipeline(file_name, source);
    ConfigService::new(env.store.clone())
        .check_file(&path, None, false)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_linear_chain_is_layered() {
    let env = TestEnvironment::new(FakeContainerEngine::new());
    let report = check(
        &env,
        "linear.yml",
        &pipeline(&[job("a", &[]), job("b", &["a"]), job("c", &["b"])]),
    )
    .await;

    let config = report.outcome.unwrap();
    assert_eq!(
        config.stages["build"].job_groups,
        groups(&[&["a"], &["b"], &["c"]])
    );
}

#[tokio::test]
async fn test_diamond_is_layered() {
    let env = TestEnvironment::new(FakeContainerEngine::new());
    let report = check(
        &env,
        "diamond.yml",
        &pipeline(&[
            job("a", &[]),
            job("b", &["a"]),
            job("c", &["a"]),
            job("d", &["b", "c"]),
        ]),
    )
    .await;

    let config = report.outcome.unwrap();
    assert_eq!(
        config.stages["build"].job_groups,
        groups(&[&["a"], &["b", "c"], &["d"]])
    );
    let order: Vec<&str> = config.execution_order().iter().map(|(_, j)| *j).collect();
    assert_eq!(order, vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn test_cycle_is_reported() {
    let env = TestEnvironment::new(FakeContainerEngine::new());
    let report = check(
        &env,
        "cycle.yml",
        &pipeline(&[job("a", &["b"]), job("b", &["a"])]),
    )
    .await;

    assert!(!report.is_valid());
    let errors = report.outcome.unwrap_err();
    assert!(errors.contains("[a, b]"), "{}", errors);
}

#[tokio::test]
async fn test_default_stages_must_all_have_jobs() {
    let env = TestEnvironment::new(FakeContainerEngine::new());
    let source = "\
global:
  pipeline_name: defaults
  docker:
    image: ubuntu:latest
jobs:
  compile:
    stage: build
    scripts: [make]
  unit:
    stage: test
    scripts: [make test]
";
    let report = check(&env, "defaults.yml", source).await;
    let errors = report.outcome.unwrap_err();
    assert!(errors.contains("doc"), "{}", errors);
    assert!(errors.contains("deploy"), "{}", errors);
}

#[tokio::test]
async fn test_check_directory_saves_only_valid_pipelines() {
    let env = TestEnvironment::new(FakeContainerEngine::new());
    env.write_default_pipeline(TWO_STAGE_PIPELINE);
    env.write_pipeline(
        "broken.yml",
        &pipeline(&[job("a", &["b"]), job("b", &["a"])]),
    );

    let dir = env.workspace_path().join(".cicd-pipelines");
    let reports = ConfigService::new(env.store.clone())
        .check_directory(&dir, Some(&env.session), true)
        .await
        .unwrap();

    assert_eq!(reports.len(), 2);
    assert_eq!(reports.iter().filter(|r| r.is_valid()).count(), 1);

    let repo = env
        .store
        .get_repo_config(&env.session.repo_key())
        .await
        .unwrap()
        .unwrap();
    let names: Vec<&String> = repo.pipelines.keys().collect();
    assert_eq!(names, vec!["app"]);
    assert_eq!(repo.pipelines["app"].pipeline_file_name, "pipelines.yml");
}

#[tokio::test]
async fn test_duplicate_pipeline_names_fail_the_directory() {
    let env = TestEnvironment::new(FakeContainerEngine::new());
    env.write_pipeline("one.yml", TWO_STAGE_PIPELINE);
    env.write_pipeline("two.yml", TWO_STAGE_PIPELINE);

    let dir = env.workspace_path().join(".cicd-pipelines");
    let result = ConfigService::new(env.store.clone())
        .check_directory(&dir, Some(&env.session), true)
        .await;
    assert!(matches!(
        result,
        Err(AppError::DuplicatePipelineName { ref name, .. }) if name == "app"
    ));
}

#[tokio::test]
async fn test_missing_file_exits_with_usage_code() {
    let env = TestEnvironment::new(FakeContainerEngine::new());
    let result = ConfigService::new(env.store.clone())
        .check_file(&env.workspace_path().join("absent.yml"), None, false)
        .await;
    match result {
        Err(e @ AppError::FileNotFound(_)) => assert_eq!(e.exit_code(), 2),
        other => panic!("expected file not found, got {:?}", other),
    }
}

#[tokio::test]
async fn test_saved_override_changes_only_the_target() {
    let env = TestEnvironment::new(FakeContainerEngine::new());
    let path = env.write_default_pipeline(TWO_STAGE_PIPELINE);
    let service = ConfigService::new(env.store.clone());
    let original = service
        .check_file(&path, Some(&env.session), true)
        .await
        .unwrap()
        .outcome
        .unwrap();

    let updated = service
        .override_pipeline(
            &env.session,
            "app",
            &["global.docker.image=gradle:jdk8".to_string()],
            true,
        )
        .await
        .unwrap();

    let mut expected = original.clone();
    expected.global.docker.image = "gradle:jdk8".to_string();
    assert_eq!(updated, expected);
    assert_eq!(env.pipeline_info("app").await.pipeline_config, expected);

    let rendered = ConfigService::render(&updated, true).unwrap();
    assert!(rendered.contains("gradle:jdk8"));
}

#[tokio::test]
async fn test_saved_override_cannot_rename_the_pipeline() {
    let env = TestEnvironment::new(FakeContainerEngine::new());
    let path = env.write_default_pipeline(TWO_STAGE_PIPELINE);
    let service = ConfigService::new(env.store.clone());
    let original = service
        .check_file(&path, Some(&env.session), true)
        .await
        .unwrap()
        .outcome
        .unwrap();

    let result = service
        .override_pipeline(
            &env.session,
            "app",
            &["global.pipeline_name=renamed".to_string()],
            true,
        )
        .await;
    assert!(matches!(result, Err(AppError::InvalidOverride(_))));

    assert_eq!(env.pipeline_info("app").await.pipeline_config, original);
    assert!(env
        .store
        .get_pipeline_info(&env.session.repo_key(), "renamed")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_override_of_unknown_pipeline_is_not_found() {
    let env = TestEnvironment::new(FakeContainerEngine::new());
    let session: &SessionDetail = &env.session;
    let result = ConfigService::new(env.store.clone())
        .override_pipeline(session, "ghost", &["global.docker.image=x".to_string()], false)
        .await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
}
