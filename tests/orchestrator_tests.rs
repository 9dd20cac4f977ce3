mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{TestEnvironment, TWO_STAGE_PIPELINE};
use rustci_engine::ci::engine::{PipelineStatus, RunOptions, RunOutcome};
use rustci_engine::ci::pipeline::{HistoryQuery, JobStatus};
use rustci_engine::domain::repositories::PipelineStore;
use rustci_engine::testing::{FakeContainerEngine, FakeJob};
use rustci_engine::AppError;
use tokio_util::sync::CancellationToken;

fn completed(outcome: RunOutcome) -> rustci_engine::ci::engine::RunSummary {
    match outcome {
        RunOutcome::Completed(summary) => summary,
        other => panic!("expected a completed run, got {:?}", other),
    }
}

#[tokio::test]
async fn test_successful_run_records_every_job() {
    let env = TestEnvironment::new(
        FakeContainerEngine::new()
            .with_job("j1", FakeJob::succeeding("built"))
            .with_job("j2", FakeJob::succeeding("tested")),
    );
    env.write_default_pipeline(TWO_STAGE_PIPELINE);

    let summary = completed(
        env.orchestrator()
            .run_pipeline(&env.session, &env.run_options(), CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(summary.status, PipelineStatus::Success);
    assert_eq!(summary.run_number, 1);
    assert_eq!(env.engine.started_jobs(), vec!["j1", "j2"]);
    assert!(summary.jobs.iter().all(|j| j.job_status == JobStatus::Success));

    let info = env.pipeline_info("app").await;
    assert!(!info.running);
    assert_eq!(info.run_count, 1);
    assert_eq!(info.job_run_history.len(), 2);
    assert_eq!(info.last_commit_hash, "abc123");

    // Workspace copied into the run volume, and the volume removed afterwards.
    assert_eq!(env.engine.seeded_volumes().len(), 1);
    assert!(env.engine.live_volumes().is_empty());
    assert_eq!(env.engine.removed_volumes().len(), 1);
}

#[tokio::test]
async fn test_failure_stops_later_stages() {
    let env = TestEnvironment::new(
        FakeContainerEngine::new().with_job("j1", FakeJob::failing("error: compile failed")),
    );
    env.write_default_pipeline(TWO_STAGE_PIPELINE);

    let summary = completed(
        env.orchestrator()
            .run_pipeline(&env.session, &env.run_options(), CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(summary.status, PipelineStatus::Failed);
    assert_eq!(env.engine.started_jobs(), vec!["j1"]);
    assert_eq!(summary.jobs[0].job_name, "j1");
    assert_eq!(summary.jobs[0].job_status, JobStatus::Failed);
    assert!(summary.jobs[0].job_logs.contains("compile failed"));
    assert_eq!(summary.jobs[1].job_status, JobStatus::Cancelled);

    let info = env.pipeline_info("app").await;
    assert!(!info.running);
    assert!(env.engine.live_volumes().is_empty());
}

#[tokio::test]
async fn test_allowed_failure_does_not_stop_the_pipeline() {
    let env = TestEnvironment::new(
        FakeContainerEngine::new().with_job("j1", FakeJob::failing("fatal: flaky lint")),
    );
    env.write_default_pipeline(&TWO_STAGE_PIPELINE.replace(
        "    scripts: [make]\n",
        "    allow_failure: true\n    scripts: [make]\n",
    ));

    let summary = completed(
        env.orchestrator()
            .run_pipeline(&env.session, &env.run_options(), CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(summary.status, PipelineStatus::Success);
    assert_eq!(env.engine.started_jobs(), vec!["j1", "j2"]);
    assert_eq!(summary.jobs[0].job_status, JobStatus::Failed);
    assert!(summary.jobs[0].allow_failure);
    assert_eq!(summary.jobs[1].job_status, JobStatus::Success);
}

#[tokio::test]
async fn test_nonzero_exit_without_error_output_is_success() {
    let job = FakeJob {
        stderr: "warning: unused variable".to_string(),
        exit_code: 3,
        ..FakeJob::default()
    };
    let env = TestEnvironment::new(FakeContainerEngine::new().with_job("j1", job));
    env.write_default_pipeline(TWO_STAGE_PIPELINE);

    let summary = completed(
        env.orchestrator()
            .run_pipeline(&env.session, &env.run_options(), CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(summary.jobs[0].job_status, JobStatus::Success);
    assert_eq!(summary.status, PipelineStatus::Success);
}

#[tokio::test]
async fn test_second_run_is_rejected_while_running() {
    let env = TestEnvironment::new(FakeContainerEngine::new());
    env.write_default_pipeline(TWO_STAGE_PIPELINE);
    let orchestrator = env.orchestrator();

    orchestrator
        .run_pipeline(&env.session, &env.run_options(), CancellationToken::new())
        .await
        .unwrap();

    // Another process holds the guard.
    let key = env.session.repo_key();
    assert_eq!(env.store.try_start_run(&key, "app").await.unwrap(), Some(2));

    let result = orchestrator
        .run_pipeline(&env.session, &env.run_options(), CancellationToken::new())
        .await;
    assert!(matches!(result, Err(AppError::AlreadyRunning(name)) if name == "app"));
    assert_eq!(env.engine.started_jobs().len(), 2);

    // The rejected attempt must not release the other holder's guard.
    assert!(env.pipeline_info("app").await.running);
}

#[tokio::test]
async fn test_cancellation_stops_running_jobs() {
    let env = TestEnvironment::new(
        FakeContainerEngine::new()
            .with_job("j1", FakeJob::succeeding("").running_for(Duration::from_secs(30))),
    );
    env.write_default_pipeline(TWO_STAGE_PIPELINE);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result = env
        .orchestrator()
        .run_pipeline(&env.session, &env.run_options(), cancel)
        .await;
    assert!(matches!(result, Err(AppError::Cancelled)));

    assert_eq!(env.engine.started_jobs(), vec!["j1"]);
    assert_eq!(env.engine.stopped_containers().len(), 1);
    assert!(env.engine.live_volumes().is_empty());

    let jobs = env.store.all_jobs().await;
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.log.job_status == JobStatus::Cancelled));
    assert!(!env.pipeline_info("app").await.running);
}

#[tokio::test]
async fn test_dry_run_touches_neither_store_nor_engine() {
    let env = TestEnvironment::new(FakeContainerEngine::new());
    env.write_default_pipeline(TWO_STAGE_PIPELINE);

    let options = RunOptions {
        dry_run: true,
        ..env.run_options()
    };
    let outcome = env
        .orchestrator()
        .run_pipeline(&env.session, &options, CancellationToken::new())
        .await
        .unwrap();

    match outcome {
        RunOutcome::DryRun(plan) => {
            assert!(plan.contains("Pipeline: app"));
            assert!(plan.contains("Stage: build"));
            assert!(plan.contains("Group 1: j1"));
        }
        other => panic!("expected a dry run, got {:?}", other),
    }

    assert!(env.engine.started_jobs().is_empty());
    assert!(env.engine.removed_volumes().is_empty());
    assert!(env.store.all_jobs().await.is_empty());
    assert!(env
        .store
        .get_repo_config(&env.session.repo_key())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_dry_run_yaml_applies_overrides() {
    let env = TestEnvironment::new(FakeContainerEngine::new());
    env.write_default_pipeline(TWO_STAGE_PIPELINE);

    let options = RunOptions {
        dry_run: true,
        yaml_output: true,
        override_configs: vec!["global.docker.image=gradle:jdk8".to_string()],
        ..env.run_options()
    };
    let outcome = env
        .orchestrator()
        .run_pipeline(&env.session, &options, CancellationToken::new())
        .await
        .unwrap();

    let RunOutcome::DryRun(yaml) = outcome else {
        panic!("expected a dry run");
    };
    let document: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
    assert_eq!(document["global"]["docker"]["image"], "gradle:jdk8");
    assert_eq!(document["jobs"]["j2"]["stage"], "test");
}

#[tokio::test]
async fn test_pipeline_name_override_is_rejected_before_saving() {
    let env = TestEnvironment::new(FakeContainerEngine::new());
    env.write_default_pipeline(TWO_STAGE_PIPELINE);

    let options = RunOptions {
        override_configs: vec!["global.pipeline_name=renamed".to_string()],
        ..env.run_options()
    };
    let result = env
        .orchestrator()
        .run_pipeline(&env.session, &options, CancellationToken::new())
        .await;
    match result {
        Err(e @ AppError::InvalidOverride(_)) => assert_eq!(e.exit_code(), 2),
        other => panic!("expected an invalid override, got {:?}", other),
    }

    assert!(env.engine.started_jobs().is_empty());
    assert!(env
        .store
        .get_repo_config(&env.session.repo_key())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_store_failure_still_clears_running() {
    let env = TestEnvironment::new(FakeContainerEngine::new());
    env.write_default_pipeline(TWO_STAGE_PIPELINE);
    env.store.set_fail_job_writes(true);

    let result = env
        .orchestrator()
        .run_pipeline(&env.session, &env.run_options(), CancellationToken::new())
        .await;
    assert!(matches!(result, Err(AppError::DatabaseError(_))));

    let info = env.pipeline_info("app").await;
    assert!(!info.running);
    assert_eq!(info.run_count, 1);
    assert!(env.engine.started_jobs().is_empty());
    assert!(env.engine.live_volumes().is_empty());
}

#[tokio::test]
async fn test_group_parallelism_is_bounded() {
    let pipeline = "\
global:
  pipeline_name: wide
  docker:
    image: alpine:latest
stages: [build]
jobs:
  a:
    stage: build
    scripts: [echo a]
  b:
    stage: build
    scripts: [echo b]
  c:
    stage: build
    scripts: [echo c]
  d:
    stage: build
    scripts: [echo d]
";
    let slow = || FakeJob::succeeding("").running_for(Duration::from_millis(50));
    let env = TestEnvironment::new(
        FakeContainerEngine::new()
            .with_job("a", slow())
            .with_job("b", slow())
            .with_job("c", slow())
            .with_job("d", slow()),
    );
    env.write_default_pipeline(pipeline);

    let summary = completed(
        env.orchestrator()
            .with_max_parallel(2)
            .run_pipeline(&env.session, &env.run_options(), CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(summary.status, PipelineStatus::Success);
    assert_eq!(env.engine.started_jobs().len(), 4);
    assert!(env.engine.max_concurrent() <= 2);
    assert!(env.engine.max_concurrent() >= 1);
}

#[tokio::test]
async fn test_each_run_records_one_log_per_job() {
    let env = TestEnvironment::new(FakeContainerEngine::new());
    env.write_default_pipeline(TWO_STAGE_PIPELINE);
    let orchestrator = env.orchestrator();

    for expected_run in 1..=2 {
        let summary = completed(
            orchestrator
                .run_pipeline(&env.session, &env.run_options(), CancellationToken::new())
                .await
                .unwrap(),
        );
        assert_eq!(summary.run_number, expected_run);
    }

    let jobs = env.store.all_jobs().await;
    assert_eq!(jobs.len(), 4);
    let keys: HashSet<_> = jobs.iter().map(|j| j.run_key()).collect();
    assert_eq!(keys.len(), 4);

    let history = env
        .store
        .query_history(&HistoryQuery {
            pipeline_name: Some("app".to_string()),
            ..HistoryQuery::for_repo(&env.session.repo_url)
        })
        .await
        .unwrap();
    let order: Vec<(i64, &str)> = history
        .iter()
        .map(|r| (r.run_number, r.log.job_name.as_str()))
        .collect();
    assert_eq!(order, vec![(1, "j1"), (1, "j2"), (2, "j1"), (2, "j2")]);
}

#[tokio::test]
async fn test_pipeline_and_file_are_mutually_exclusive() {
    let env = TestEnvironment::new(FakeContainerEngine::new());
    let path = env.write_default_pipeline(TWO_STAGE_PIPELINE);

    let options = RunOptions {
        pipeline_name: Some("app".to_string()),
        file_path: Some(path),
        ..env.run_options()
    };
    let result = env
        .orchestrator()
        .run_pipeline(&env.session, &options, CancellationToken::new())
        .await;
    match result {
        Err(e @ AppError::InvalidInvocation(_)) => assert_eq!(e.exit_code(), 2),
        other => panic!("expected invalid invocation, got {:?}", other),
    }
}

#[tokio::test]
async fn test_run_by_name_uses_stored_pipeline() {
    let env = TestEnvironment::new(FakeContainerEngine::new());
    env.write_pipeline("release.yml", &TWO_STAGE_PIPELINE.replace("app", "release"));
    let orchestrator = env.orchestrator();

    // First run finds the file in the workspace and stores it.
    let options = RunOptions {
        pipeline_name: Some("release".to_string()),
        ..env.run_options()
    };
    completed(
        orchestrator
            .run_pipeline(&env.session, &options, CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(env.pipeline_info("release").await.pipeline_file_name, "release.yml");

    // Without a workspace the stored definition is used.
    let options = RunOptions {
        pipeline_name: Some("release".to_string()),
        ..RunOptions::default()
    };
    let summary = completed(
        orchestrator
            .run_pipeline(&env.session, &options, CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(summary.run_number, 2);

    let missing = RunOptions {
        pipeline_name: Some("nightly".to_string()),
        ..RunOptions::default()
    };
    let result = orchestrator
        .run_pipeline(&env.session, &missing, CancellationToken::new())
        .await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn test_missing_default_pipeline_is_file_not_found() {
    let env = TestEnvironment::new(FakeContainerEngine::new());
    let options = RunOptions {
        local: true,
        ..env.run_options()
    };
    let result = env
        .orchestrator()
        .run_pipeline(&env.session, &options, CancellationToken::new())
        .await;
    assert!(matches!(result, Err(AppError::FileNotFound(_))));
}

#[tokio::test]
async fn test_artifacts_are_uploaded_after_success() {
    let pipeline = "\
global:
  pipeline_name: app
  docker:
    image: alpine:latest
  artifact_upload_path: builds
stages: [build]
jobs:
  j1:
    stage: build
    scripts: [make]
    artifacts:
      paths: [target/app]
";
    let env = TestEnvironment::new(
        FakeContainerEngine::new().with_job(
            "j1",
            FakeJob::succeeding("ok").with_file("/app/target/app", b"binary"),
        ),
    );
    env.write_default_pipeline(pipeline);

    let summary = completed(
        env.orchestrator()
            .run_pipeline(&env.session, &env.run_options(), CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(summary.status, PipelineStatus::Success);

    let keys = env.sink.keys().await;
    assert_eq!(keys.len(), 1, "{:?}", keys);
    assert!(keys[0].starts_with("builds/"));
    assert!(keys[0].ends_with("j1/target/app.tar"));
}
