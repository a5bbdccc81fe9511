//! Test: local runs of sequential stages

use crate::helpers::*;
use pipeline_orchestrator::core::config::PipelineConfig;
use pipeline_orchestrator::core::{ExecutionStatus, OrchestratorError, TriggerMetadata};
use pipeline_orchestrator::execution::{ExecutionEngine, ExecutionEvent};

/// Stages follow `order`; equal orders keep declaration order
#[tokio::test]
async fn test_steps_run_in_order_with_stable_ties() {
    let yaml = r#"
name: "ordering"
steps:
  - id: "package"
    type: "scripted"
    order: 3
  - id: "checkout"
    type: "scripted"
    order: 1
  - id: "lint"
    type: "scripted"
    order: 2
  - id: "compile"
    type: "scripted"
    order: 2
"#;
    let executor = ScriptedExecutor::new();
    let engine = ExecutionEngine::new(registry_for(executor.clone(), &["scripted"]));
    let snapshot = run_to_end(&engine, &pipeline_from_yaml(yaml)).await;

    assert!(snapshot.is_success());
    assert_eq!(executor.started(), vec!["checkout", "lint", "compile", "package"]);
    assert_eq!(
        snapshot.workspace.get("trail"),
        Some("checkout/lint/compile/package/")
    );
    assert_eq!(snapshot.progress, 1.0);
    assert_all_terminal(&snapshot);
}

/// A failed sequential step cancels everything after it
#[tokio::test]
async fn test_failure_cancels_downstream_steps() {
    let yaml = r#"
name: "broken build"
steps:
  - id: "build"
    type: "scripted"
    order: 1
  - id: "test"
    type: "scripted"
    order: 2
    parameters:
      fail: "yes"
  - id: "deploy"
    type: "scripted"
    order: 3
  - id: "notify"
    type: "scripted"
    order: 4
"#;
    let executor = ScriptedExecutor::new();
    let engine = ExecutionEngine::new(registry_for(executor.clone(), &["scripted"]));
    let events = record_events(&engine);
    let snapshot = run_to_end(&engine, &pipeline_from_yaml(yaml)).await;

    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert_eq!(executor.started(), vec!["build", "test"]);
    assert_step_status(&snapshot, "build", ExecutionStatus::Success);
    assert_step_status(&snapshot, "test", ExecutionStatus::Failed);
    assert_step_status(&snapshot, "deploy", ExecutionStatus::Cancelled);
    assert_step_status(&snapshot, "notify", ExecutionStatus::Cancelled);

    let failure = snapshot.failure.clone().unwrap();
    assert_eq!(failure.step_id.as_deref(), Some("test"));
    assert_eq!(failure.stage_index, Some(1));
    assert!(snapshot.step("deploy").unwrap().started_at.is_none());
    assert_all_terminal(&snapshot);

    let events = events.lock().unwrap();
    let cancelled: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::StepCancelled { step_id, .. } => Some(step_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(cancelled, vec!["deploy", "notify"]);
    assert!(matches!(
        events.last(),
        Some(ExecutionEvent::RunCompleted {
            status: ExecutionStatus::Failed,
            ..
        })
    ));
}

/// An allowed failure is recorded but the run goes on
#[tokio::test]
async fn test_continue_on_failure_keeps_run_going() {
    let yaml = r#"
name: "tolerant"
steps:
  - id: "build"
    type: "scripted"
    order: 1
  - id: "coverage"
    type: "scripted"
    order: 2
    continue_on_failure: true
    parameters:
      fail: "yes"
  - id: "publish"
    type: "scripted"
    order: 3
"#;
    let executor = ScriptedExecutor::new();
    let engine = ExecutionEngine::new(registry_for(executor.clone(), &["scripted"]));
    let snapshot = run_to_end(&engine, &pipeline_from_yaml(yaml)).await;

    assert_eq!(snapshot.status, ExecutionStatus::Success);
    assert_step_status(&snapshot, "coverage", ExecutionStatus::Failed);
    assert_step_status(&snapshot, "publish", ExecutionStatus::Success);
    assert!(snapshot.failure.is_none());
}

/// Writes of a stage become visible only to later stages
#[tokio::test]
async fn test_workspace_writes_land_after_their_stage() {
    let yaml = r#"
name: "handoff"
steps:
  - id: "a"
    type: "scripted"
    order: 1
    parallel_group: "prep"
  - id: "b"
    type: "scripted"
    order: 1
    parallel_group: "prep"
    parameters:
      echo: "a={{ a.done }}"
  - id: "c"
    type: "scripted"
    order: 2
    parameters:
      echo: "a={{ a.done }} b={{ b.done }}"
"#;
    let executor = ScriptedExecutor::new();
    let engine = ExecutionEngine::new(registry_for(executor, &["scripted"]));
    let snapshot = run_to_end(&engine, &pipeline_from_yaml(yaml)).await;

    assert!(snapshot.is_success());
    assert_eq!(snapshot.step("b").unwrap().output, "a={{ a.done }}");
    assert_eq!(snapshot.step("c").unwrap().output, "a=yes b=yes");
}

/// Trigger variables override pipeline variables for one run
#[tokio::test]
async fn test_trigger_variables_override_pipeline_variables() {
    let yaml = r#"
name: "deploy"
variables:
  ENV: "staging"
  REGION: "eu"
steps:
  - id: "target"
    type: "scripted"
    order: 1
    parameters:
      echo: "{{ ENV }}@{{ REGION }}"
"#;
    let executor = ScriptedExecutor::new();
    let engine = ExecutionEngine::new(registry_for(executor, &["scripted"]));
    let mut trigger = TriggerMetadata::manual("tests");
    trigger.variables.insert("ENV".to_string(), "prod".to_string());

    let snapshot = engine
        .run(&pipeline_from_yaml(yaml), trigger)
        .await
        .unwrap()
        .wait()
        .await;

    assert_eq!(snapshot.step("target").unwrap().output, "prod@eu");
}

/// A panicking executor fails its step instead of the engine
#[tokio::test]
async fn test_executor_panic_becomes_step_failure() {
    let yaml = r#"
name: "panicky"
steps:
  - id: "explode"
    type: "scripted"
    order: 1
    parameters:
      panic: "yes"
  - id: "after"
    type: "scripted"
    order: 2
"#;
    let executor = ScriptedExecutor::new();
    let engine = ExecutionEngine::new(registry_for(executor, &["scripted"]));
    let snapshot = run_to_end(&engine, &pipeline_from_yaml(yaml)).await;

    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert_step_status(&snapshot, "explode", ExecutionStatus::Failed);
    assert_step_status(&snapshot, "after", ExecutionStatus::Cancelled);
}

/// A step over its own timeout fails
#[tokio::test]
async fn test_step_timeout_fails_the_step() {
    let yaml = r#"
name: "slow"
steps:
  - id: "hang"
    type: "scripted"
    order: 1
    timeout_secs: 1
    parameters:
      sleep_ms: 5000
"#;
    let executor = ScriptedExecutor::new();
    let engine = ExecutionEngine::new(registry_for(executor, &["scripted"]));
    let snapshot = run_to_end(&engine, &pipeline_from_yaml(yaml)).await;

    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    let hang = snapshot.step("hang").unwrap();
    assert_eq!(hang.status, ExecutionStatus::Failed);
    assert!(hang.error.as_deref().unwrap().contains("timed out after 1s"));
}

/// Step types without an executor are rejected before any run exists
#[tokio::test]
async fn test_unknown_step_type_is_rejected_up_front() {
    let yaml = r#"
name: "typo"
steps:
  - id: "build"
    type: "scripted"
    order: 1
  - id: "ship"
    type: "helicopter"
    order: 2
"#;
    let executor = ScriptedExecutor::new();
    let engine = ExecutionEngine::new(registry_for(executor.clone(), &["scripted"]));
    let err = engine
        .run(&pipeline_from_yaml(yaml), TriggerMetadata::default())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Planning(_)));
    assert!(err.to_string().contains("helicopter"));
    assert_eq!(executor.calls(), 0);
    assert!(engine.history(None, 10).await.unwrap().is_empty());
}

/// Declared variables are readable from the loaded config and seed the workspace
#[tokio::test]
async fn test_config_variables_seed_the_workspace() {
    let yaml = r#"
name: "vars"
variables:
  TARGET: "release"
  JOBS: 4
steps:
  - id: "build"
    type: "scripted"
    order: 1
"#;
    let config = PipelineConfig::from_yaml(yaml).unwrap();
    assert_eq!(config.variables.len(), 2);

    let executor = ScriptedExecutor::new();
    let engine = ExecutionEngine::new(registry_for(executor, &["scripted"]));
    let snapshot = run_to_end(&engine, &config.to_pipeline()).await;

    assert!(snapshot.is_success());
    assert_eq!(snapshot.workspace.get("TARGET"), Some("release"));
    assert_eq!(snapshot.workspace.get("JOBS"), Some("4"));
}
