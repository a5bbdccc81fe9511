//! Test: hybrid runs split between local executors and a remote tool

use crate::helpers::*;
use pipeline_orchestrator::core::{ExecutionStatus, Pipeline};
use pipeline_orchestrator::execution::ExecutionEngine;
use pipeline_orchestrator::remote::{RemoteBuildStatus, ToolType};
use std::sync::Arc;

const YAML: &str = r#"
name: "ship"
execution:
  mode: hybrid
steps:
  - id: "checkout"
    type: "shell"
    order: 1
  - id: "image"
    type: "docker"
    order: 2
  - id: "smoke"
    type: "shell"
    order: 3
"#;

fn hybrid_pipeline(yaml: &str) -> Pipeline {
    let mut pipeline = pipeline_from_yaml(yaml);
    pipeline.execution.remote = Some(remote_config("gitlab", 0, 60));
    pipeline
}

fn hybrid_engine(trigger: &Arc<MockTrigger>) -> (ExecutionEngine, Arc<ScriptedExecutor>) {
    let executor = ScriptedExecutor::new();
    let engine = ExecutionEngine::new(registry_for(executor.clone(), &["shell", "docker"]))
        .with_remote(remote_with(ToolType::GitLab, trigger.clone()));
    (engine, executor)
}

#[tokio::test]
async fn test_steps_are_placed_by_type() {
    let trigger = MockTrigger::new(&[RemoteBuildStatus::Running, RemoteBuildStatus::Success]);
    let (engine, executor) = hybrid_engine(&trigger);
    let snapshot = run_to_end(&engine, &hybrid_pipeline(YAML)).await;

    assert!(snapshot.is_success());
    assert_eq!(snapshot.mode, "hybrid");
    assert_eq!(executor.started(), vec!["checkout", "smoke"]);

    let definition = &trigger.definitions()[0];
    assert!(definition.content.contains("echo image"));
    assert!(!definition.content.contains("echo checkout"));
    assert!(snapshot.step("image").unwrap().output.contains("build-1"));
    assert_eq!(snapshot.steps.len(), 3);

    // Remote stages continue the run's numbering after the local ones
    assert_eq!(snapshot.step("checkout").unwrap().stage_index, Some(0));
    assert_eq!(snapshot.step("smoke").unwrap().stage_index, Some(1));
    assert_eq!(snapshot.step("image").unwrap().stage_index, Some(2));
    assert!(definition.content.contains("stage-0-image"));
}

#[tokio::test]
async fn test_remote_failure_fails_hybrid_run() {
    let trigger = MockTrigger::new(&[RemoteBuildStatus::Failed]);
    let (engine, _) = hybrid_engine(&trigger);
    let snapshot = run_to_end(&engine, &hybrid_pipeline(YAML)).await;

    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert_step_status(&snapshot, "checkout", ExecutionStatus::Success);
    assert_step_status(&snapshot, "smoke", ExecutionStatus::Success);
    assert_step_status(&snapshot, "image", ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_local_failure_fails_hybrid_run() {
    let yaml = YAML.replace(
        "  - id: \"smoke\"\n    type: \"shell\"\n    order: 3\n",
        "  - id: \"smoke\"\n    type: \"shell\"\n    order: 3\n    parameters:\n      fail: \"yes\"\n",
    );
    let trigger = MockTrigger::new(&[RemoteBuildStatus::Success]);
    let (engine, _) = hybrid_engine(&trigger);
    let snapshot = run_to_end(&engine, &hybrid_pipeline(&yaml)).await;

    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert_step_status(&snapshot, "image", ExecutionStatus::Success);
    assert_step_status(&snapshot, "smoke", ExecutionStatus::Failed);
    assert_eq!(snapshot.failure.as_ref().unwrap().step_id.as_deref(), Some("smoke"));
}

#[tokio::test]
async fn test_large_step_config_goes_remote() {
    let yaml = r#"
name: "bulky"
execution:
  mode: hybrid
  hybrid:
    local_step_types: ["shell"]
    max_local_config_bytes: 32
steps:
  - id: "small"
    type: "shell"
    order: 1
    parameters:
      command: "make"
  - id: "big"
    type: "shell"
    order: 2
    parameters:
      command: "make release ARTIFACT_REPOSITORY=https://artifacts.example.com/releases"
"#;
    let trigger = MockTrigger::new(&[RemoteBuildStatus::Success]);
    let (engine, executor) = hybrid_engine(&trigger);
    let snapshot = run_to_end(&engine, &hybrid_pipeline(yaml)).await;

    assert!(snapshot.is_success());
    assert_eq!(executor.started(), vec!["small"]);
    assert!(trigger.definitions()[0].content.contains("echo big"));
}

#[tokio::test]
async fn test_all_local_hybrid_never_dispatches() {
    let yaml = r#"
name: "local only"
execution:
  mode: hybrid
steps:
  - id: "lint"
    type: "shell"
    order: 1
"#;
    let trigger = MockTrigger::new(&[RemoteBuildStatus::Success]);
    let (engine, executor) = hybrid_engine(&trigger);
    // No remote section is needed when nothing is placed remotely
    let snapshot = run_to_end(&engine, &pipeline_from_yaml(yaml)).await;

    assert!(snapshot.is_success());
    assert_eq!(executor.calls(), 1);
    assert!(trigger.definitions().is_empty());
    assert!(snapshot.external_id.is_none());
}
