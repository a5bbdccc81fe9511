//! Test: remote mode through a scripted build trigger

use crate::helpers::*;
use pipeline_orchestrator::core::{ExecutionStatus, OrchestratorError, Pipeline, TriggerMetadata};
use pipeline_orchestrator::execution::{ExecutionEngine, ExecutionEvent};
use pipeline_orchestrator::remote::{RemoteBuildStatus, ToolType};
use std::sync::Arc;

const YAML: &str = r#"
name: "release"
variables:
  VERSION: "1.4.2"
parallel_groups:
  verify:
    sync_policy: fail_fast
steps:
  - id: "build"
    type: "scripted"
    order: 1
  - id: "unit"
    type: "scripted"
    order: 2
    parallel_group: "verify"
  - id: "e2e"
    type: "scripted"
    order: 2
    parallel_group: "verify"
"#;

fn remote_pipeline(tool: &str, poll_interval_secs: u64, timeout_secs: u64) -> Pipeline {
    let mut pipeline = pipeline_from_yaml(YAML).with_mode("remote");
    pipeline.execution.remote = Some(remote_config(tool, poll_interval_secs, timeout_secs));
    pipeline
}

fn remote_engine(trigger: &Arc<MockTrigger>) -> (ExecutionEngine, Arc<ScriptedExecutor>) {
    let executor = ScriptedExecutor::new();
    let engine = ExecutionEngine::new(registry_for(executor.clone(), &["scripted"]))
        .with_remote(remote_with(ToolType::GitLab, trigger.clone()));
    (engine, executor)
}

#[tokio::test]
async fn test_remote_success_completes_every_step() {
    let trigger = MockTrigger::new(&[
        RemoteBuildStatus::Pending,
        RemoteBuildStatus::Running,
        RemoteBuildStatus::Success,
    ]);
    let (engine, executor) = remote_engine(&trigger);
    let events = record_events(&engine);
    let snapshot = run_to_end(&engine, &remote_pipeline("gitlab", 0, 60)).await;

    assert!(snapshot.is_success());
    assert_eq!(snapshot.mode, "remote");
    assert_eq!(snapshot.external_id.as_deref(), Some("build-1"));
    assert_eq!(executor.calls(), 0);
    assert_eq!(trigger.polls(), 3);
    for id in ["build", "unit", "e2e"] {
        assert_step_status(&snapshot, id, ExecutionStatus::Success);
    }
    assert!(snapshot.step("unit").unwrap().output.contains("gitlab build build-1"));

    let definitions = trigger.definitions();
    assert_eq!(definitions.len(), 1);
    assert_eq!(definitions[0].file_name, ".gitlab-ci.yml");
    assert!(definitions[0].content.contains("echo build"));
    assert!(definitions[0].content.contains("echo e2e"));
    assert_eq!(trigger.variables()[0].get("VERSION"), Some("1.4.2"));

    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        ExecutionEvent::RemoteDispatched { tool, external_id, .. }
            if tool == "gitlab" && external_id == "build-1"
    )));
}

#[tokio::test]
async fn test_remote_failure_fails_the_run() {
    let trigger = MockTrigger::new(&[RemoteBuildStatus::Running, RemoteBuildStatus::Failed]);
    let (engine, _) = remote_engine(&trigger);
    let snapshot = run_to_end(&engine, &remote_pipeline("gitlab", 0, 60)).await;

    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert_step_status(&snapshot, "build", ExecutionStatus::Failed);
    let failure = snapshot.failure.as_ref().unwrap();
    assert_eq!(failure.error, "gitlab build build-1 failed");
    assert!(failure.step_id.is_none());
}

#[tokio::test]
async fn test_remote_cancellation_cancels_the_run() {
    let trigger = MockTrigger::new(&[RemoteBuildStatus::Cancelled]);
    let (engine, _) = remote_engine(&trigger);
    let snapshot = run_to_end(&engine, &remote_pipeline("gitlab", 0, 60)).await;

    assert_eq!(snapshot.status, ExecutionStatus::Cancelled);
    assert_eq!(snapshot.cancelled_steps().len(), 3);
    assert_all_terminal(&snapshot);
}

#[tokio::test]
async fn test_rejected_dispatch_cancels_steps() {
    let trigger = MockTrigger::rejecting("403 forbidden");
    let (engine, _) = remote_engine(&trigger);
    let snapshot = run_to_end(&engine, &remote_pipeline("gitlab", 0, 60)).await;

    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert!(snapshot.external_id.is_none());
    assert!(snapshot.failure.as_ref().unwrap().error.contains("403 forbidden"));
    for (_, reason) in snapshot.cancelled_steps() {
        assert!(reason.starts_with("cancelled:"));
    }
    assert_eq!(snapshot.cancelled_steps().len(), 3);
}

#[tokio::test]
async fn test_remote_timeout_gives_up() {
    let trigger = MockTrigger::new(&[RemoteBuildStatus::Running]);
    let (engine, _) = remote_engine(&trigger);
    let snapshot = run_to_end(&engine, &remote_pipeline("gitlab", 0, 0)).await;

    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert!(snapshot.failure.as_ref().unwrap().error.contains("timed out"));
    assert_all_terminal(&snapshot);
}

#[tokio::test]
async fn test_reconcile_resolves_without_polling() {
    let trigger = MockTrigger::new(&[RemoteBuildStatus::Running]);
    let (engine, _) = remote_engine(&trigger);
    let handle = engine
        .run(&remote_pipeline("gitlab", 3600, 7200), TriggerMetadata::manual("tests"))
        .await
        .unwrap();
    let run_id = handle.run_id;

    engine
        .reconcile(run_id, RemoteBuildStatus::Success)
        .await
        .unwrap();
    let snapshot = tokio::time::timeout(std::time::Duration::from_secs(5), handle.wait())
        .await
        .unwrap();

    assert!(snapshot.is_success());
    assert!(trigger.polls() <= 1);
    assert!(engine.status(run_id).await.unwrap().is_success());
}

#[tokio::test]
async fn test_trigger_can_switch_a_local_pipeline_to_remote() {
    let trigger = MockTrigger::new(&[RemoteBuildStatus::Success]);
    let (engine, executor) = remote_engine(&trigger);
    let mut pipeline = pipeline_from_yaml(YAML);
    pipeline.execution.remote = Some(remote_config("gitlab-ci", 0, 60));

    let snapshot = engine
        .run(&pipeline, TriggerMetadata::manual("tests").with_mode("REMOTE"))
        .await
        .unwrap()
        .wait()
        .await;

    assert!(snapshot.is_success());
    assert_eq!(snapshot.mode, "remote");
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn test_unsupported_tool_is_rejected_up_front() {
    let trigger = MockTrigger::new(&[RemoteBuildStatus::Success]);
    let (engine, _) = remote_engine(&trigger);

    let err = engine
        .run(&remote_pipeline("circleci", 0, 60), TriggerMetadata::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::RemoteDispatch { .. }));
    assert!(err.to_string().contains("circleci"));
    assert!(trigger.definitions().is_empty());

    let pipeline = pipeline_from_yaml(YAML);
    assert!(engine.generate(&pipeline, Some("bamboo")).is_err());
}

#[tokio::test]
async fn test_generate_for_each_tool() {
    let trigger = MockTrigger::new(&[]);
    let (engine, _) = remote_engine(&trigger);
    let pipeline = pipeline_from_yaml(YAML);

    let jenkins = engine.generate(&pipeline, Some("jenkins")).unwrap();
    assert_eq!(jenkins.file_name, "Jenkinsfile");
    assert!(jenkins.content.contains("failFast true"));

    let github = engine.generate(&pipeline, Some("github")).unwrap();
    assert!(github.file_name.starts_with(".github/workflows/"));
    assert!(github.content.contains("echo unit"));

    let gitlab = engine.generate(&pipeline, Some("gitlab")).unwrap();
    let parsed: serde_yaml::Value = serde_yaml::from_str(&gitlab.content).unwrap();
    assert_eq!(parsed["stages"].as_sequence().unwrap().len(), 2);
}
