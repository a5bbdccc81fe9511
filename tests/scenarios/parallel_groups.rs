//! Test: parallel groups and their sync policies

use crate::helpers::*;
use pipeline_orchestrator::core::ExecutionStatus;
use pipeline_orchestrator::execution::{ExecutionEngine, ExecutionEvent, StageKind};
use std::time::Instant;

fn engine(executor: &std::sync::Arc<ScriptedExecutor>) -> ExecutionEngine {
    ExecutionEngine::new(registry_for(executor.clone(), &["scripted"]))
}

#[tokio::test]
async fn test_wait_all_runs_every_member() {
    let yaml = r#"
name: "matrix"
parallel_groups:
  tests:
    sync_policy: wait_all
steps:
  - id: "unit"
    type: "scripted"
    order: 1
    parallel_group: "tests"
    parameters:
      fail: "yes"
  - id: "integration"
    type: "scripted"
    order: 1
    parallel_group: "tests"
    parameters:
      sleep_ms: 100
  - id: "report"
    type: "scripted"
    order: 2
"#;
    let executor = ScriptedExecutor::new();
    let snapshot = run_to_end(&engine(&executor), &pipeline_from_yaml(yaml)).await;

    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert_step_status(&snapshot, "unit", ExecutionStatus::Failed);
    assert_step_status(&snapshot, "integration", ExecutionStatus::Success);
    assert_step_status(&snapshot, "report", ExecutionStatus::Cancelled);
    assert_eq!(snapshot.failure.as_ref().unwrap().step_id.as_deref(), Some("unit"));
}

#[tokio::test]
async fn test_wait_any_takes_first_success() {
    let yaml = r#"
name: "mirrors"
parallel_groups:
  fetch:
    sync_policy: wait_any
steps:
  - id: "mirror-eu"
    type: "scripted"
    order: 1
    parallel_group: "fetch"
  - id: "mirror-us"
    type: "scripted"
    order: 1
    parallel_group: "fetch"
    parameters:
      sleep_ms: 3000
  - id: "install"
    type: "scripted"
    order: 2
"#;
    let executor = ScriptedExecutor::new();
    let started = Instant::now();
    let snapshot = run_to_end(&engine(&executor), &pipeline_from_yaml(yaml)).await;

    assert!(snapshot.is_success());
    assert!(started.elapsed().as_millis() < 2500);
    assert_step_status(&snapshot, "mirror-eu", ExecutionStatus::Success);
    assert_step_status(&snapshot, "mirror-us", ExecutionStatus::Cancelled);
    assert_step_status(&snapshot, "install", ExecutionStatus::Success);

    let cancelled = snapshot.cancelled_steps();
    assert_eq!(cancelled.len(), 1);
    assert!(cancelled[0].1.contains("mirror-eu"));
}

#[tokio::test]
async fn test_fail_fast_cancels_siblings_and_downstream() {
    let yaml = r#"
name: "checks"
parallel_groups:
  checks:
    sync_policy: fail_fast
steps:
  - id: "lint"
    type: "scripted"
    order: 1
    parallel_group: "checks"
    parameters:
      fail: "yes"
  - id: "audit"
    type: "scripted"
    order: 1
    parallel_group: "checks"
    parameters:
      sleep_ms: 3000
  - id: "typecheck"
    type: "scripted"
    order: 1
    parallel_group: "checks"
    parameters:
      sleep_ms: 3000
  - id: "deploy"
    type: "scripted"
    order: 2
"#;
    let executor = ScriptedExecutor::new();
    let started = Instant::now();
    let snapshot = run_to_end(&engine(&executor), &pipeline_from_yaml(yaml)).await;

    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert!(started.elapsed().as_millis() < 2500);
    assert_step_status(&snapshot, "lint", ExecutionStatus::Failed);
    assert_step_status(&snapshot, "audit", ExecutionStatus::Cancelled);
    assert_step_status(&snapshot, "typecheck", ExecutionStatus::Cancelled);
    assert_step_status(&snapshot, "deploy", ExecutionStatus::Cancelled);
    assert_all_terminal(&snapshot);
}

#[tokio::test]
async fn test_group_timeout_cancels_stragglers() {
    let yaml = r#"
name: "bounded"
parallel_groups:
  soak:
    sync_policy: wait_all
    timeout_secs: 1
steps:
  - id: "quick"
    type: "scripted"
    order: 1
    parallel_group: "soak"
  - id: "soak-test"
    type: "scripted"
    order: 1
    parallel_group: "soak"
    parameters:
      sleep_ms: 5000
"#;
    let executor = ScriptedExecutor::new();
    let snapshot = run_to_end(&engine(&executor), &pipeline_from_yaml(yaml)).await;

    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert_step_status(&snapshot, "quick", ExecutionStatus::Success);
    let soak = snapshot.step("soak-test").unwrap();
    assert_eq!(soak.status, ExecutionStatus::Cancelled);
    assert!(soak.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(snapshot.failure.as_ref().unwrap().stage_index, Some(0));
}

#[tokio::test]
async fn test_max_workers_bounds_concurrency() {
    let mut yaml = String::from(
        r#"
name: "fan-out"
execution:
  max_workers: 2
steps:
"#,
    );
    for i in 0..6 {
        yaml.push_str(&format!(
            "  - id: \"shard-{}\"\n    type: \"scripted\"\n    order: 1\n    parallel_group: \"shards\"\n    parameters:\n      sleep_ms: 50\n",
            i
        ));
    }
    let executor = ScriptedExecutor::new();
    let snapshot = run_to_end(&engine(&executor), &pipeline_from_yaml(&yaml)).await;

    assert!(snapshot.is_success());
    assert_eq!(executor.calls(), 6);
    assert!(executor.peak_concurrency() <= 2);
}

#[tokio::test]
async fn test_parallel_stage_events() {
    let yaml = r#"
name: "events"
steps:
  - id: "prepare"
    type: "scripted"
    order: 1
  - id: "left"
    type: "scripted"
    order: 2
    parallel_group: "pair"
  - id: "right"
    type: "scripted"
    order: 2
    parallel_group: "pair"
"#;
    let executor = ScriptedExecutor::new();
    let engine = engine(&executor);
    let events = record_events(&engine);
    let snapshot = run_to_end(&engine, &pipeline_from_yaml(yaml)).await;
    assert!(snapshot.is_success());

    let events = events.lock().unwrap();
    let stages: Vec<(usize, StageKind, Option<String>, usize)> = events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::StageStarted {
                stage_index,
                kind,
                group,
                step_count,
                ..
            } => Some((*stage_index, *kind, group.clone(), *step_count)),
            _ => None,
        })
        .collect();
    assert_eq!(
        stages,
        vec![
            (0, StageKind::Sequential, None, 1),
            (1, StageKind::Parallel, Some("pair".to_string()), 2),
        ]
    );
    assert!(matches!(
        events.first(),
        Some(ExecutionEvent::RunStarted { total_stages: 2, .. })
    ));
}
