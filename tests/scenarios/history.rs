//! Test: run records in the history store

use crate::helpers::*;
use pipeline_orchestrator::core::{ExecutionStatus, OrchestratorError};
use pipeline_orchestrator::execution::ExecutionEngine;
use pipeline_orchestrator::persistence::{InMemoryRunStore, RunStore, SqliteRunStore};
use pipeline_orchestrator::remote::RemoteBuildStatus;
use std::sync::Arc;

const YAML: &str = r#"
name: "nightly"
variables:
  CHANNEL: "beta"
steps:
  - id: "fetch"
    type: "scripted"
    order: 1
  - id: "bench"
    type: "scripted"
    order: 2
    max_retries: 3
    parameters:
      fail: "yes"
  - id: "upload"
    type: "scripted"
    order: 3
"#;

fn engine_with_store(store: Arc<dyn RunStore>) -> ExecutionEngine {
    let executor = ScriptedExecutor::new();
    ExecutionEngine::new(registry_for(executor, &["scripted"])).with_store(store)
}

#[tokio::test]
async fn test_finished_run_round_trips_through_sqlite() {
    let store: Arc<dyn RunStore> = Arc::new(SqliteRunStore::new(":memory:").await.unwrap());
    let engine = engine_with_store(store.clone());
    let snapshot = run_to_end(&engine, &pipeline_from_yaml(YAML)).await;

    let stored = store.load_run(snapshot.run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Failed);
    assert_eq!(stored.mode, "local");
    assert_eq!(stored.total_stages, 3);
    assert_eq!(stored.failure, snapshot.failure);
    assert_eq!(stored.workspace.get("CHANNEL"), Some("beta"));
    assert_eq!(stored.workspace.get("fetch.done"), Some("yes"));

    let ids: Vec<&str> = stored.step_executions.iter().map(|s| s.step_id.as_str()).collect();
    assert_eq!(ids, vec!["fetch", "bench", "upload"]);
    assert_eq!(
        stored.step_execution("upload").unwrap().status,
        ExecutionStatus::Cancelled
    );
    assert_eq!(stored.snapshot().retryable_steps(), ["bench".to_string()]);
}

#[tokio::test]
async fn test_status_and_history_come_from_the_store() {
    let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
    let engine = engine_with_store(store.clone());
    let pipeline = pipeline_from_yaml(YAML);

    let first = run_to_end(&engine, &pipeline).await;
    let second = run_to_end(&engine, &pipeline).await;

    let status = engine.status(first.run_id).await.unwrap();
    assert_eq!(status.status, ExecutionStatus::Failed);
    assert_eq!(status.steps.len(), 3);

    let history = engine.history(Some("nightly"), 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, second.run_id);
    assert!(engine.history(Some("weekly"), 10).await.unwrap().is_empty());
    assert_eq!(engine.history(None, 1).await.unwrap().len(), 1);
    assert_eq!(store.list_pipelines().await.unwrap(), vec!["nightly"]);
}

#[tokio::test]
async fn test_reconcile_after_finish_is_rejected() {
    let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
    let engine = engine_with_store(store);
    let snapshot = run_to_end(&engine, &pipeline_from_yaml(YAML)).await;

    let err = engine
        .reconcile(snapshot.run_id, RemoteBuildStatus::Success)
        .await
        .unwrap_err();
    assert_eq!(err, OrchestratorError::RunNotFound(snapshot.run_id));
}
