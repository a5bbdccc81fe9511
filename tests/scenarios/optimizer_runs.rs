//! Test: runs through the performance optimizer

use crate::helpers::*;
use pipeline_orchestrator::core::config::OptimizerConfig;
use pipeline_orchestrator::core::ExecutionStatus;
use pipeline_orchestrator::execution::{ExecutionEngine, PerformanceOptimizer};

fn group_yaml(extra_execution: &str, members: &[(&str, u64)]) -> String {
    let mut yaml = format!(
        "name: \"optimized\"\nexecution:\n  optimizer:\n    enabled: true\n{}steps:\n",
        extra_execution
    );
    for (id, estimate) in members {
        yaml.push_str(&format!(
            "  - id: \"{}\"\n    type: \"scripted\"\n    order: 1\n    parallel_group: \"g\"\n    estimated_duration_secs: {}\n",
            id, estimate
        ));
    }
    yaml
}

#[tokio::test]
async fn test_repeat_run_is_served_from_cache() {
    let yaml = group_yaml("", &[("a", 1), ("b", 1), ("c", 1)]);
    let executor = ScriptedExecutor::new();
    let engine = ExecutionEngine::new(registry_for(executor.clone(), &["scripted"]));
    let pipeline = pipeline_from_yaml(&yaml);

    let first = run_to_end(&engine, &pipeline).await;
    let second = run_to_end(&engine, &pipeline).await;

    assert!(first.is_success());
    assert!(second.is_success());
    assert_eq!(executor.calls(), 3);
    assert_eq!(second.workspace.get("c.done"), Some("yes"));
}

#[tokio::test]
async fn test_shortest_estimate_starts_first() {
    let yaml = group_yaml(
        "    batch_size: 1\n",
        &[("slow", 30), ("fast", 5), ("medium", 10), ("also-fast", 5)],
    );
    let executor = ScriptedExecutor::new();
    let engine = ExecutionEngine::new(registry_for(executor.clone(), &["scripted"]));
    let snapshot = run_to_end(&engine, &pipeline_from_yaml(&yaml)).await;

    assert!(snapshot.is_success());
    assert_eq!(executor.started(), vec!["fast", "also-fast", "medium", "slow"]);
}

#[tokio::test]
async fn test_batches_keep_wait_any_semantics() {
    let mut yaml = group_yaml("    batch_size: 2\n", &[("a", 1), ("b", 2), ("c", 3), ("d", 4)]);
    yaml.push_str("parallel_groups:\n  g:\n    sync_policy: wait_any\n");
    let executor = ScriptedExecutor::new();
    let engine = ExecutionEngine::new(registry_for(executor.clone(), &["scripted"]));
    let snapshot = run_to_end(&engine, &pipeline_from_yaml(&yaml)).await;

    assert!(snapshot.is_success());
    assert!(executor.calls() <= 2);
    assert_step_status(&snapshot, "d", ExecutionStatus::Cancelled);
    assert_all_terminal(&snapshot);
}

#[tokio::test]
async fn test_pinned_optimizer_without_cache_reruns_steps() {
    let yaml = group_yaml("", &[("a", 1), ("b", 1)]);
    let config = OptimizerConfig {
        enabled: true,
        cache_enabled: false,
        ..Default::default()
    };
    let executor = ScriptedExecutor::new();
    let engine = ExecutionEngine::new(registry_for(executor.clone(), &["scripted"]))
        .with_optimizer(PerformanceOptimizer::new(config).with_cpus(2));
    let pipeline = pipeline_from_yaml(&yaml);

    run_to_end(&engine, &pipeline).await;
    run_to_end(&engine, &pipeline).await;

    assert_eq!(executor.calls(), 4);
}
