//! Test utilities for pipeline-orchestrator scenarios

#![allow(dead_code)]

use async_trait::async_trait;
use pipeline_orchestrator::core::config::{PipelineConfig, RemoteConfig};
use pipeline_orchestrator::core::{
    ContextDelta, ExecutionStatus, ExecutorError, OrchestratorError, Pipeline, RunSnapshot, Step,
    TriggerMetadata, WorkspaceContext,
};
use pipeline_orchestrator::execution::{
    ExecutionEngine, ExecutionEvent, ExecutorRegistry, StepExecutor, StepResult,
};
use pipeline_orchestrator::remote::{
    BuildTrigger, PipelineDefinition, RemoteBuildStatus, RemoteRegistry, ToolType,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Executor driven by step parameters
///
/// - `sleep_ms`: delay before finishing
/// - `fail`: report a failed result
/// - `panic`: panic inside the executor
/// - `echo`: template rendered against the workspace as output
///
/// Every success writes `<id>.done = yes` and appends the id to `trail`.
#[derive(Default)]
pub struct ScriptedExecutor {
    started: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Step ids in the order they started
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    /// Highest number of steps running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        step: &Step,
        context: &WorkspaceContext,
    ) -> Result<StepResult, ExecutorError> {
        self.started.lock().unwrap().push(step.id.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        if let Some(ms) = step.parameters.get("sleep_ms").and_then(|v| v.as_u64()) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if step.param_str("panic").is_some() {
            panic!("executor for {} blew up", step.id);
        }
        if step.param_str("fail").is_some() {
            return Ok(StepResult::failure(format!("{} failed on purpose", step.id)));
        }

        let output = match step.param_str("echo") {
            Some(template) => context.render(template),
            None => step.id.clone(),
        };
        let trail = context.get("trail").unwrap_or("").to_string();
        let delta = ContextDelta::new()
            .with(format!("{}.done", step.id), "yes")
            .with("trail", format!("{}{}/", trail, step.id));
        Ok(StepResult::success(output).with_delta(delta))
    }

    fn render_script(&self, step: &Step) -> Result<String, ExecutorError> {
        Ok(format!("echo {}", step.id))
    }
}

/// Registry mapping every given type tag to the same executor
pub fn registry_for(executor: Arc<ScriptedExecutor>, types: &[&str]) -> ExecutorRegistry {
    types.iter().fold(ExecutorRegistry::new(), |registry, tag| {
        registry.with(tag, executor.clone() as Arc<dyn StepExecutor>)
    })
}

/// Build trigger replaying a script of statuses
///
/// The last status repeats once the script runs out.
pub struct MockTrigger {
    statuses: Mutex<VecDeque<RemoteBuildStatus>>,
    dispatch_error: Option<String>,
    definitions: Mutex<Vec<PipelineDefinition>>,
    variables: Mutex<Vec<WorkspaceContext>>,
    polls: AtomicUsize,
}

impl MockTrigger {
    pub fn new(statuses: &[RemoteBuildStatus]) -> Arc<Self> {
        Arc::new(Self {
            statuses: Mutex::new(statuses.iter().copied().collect()),
            dispatch_error: None,
            definitions: Mutex::new(Vec::new()),
            variables: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
        })
    }

    pub fn rejecting(message: &str) -> Arc<Self> {
        Arc::new(Self {
            statuses: Mutex::new(VecDeque::new()),
            dispatch_error: Some(message.to_string()),
            definitions: Mutex::new(Vec::new()),
            variables: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
        })
    }

    pub fn definitions(&self) -> Vec<PipelineDefinition> {
        self.definitions.lock().unwrap().clone()
    }

    pub fn variables(&self) -> Vec<WorkspaceContext> {
        self.variables.lock().unwrap().clone()
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildTrigger for MockTrigger {
    async fn trigger(
        &self,
        definition: &PipelineDefinition,
        variables: &WorkspaceContext,
    ) -> Result<String, OrchestratorError> {
        if let Some(message) = &self.dispatch_error {
            return Err(OrchestratorError::remote(definition.tool.as_str(), message.clone()));
        }
        let mut definitions = self.definitions.lock().unwrap();
        definitions.push(definition.clone());
        self.variables.lock().unwrap().push(variables.clone());
        Ok(format!("build-{}", definitions.len()))
    }

    async fn status(&self, _external_id: &str) -> Result<RemoteBuildStatus, OrchestratorError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut statuses = self.statuses.lock().unwrap();
        let status = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().copied()
        };
        Ok(status.unwrap_or(RemoteBuildStatus::Running))
    }
}

/// Remote registry with generators and `trigger` installed for `tool`
pub fn remote_with(tool: ToolType, trigger: Arc<MockTrigger>) -> RemoteRegistry {
    let mut remote = RemoteRegistry::with_generators();
    remote.register_trigger(tool, trigger as Arc<dyn BuildTrigger>);
    remote
}

/// Remote settings pointing at an unreachable host; the mock trigger never calls it
pub fn remote_config(tool: &str, poll_interval_secs: u64, timeout_secs: u64) -> RemoteConfig {
    RemoteConfig {
        tool: tool.to_string(),
        endpoint: "http://ci.invalid".to_string(),
        project: "group/app".to_string(),
        workflow: None,
        git_ref: "main".to_string(),
        token_env: None,
        poll_interval_secs,
        timeout_secs,
    }
}

pub fn pipeline_from_yaml(yaml: &str) -> Pipeline {
    PipelineConfig::from_yaml(yaml).unwrap().to_pipeline()
}

/// Run a pipeline to completion
pub async fn run_to_end(engine: &ExecutionEngine, pipeline: &Pipeline) -> RunSnapshot {
    engine
        .run(pipeline, TriggerMetadata::manual("tests"))
        .await
        .unwrap()
        .wait()
        .await
}

/// Collect every event the engine emits
pub fn record_events(engine: &ExecutionEngine) -> Arc<Mutex<Vec<ExecutionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    engine.subscribe(move |event| sink.lock().unwrap().push(event));
    events
}

pub fn assert_step_status(snapshot: &RunSnapshot, step_id: &str, expected: ExecutionStatus) {
    assert_eq!(
        snapshot.step_status(step_id),
        Some(expected),
        "unexpected status for step '{}': {:#?}",
        step_id,
        snapshot.steps
    );
}

/// Every step record is terminal once a run has finished
pub fn assert_all_terminal(snapshot: &RunSnapshot) {
    assert!(snapshot.status.is_terminal());
    for step in &snapshot.steps {
        assert!(
            step.status.is_terminal(),
            "step '{}' left in {:?}",
            step.step_id,
            step.status
        );
    }
}
