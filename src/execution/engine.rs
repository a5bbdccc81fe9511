//! Main execution engine - starts pipeline runs and tracks them to completion

use crate::core::{
    config::{ExecutionConfig, OptimizerConfig},
    ExecutionMode, ExecutionStatus, OrchestratorError, Pipeline, PipelineRun, RunFailure,
    RunSnapshot, Step, TriggerMetadata,
};
use crate::execution::{
    coordinator::{run_plan, ParallelExecutionCoordinator},
    executor::{ExecutorRegistry, StepResult},
    optimizer::PerformanceOptimizer,
    placement::place,
    planner::{ExecutionPlan, ExecutionPlanner},
    tracker::{EventBus, ExecutionEvent, RunTracker},
};
use crate::persistence::RunStore;
use crate::remote::{
    BuildTrigger, PipelineDefinition, RemoteBuildStatus, RemoteRegistry, StepScripts, ToolType,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Remote half of a run, generated before the run starts
struct RemoteBranch {
    tool: ToolType,
    plan: ExecutionPlan,
    definition: PipelineDefinition,
    trigger: Arc<dyn BuildTrigger>,
    poll_interval: Duration,
    timeout: Duration,
}

/// Engine-side handles of a run still held in memory
#[derive(Clone)]
struct LiveRun {
    tracker: RunTracker,
    /// Build status pushed by [`ExecutionEngine::reconcile`]
    reconciled: Arc<watch::Sender<Option<RemoteBuildStatus>>>,
}

/// Handle to a started run
pub struct RunHandle {
    pub run_id: Uuid,
    tracker: RunTracker,
    task: JoinHandle<()>,
}

impl RunHandle {
    /// Current state without waiting
    pub async fn snapshot(&self) -> RunSnapshot {
        self.tracker.snapshot().await
    }

    /// Wait for the run to resolve
    pub async fn wait(self) -> RunSnapshot {
        if let Err(e) = self.task.await {
            warn!("Run {} task ended abnormally: {}", self.run_id, e);
            self.tracker
                .record_failure(RunFailure {
                    stage_index: None,
                    step_id: None,
                    error: format!("run task ended abnormally: {}", e),
                })
                .await;
            self.tracker.finish(ExecutionStatus::Failed).await;
        }
        self.tracker.snapshot().await
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle").field("run_id", &self.run_id).finish()
    }
}

/// Main pipeline execution engine
///
/// Cloning is cheap; clones share live runs, handlers, the store and the
/// optimizer cache.
#[derive(Clone)]
pub struct ExecutionEngine {
    registry: ExecutorRegistry,
    remote: RemoteRegistry,
    store: Option<Arc<dyn RunStore>>,
    events: EventBus,
    runs: Arc<RwLock<HashMap<Uuid, LiveRun>>>,
    pinned_optimizer: Option<Arc<PerformanceOptimizer>>,
    optimizers: Arc<Mutex<HashMap<OptimizerConfig, Arc<PerformanceOptimizer>>>>,
}

impl ExecutionEngine {
    pub fn new(registry: ExecutorRegistry) -> Self {
        Self {
            registry,
            remote: RemoteRegistry::with_generators(),
            store: None,
            events: EventBus::new(),
            runs: Arc::new(RwLock::new(HashMap::new())),
            pinned_optimizer: None,
            optimizers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Generators and triggers to use instead of the configured HTTP ones
    pub fn with_remote(mut self, remote: RemoteRegistry) -> Self {
        self.remote = remote;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `optimizer` for every optimized run, whatever the pipeline configures
    pub fn with_optimizer(mut self, optimizer: PerformanceOptimizer) -> Self {
        self.pinned_optimizer = Some(Arc::new(optimizer));
        self
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    pub fn store(&self) -> Option<&Arc<dyn RunStore>> {
        self.store.as_ref()
    }

    /// Add an event handler
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler);
    }

    /// Mode for a run: the trigger's override, else the pipeline's setting
    pub fn resolve_mode(
        pipeline: &Pipeline,
        trigger: &TriggerMetadata,
    ) -> Result<ExecutionMode, OrchestratorError> {
        let requested = trigger
            .mode_override
            .as_deref()
            .unwrap_or(&pipeline.execution.mode);
        requested.parse().map_err(OrchestratorError::Planning)
    }

    /// Generate the tool-native definition of a whole pipeline
    ///
    /// `tool` overrides the pipeline's configured remote tool.
    pub fn generate(
        &self,
        pipeline: &Pipeline,
        tool: Option<&str>,
    ) -> Result<PipelineDefinition, OrchestratorError> {
        let name = match (tool, &pipeline.execution.remote) {
            (Some(name), _) => name,
            (None, Some(remote)) => remote.tool.as_str(),
            (None, None) => {
                return Err(OrchestratorError::remote(
                    "none",
                    "no remote tool given and the pipeline has no execution.remote section",
                ))
            }
        };
        let tool = ToolType::resolve(name)?;
        let plan = ExecutionPlanner::for_pipeline(pipeline)?;
        self.definition(&self.remote, tool, &pipeline.name, &plan)
    }

    fn definition(
        &self,
        remote: &RemoteRegistry,
        tool: ToolType,
        pipeline_name: &str,
        plan: &ExecutionPlan,
    ) -> Result<PipelineDefinition, OrchestratorError> {
        let scripts = StepScripts::render(plan, &self.registry, tool)?;
        remote.generator(tool)?.generate(pipeline_name, plan, &scripts)
    }

    fn check_local(&self, steps: &[Step]) -> Result<(), OrchestratorError> {
        let missing = self.registry.missing_types(steps);
        if missing.is_empty() {
            return Ok(());
        }
        Err(OrchestratorError::planning(format!(
            "no executor registered for step type(s): {}",
            missing.join(", ")
        )))
    }

    fn remote_branch(
        &self,
        pipeline: &Pipeline,
        plan: ExecutionPlan,
    ) -> Result<RemoteBranch, OrchestratorError> {
        let config = pipeline.execution.remote.as_ref().ok_or_else(|| {
            OrchestratorError::remote("none", "pipeline has no execution.remote section")
        })?;
        let tool = ToolType::resolve(&config.tool)?;

        let configured;
        let remote = if self.remote.has_trigger(tool) {
            &self.remote
        } else {
            configured = RemoteRegistry::from_config(config)?;
            &configured
        };

        let definition = self.definition(remote, tool, &pipeline.name, &plan)?;
        debug!(
            "Generated {} definition {} ({} bytes)",
            tool,
            definition.file_name,
            definition.content.len()
        );

        Ok(RemoteBranch {
            tool,
            definition,
            trigger: remote.trigger(tool)?,
            plan,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    fn optimizer_for(&self, config: &OptimizerConfig) -> Arc<PerformanceOptimizer> {
        if let Some(pinned) = &self.pinned_optimizer {
            return pinned.clone();
        }
        let mut optimizers = match self.optimizers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        optimizers
            .entry(config.clone())
            .or_insert_with(|| Arc::new(PerformanceOptimizer::new(config.clone())))
            .clone()
    }

    /// Start a run of `pipeline`
    ///
    /// Planning and code generation happen before this returns; their errors
    /// mean no run was created. Everything after that is reported through
    /// the run record.
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        trigger: TriggerMetadata,
    ) -> Result<RunHandle, OrchestratorError> {
        let mode = Self::resolve_mode(pipeline, &trigger)?;
        let plan = ExecutionPlanner::for_pipeline(pipeline)?;

        let (local, remote) = match mode {
            // Nothing to dispatch; the empty plan resolves as success
            _ if plan.is_empty() => (Some(plan), None),
            ExecutionMode::Local => {
                self.check_local(&pipeline.steps)?;
                (Some(plan), None)
            }
            ExecutionMode::Remote => (None, Some(self.remote_branch(pipeline, plan)?)),
            ExecutionMode::Hybrid => {
                let placement = place(&pipeline.steps, &pipeline.execution.hybrid);
                self.check_local(&placement.local)?;
                let local = if placement.local.is_empty() {
                    None
                } else {
                    Some(ExecutionPlanner::build(&placement.local, &pipeline.groups)?)
                };
                let remote = if placement.remote.is_empty() {
                    None
                } else {
                    let remote_plan = ExecutionPlanner::build(&placement.remote, &pipeline.groups)?;
                    let mut branch = self.remote_branch(pipeline, remote_plan)?;
                    // Remote stages are numbered after the local ones within the run
                    branch
                        .plan
                        .offset_indices(local.as_ref().map_or(0, |p| p.total_stages));
                    Some(branch)
                };
                (local, remote)
            }
        };
        let total_stages = local.as_ref().map_or(0, |p| p.total_stages)
            + remote.as_ref().map_or(0, |r| r.plan.total_stages);

        let mut workspace = pipeline.initial_workspace();
        for (key, value) in &trigger.variables {
            workspace.set(key.clone(), value.clone());
        }
        let record = PipelineRun::new(&pipeline.name, mode.as_str(), trigger, workspace);
        let run_id = record.id;

        let mut tracker = RunTracker::new(record, self.events.clone());
        if let Some(store) = &self.store {
            tracker = tracker.with_store(store.clone());
        }
        let (reconciled, _) = watch::channel(None);
        let reconciled = Arc::new(reconciled);
        self.runs.write().await.insert(
            run_id,
            LiveRun {
                tracker: tracker.clone(),
                reconciled: reconciled.clone(),
            },
        );

        let engine = self.clone();
        let settings = pipeline.execution.clone();
        let task_tracker = tracker.clone();
        let task = tokio::spawn(async move {
            engine
                .drive(mode, total_stages, local, remote, settings, task_tracker, reconciled)
                .await;
        });

        Ok(RunHandle {
            run_id,
            tracker,
            task,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        mode: ExecutionMode,
        total_stages: usize,
        local: Option<ExecutionPlan>,
        remote: Option<RemoteBranch>,
        settings: ExecutionConfig,
        tracker: RunTracker,
        reconciled: Arc<watch::Sender<Option<RemoteBuildStatus>>>,
    ) {
        tracker.start(mode, total_stages).await;

        let local_branch = async {
            match &local {
                Some(plan) => self.execute_local(plan, &settings, &tracker).await,
                None => ExecutionStatus::Success,
            }
        };
        let remote_branch = async {
            match &remote {
                Some(branch) => {
                    self.execute_remote(branch, &tracker, reconciled.subscribe())
                        .await
                }
                None => ExecutionStatus::Success,
            }
        };
        let (local_status, remote_status) = tokio::join!(local_branch, remote_branch);

        let status = if local_status == ExecutionStatus::Failed
            || remote_status == ExecutionStatus::Failed
        {
            ExecutionStatus::Failed
        } else if local_status == ExecutionStatus::Success
            && remote_status == ExecutionStatus::Success
        {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Cancelled
        };
        tracker.finish(status).await;

        // The store now holds the final record
        if self.store.is_some() {
            self.runs.write().await.remove(&tracker.run_id());
        }
    }

    async fn execute_local(
        &self,
        plan: &ExecutionPlan,
        settings: &ExecutionConfig,
        tracker: &RunTracker,
    ) -> ExecutionStatus {
        let outcome = if settings.optimizer.enabled {
            let optimizer = self.optimizer_for(&settings.optimizer);
            let optimized = optimizer.prepare(plan, &self.registry);
            let outcome = run_plan(plan, &optimized, tracker).await;
            optimized.log_stats();
            outcome
        } else {
            let coordinator =
                ParallelExecutionCoordinator::with_workers(self.registry.clone(), settings.max_workers);
            run_plan(plan, &coordinator, tracker).await
        };

        if outcome.success {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        }
    }

    async fn execute_remote(
        &self,
        branch: &RemoteBranch,
        tracker: &RunTracker,
        mut reconciled: watch::Receiver<Option<RemoteBuildStatus>>,
    ) -> ExecutionStatus {
        for stage in &branch.plan.stages {
            tracker.register_steps(stage).await;
        }

        let workspace = tracker.workspace().await;
        let external_id = match branch.trigger.trigger(&branch.definition, &workspace).await {
            Ok(id) => id,
            Err(err) => {
                warn!("Remote dispatch failed: {}", err);
                return self.abandon_remote(branch, tracker, err.to_string()).await;
            }
        };
        tracker
            .remote_dispatched(branch.tool.as_str(), &external_id)
            .await;
        for (_, step) in branch.plan.steps() {
            tracker.step_started(&step.id).await;
        }

        let deadline = Instant::now() + branch.timeout;
        let polled = loop {
            let pushed = *reconciled.borrow_and_update();
            if let Some(status) = pushed.filter(RemoteBuildStatus::is_terminal) {
                break Ok(status);
            }
            match branch.trigger.status(&external_id).await {
                Ok(status) if status.is_terminal() => break Ok(status),
                Ok(status) => debug!("Remote build {} is {:?}", external_id, status),
                Err(err) => break Err(err.to_string()),
            }
            if Instant::now() >= deadline {
                break Err(OrchestratorError::Timeout {
                    scope: format!("remote build {}", external_id),
                    seconds: branch.timeout.as_secs(),
                }
                .to_string());
            }

            let wake = (Instant::now() + branch.poll_interval).min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                Ok(()) = reconciled.changed() => {}
            }
        };

        let status = match polled {
            Ok(status) => status,
            Err(message) => {
                warn!("Lost track of remote build {}: {}", external_id, message);
                return self.abandon_remote(branch, tracker, message).await;
            }
        };
        info!("Remote build {} finished: {:?}", external_id, status);

        let tool = branch.tool.as_str();
        match status {
            RemoteBuildStatus::Success => {
                let result = StepResult::success(format!("completed in {} build {}", tool, external_id));
                for (_, step) in branch.plan.steps() {
                    tracker.step_finished(&step.id, &result, false).await;
                }
            }
            RemoteBuildStatus::Failed => {
                let error = format!("{} build {} failed", tool, external_id);
                let result = StepResult::failure(error.clone());
                for (_, step) in branch.plan.steps() {
                    tracker
                        .step_finished(&step.id, &result, step.continue_on_failure)
                        .await;
                }
                tracker
                    .record_failure(RunFailure {
                        stage_index: None,
                        step_id: None,
                        error,
                    })
                    .await;
            }
            _ => {
                let reason = OrchestratorError::Cancellation(format!(
                    "{} build {} was cancelled",
                    tool, external_id
                ))
                .to_string();
                for (stage, step) in branch.plan.steps() {
                    tracker.step_cancelled(step, Some(stage.index), &reason).await;
                }
            }
        }
        status.as_execution_status()
    }

    /// Fail the remote branch, cancelling its unresolved steps
    async fn abandon_remote(
        &self,
        branch: &RemoteBranch,
        tracker: &RunTracker,
        error: String,
    ) -> ExecutionStatus {
        let reason = OrchestratorError::Cancellation(error.clone()).to_string();
        for (stage, step) in branch.plan.steps() {
            tracker.step_cancelled(step, Some(stage.index), &reason).await;
        }
        tracker
            .record_failure(RunFailure {
                stage_index: None,
                step_id: None,
                error,
            })
            .await;
        ExecutionStatus::Failed
    }

    /// Snapshot of a run: the live record if held, else the stored one
    pub async fn status(&self, run_id: Uuid) -> Result<RunSnapshot, OrchestratorError> {
        let live = self.runs.read().await.get(&run_id).cloned();
        if let Some(live) = live {
            return Ok(live.tracker.snapshot().await);
        }
        if let Some(store) = &self.store {
            if let Some(run) = store.load_run(run_id).await? {
                return Ok(run.snapshot());
            }
        }
        Err(OrchestratorError::RunNotFound(run_id))
    }

    /// Push a remote build status from outside, e.g. a webhook
    ///
    /// A terminal status resolves the run's remote branch without waiting
    /// for the next poll.
    pub async fn reconcile(
        &self,
        run_id: Uuid,
        status: RemoteBuildStatus,
    ) -> Result<(), OrchestratorError> {
        let live = self
            .runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(OrchestratorError::RunNotFound(run_id))?;
        info!("Reconciling run {} with remote status {:?}", run_id, status);
        live.reconciled.send_replace(Some(status));
        Ok(())
    }

    /// Recent runs, from the store when there is one
    pub async fn history(
        &self,
        pipeline_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PipelineRun>, OrchestratorError> {
        if let Some(store) = &self.store {
            return Ok(store.list_runs(pipeline_name, limit).await?);
        }

        let trackers: Vec<RunTracker> = self
            .runs
            .read()
            .await
            .values()
            .map(|live| live.tracker.clone())
            .collect();
        let mut runs = Vec::new();
        for tracker in trackers {
            let run = tracker.record().await;
            if pipeline_name.map_or(true, |name| run.pipeline_name == name) {
                runs.push(run);
            }
        }
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("registry", &self.registry)
            .field("remote", &self.remote)
            .field("persisted", &self.store.is_some())
            .finish()
    }
}
