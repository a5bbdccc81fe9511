//! Parallel execution coordinator - runs one stage at a time

use crate::core::{
    ContextDelta, ExecutionStatus, ExecutorError, OrchestratorError, RunFailure, Step, SyncPolicy,
    WorkspaceContext,
};
use crate::execution::{
    executor::{ExecutorRegistry, StepExecutor, StepResult},
    planner::{ExecutionPlan, Stage},
    tracker::RunTracker,
    worker_pool::{Job, TaskBatch, WorkQueue, WorkerPool},
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How one member of a stage ended
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub step_id: String,
    pub status: ExecutionStatus,
    pub output: String,
    pub error: Option<String>,
    pub delta: ContextDelta,
    /// Failed, but the step allows failure
    pub tolerated: bool,
}

impl StepOutcome {
    fn finished(step: &Step, result: StepResult) -> Self {
        let tolerated = !result.success && step.continue_on_failure;
        Self {
            step_id: step.id.clone(),
            status: if result.success {
                ExecutionStatus::Success
            } else {
                ExecutionStatus::Failed
            },
            output: result.output,
            error: result.error,
            delta: result.data_delta,
            tolerated,
        }
    }

    fn cancelled(step: &Step, reason: &str) -> Self {
        Self {
            step_id: step.id.clone(),
            status: ExecutionStatus::Cancelled,
            output: String::new(),
            error: Some(reason.to_string()),
            delta: ContextDelta::default(),
            tolerated: false,
        }
    }
}

/// Aggregate outcome of a stage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageResult {
    pub stage_index: usize,
    pub success: bool,
    /// One entry per member, in stage order
    pub outcomes: Vec<StepOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Failures allowed by `continue_on_failure`, included in `failed`
    pub tolerated: usize,
    /// First failure that decided the stage
    pub failure: Option<RunFailure>,
    /// Member whose success satisfied a `wait_any` stage
    pub satisfied_by: Option<String>,
    pub timed_out: bool,
}

impl StageResult {
    pub fn empty(stage_index: usize) -> Self {
        Self {
            stage_index,
            success: true,
            ..Default::default()
        }
    }

    pub fn outcome(&self, step_id: &str) -> Option<&StepOutcome> {
        self.outcomes.iter().find(|o| o.step_id == step_id)
    }

    pub fn status_of(&self, step_id: &str) -> Option<ExecutionStatus> {
        self.outcome(step_id).map(|o| o.status)
    }

    /// Workspace deltas of successful members, in stage order
    pub fn deltas(&self) -> impl Iterator<Item = &ContextDelta> {
        self.outcomes
            .iter()
            .filter(|o| o.status == ExecutionStatus::Success)
            .map(|o| &o.delta)
    }

    /// Fold in the result of a later sub-batch of the same stage
    pub fn absorb(&mut self, other: StageResult) {
        self.outcomes.extend(other.outcomes);
        if self.failure.is_none() {
            self.failure = other.failure;
        }
        if self.satisfied_by.is_none() {
            self.satisfied_by = other.satisfied_by;
        }
        self.timed_out |= other.timed_out;
    }

    /// Recount members and decide success under `policy`
    pub fn settle(&mut self, policy: SyncPolicy) {
        self.succeeded = self.count(ExecutionStatus::Success);
        self.failed = self.count(ExecutionStatus::Failed);
        self.cancelled = self.count(ExecutionStatus::Cancelled);
        self.tolerated = self.outcomes.iter().filter(|o| o.tolerated).count();

        self.success = if self.timed_out {
            false
        } else {
            match policy {
                SyncPolicy::WaitAny => self.satisfied_by.is_some() || self.failure.is_none(),
                SyncPolicy::WaitAll | SyncPolicy::FailFast => self.failure.is_none(),
            }
        };
    }

    fn count(&self, status: ExecutionStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

/// Anything that can resolve a stage against a workspace snapshot
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute_stage(
        &self,
        stage: &Stage,
        context: &WorkspaceContext,
        tracker: &RunTracker,
    ) -> StageResult;
}

/// Outcome of walking a whole plan
#[derive(Debug, Clone, Default)]
pub struct PlanOutcome {
    pub success: bool,
    pub stages: Vec<StageResult>,
    pub failure: Option<RunFailure>,
}

/// Walk `plan` stage by stage
///
/// Deltas are merged into the run workspace only after a stage resolves.
/// A failed stage stops the walk and every step of the later stages is
/// recorded as cancelled with a reason naming the failure.
pub async fn run_plan(
    plan: &ExecutionPlan,
    executor: &dyn StageExecutor,
    tracker: &RunTracker,
) -> PlanOutcome {
    let mut outcome = PlanOutcome {
        success: true,
        ..Default::default()
    };

    for (position, stage) in plan.stages.iter().enumerate() {
        tracker.begin_stage(stage).await;
        let context = tracker.workspace().await;
        let result = executor.execute_stage(stage, &context, tracker).await;

        for delta in result.deltas() {
            tracker.apply_delta(delta).await;
        }
        tracker.end_stage(stage, result.success).await;

        let stage_failed = !result.success;
        let failure = result.failure.clone();
        outcome.stages.push(result);
        if !stage_failed {
            continue;
        }

        let failure = failure.unwrap_or_else(|| RunFailure {
            stage_index: Some(stage.index),
            step_id: None,
            error: format!("{} failed", stage.label()),
        });
        info!("Stopping run {} after {}: {}", tracker.run_id(), stage.label(), failure.error);

        let reason = downstream_reason(stage, &failure);
        for later in &plan.stages[position + 1..] {
            for step in &later.steps {
                tracker.step_cancelled(step, Some(later.index), &reason).await;
            }
        }

        tracker.record_failure(failure.clone()).await;
        outcome.success = false;
        outcome.failure = Some(failure);
        break;
    }

    outcome
}

fn downstream_reason(stage: &Stage, failure: &RunFailure) -> String {
    match &failure.step_id {
        Some(step_id) => format!(
            "cancelled: step '{}' in {} failed",
            step_id,
            stage.label()
        ),
        None => format!("cancelled: {} failed ({})", stage.label(), failure.error),
    }
}

/// Runs stages on a bounded work queue and applies sync policies
pub struct ParallelExecutionCoordinator {
    registry: ExecutorRegistry,
    queue: Arc<dyn WorkQueue>,
}

impl ParallelExecutionCoordinator {
    pub fn new(registry: ExecutorRegistry, queue: Arc<dyn WorkQueue>) -> Self {
        Self { registry, queue }
    }

    /// Coordinator backed by an in-process pool of `workers`
    pub fn with_workers(registry: ExecutorRegistry, workers: usize) -> Self {
        Self::new(registry, Arc::new(WorkerPool::new(workers)))
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    pub fn workers(&self) -> usize {
        self.queue.capacity()
    }

    /// Resolve `stage`, bounded by `deadline` when one is given
    ///
    /// The deadline only applies to parallel stages; members still
    /// unresolved when it passes are cancelled with a timeout reason.
    pub async fn execute_until(
        &self,
        stage: &Stage,
        context: &WorkspaceContext,
        tracker: &RunTracker,
        deadline: Option<Instant>,
    ) -> StageResult {
        if stage.steps.is_empty() {
            return StageResult::empty(stage.index);
        }
        tracker.register_steps(stage).await;

        let policy = if stage.is_parallel() {
            stage.policy()
        } else {
            SyncPolicy::WaitAll
        };
        let deadline = if stage.is_parallel() { deadline } else { None };

        let steps: HashMap<&str, &Step> = stage.steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let mut outcomes: HashMap<String, StepOutcome> = HashMap::new();
        let mut result = StageResult::empty(stage.index);

        let context = Arc::new(context.clone());
        let mut batch = self.queue.open_batch();
        for step in &stage.steps {
            let job = self.job_for(step, context.clone(), tracker.clone());
            batch.submit(step.id.clone(), job);
        }

        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, batch.next_completion()).await {
                    Ok(next) => next,
                    Err(_) => {
                        result.timed_out = true;
                        break;
                    }
                },
                None => batch.next_completion().await,
            };
            let Some(completion) = next else {
                break;
            };
            let Some(step) = steps.get(completion.task_id.as_str()).copied() else {
                warn!("Completion for unknown task {}", completion.task_id);
                continue;
            };

            let step_result = completion.outcome.unwrap_or_else(StepResult::failure);
            let outcome = StepOutcome::finished(step, step_result.clone());
            tracker
                .step_finished(&step.id, &step_result, outcome.tolerated)
                .await;

            let decisive_failure = outcome.status == ExecutionStatus::Failed && !outcome.tolerated;
            outcomes.insert(step.id.clone(), outcome);

            if step_result.success && policy == SyncPolicy::WaitAny {
                debug!("Step {} satisfied {}", step.id, stage.label());
                result.satisfied_by = Some(step.id.clone());
                let reason = format!(
                    "cancelled: step '{}' satisfied wait_any in {}",
                    step.id,
                    stage.label()
                );
                self.cancel_unresolved(batch.as_mut(), &steps, stage, tracker, &reason, &mut outcomes)
                    .await;
                break;
            }

            if decisive_failure {
                if result.failure.is_none() {
                    result.failure = Some(RunFailure {
                        stage_index: Some(stage.index),
                        step_id: Some(step.id.clone()),
                        error: step_result.error.clone().unwrap_or_default(),
                    });
                }
                if policy == SyncPolicy::FailFast {
                    let reason = format!(
                        "cancelled: step '{}' failed in fail_fast {}",
                        step.id,
                        stage.label()
                    );
                    self.cancel_unresolved(batch.as_mut(), &steps, stage, tracker, &reason, &mut outcomes)
                        .await;
                    break;
                }
            }
        }

        if result.timed_out {
            let seconds = stage.timeout_secs.unwrap_or_default();
            let error = OrchestratorError::Timeout {
                scope: stage.label(),
                seconds,
            };
            warn!("{}", error);
            let reason = format!("cancelled: {}", error);
            self.cancel_unresolved(batch.as_mut(), &steps, stage, tracker, &reason, &mut outcomes)
                .await;
            if result.failure.is_none() {
                result.failure = Some(RunFailure {
                    stage_index: Some(stage.index),
                    step_id: None,
                    error: error.to_string(),
                });
            }
        }

        result.outcomes = stage
            .steps
            .iter()
            .filter_map(|s| outcomes.remove(&s.id))
            .collect();
        result.settle(policy);

        debug!(
            "{} resolved: success={} ({} ok, {} failed, {} cancelled)",
            stage.label(),
            result.success,
            result.succeeded,
            result.failed,
            result.cancelled
        );
        result
    }

    async fn cancel_unresolved(
        &self,
        batch: &mut dyn TaskBatch,
        steps: &HashMap<&str, &Step>,
        stage: &Stage,
        tracker: &RunTracker,
        reason: &str,
        outcomes: &mut HashMap<String, StepOutcome>,
    ) {
        for task_id in batch.unresolved() {
            let state = batch.cancel(&task_id);
            let Some(step) = steps.get(task_id.as_str()).copied() else {
                continue;
            };
            debug!("Cancelling step {} ({:?})", step.id, state);
            tracker.step_cancelled(step, Some(stage.index), reason).await;
            outcomes.insert(step.id.clone(), StepOutcome::cancelled(step, reason));
        }
    }

    fn job_for(&self, step: &Step, context: Arc<WorkspaceContext>, tracker: RunTracker) -> Job {
        let executor = self.registry.get(&step.step_type);
        let step = step.clone();
        Box::pin(async move {
            tracker.step_started(&step.id).await;
            match executor {
                Some(executor) => run_step(executor, &step, &context).await,
                None => StepResult::failure(format!(
                    "no executor registered for step type '{}'",
                    step.step_type
                )),
            }
        })
    }
}

/// Execute one step under its timeout, folding executor errors into a failed result
pub async fn run_step(
    executor: Arc<dyn StepExecutor>,
    step: &Step,
    context: &WorkspaceContext,
) -> StepResult {
    let outcome = if step.timeout_secs > 0 {
        match tokio::time::timeout(
            Duration::from_secs(step.timeout_secs),
            executor.execute(step, context),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                let error = OrchestratorError::Timeout {
                    scope: format!("step '{}'", step.id),
                    seconds: step.timeout_secs,
                };
                return StepResult::failure(error.to_string());
            }
        }
    } else {
        executor.execute(step, context).await
    };

    match outcome {
        Ok(result) => result,
        Err(err) => step_error(step, err),
    }
}

fn step_error(step: &Step, err: ExecutorError) -> StepResult {
    let error = OrchestratorError::StepExecution {
        step_id: step.id.clone(),
        message: err.to_string(),
    };
    StepResult::failure(error.to_string())
}

#[async_trait]
impl StageExecutor for ParallelExecutionCoordinator {
    async fn execute_stage(
        &self,
        stage: &Stage,
        context: &WorkspaceContext,
        tracker: &RunTracker,
    ) -> StageResult {
        let deadline = stage
            .timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        self.execute_until(stage, context, tracker, deadline).await
    }
}
