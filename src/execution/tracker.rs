//! Live run record and execution events
//!
//! All status changes of a run go through [`RunTracker`], which keeps the
//! record consistent and broadcasts an [`ExecutionEvent`] for each change.

use crate::core::{
    ContextDelta, ExecutionMode, ExecutionStatus, PipelineRun, RunFailure, RunSnapshot, Step,
    StepExecution, WorkspaceContext,
};
use crate::execution::{executor::StepResult, planner::Stage, planner::StageKind};
use crate::persistence::RunStore;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Events that can occur during a pipeline run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    RunStarted {
        run_id: Uuid,
        pipeline_name: String,
        mode: ExecutionMode,
        total_stages: usize,
    },
    StageStarted {
        run_id: Uuid,
        stage_index: usize,
        kind: StageKind,
        group: Option<String>,
        step_count: usize,
    },
    StepStarted {
        run_id: Uuid,
        step_id: String,
    },
    StepSucceeded {
        run_id: Uuid,
        step_id: String,
        output: String,
    },
    StepFailed {
        run_id: Uuid,
        step_id: String,
        error: String,
        /// The step allows failure; its stage is unaffected
        tolerated: bool,
    },
    StepCancelled {
        run_id: Uuid,
        step_id: String,
        reason: String,
    },
    StageCompleted {
        run_id: Uuid,
        stage_index: usize,
        success: bool,
    },
    RemoteDispatched {
        run_id: Uuid,
        tool: String,
        external_id: String,
    },
    RunCompleted {
        run_id: Uuid,
        status: ExecutionStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Fan-out of events to registered handlers
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<std::sync::RwLock<Vec<EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event handler
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    pub fn emit(&self, event: ExecutionEvent) {
        let handlers: Vec<EventHandler> = match self.handlers.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for handler in handlers {
            handler(event.clone());
        }
    }
}

impl std::fmt::Debug for RunTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunTracker")
            .field("run_id", &self.run_id)
            .field("persisted", &self.store.is_some())
            .finish()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.handlers.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("EventBus").field("handlers", &count).finish()
    }
}

/// Shared handle to one run's record
#[derive(Clone)]
pub struct RunTracker {
    run_id: Uuid,
    run: Arc<RwLock<PipelineRun>>,
    events: EventBus,
    store: Option<Arc<dyn RunStore>>,
}

impl RunTracker {
    pub fn new(run: PipelineRun, events: EventBus) -> Self {
        Self {
            run_id: run.id,
            run: Arc::new(RwLock::new(run)),
            events,
            store: None,
        }
    }

    /// Persist the record on start, after every stage, and at completion
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Tracker with no event handlers, for running stages outside the engine
    pub fn detached(pipeline_name: &str) -> Self {
        let run = PipelineRun::new(pipeline_name, "local", Default::default(), WorkspaceContext::new());
        Self::new(run, EventBus::new())
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn status(&self) -> ExecutionStatus {
        self.run.read().await.status
    }

    pub async fn snapshot(&self) -> RunSnapshot {
        self.run.read().await.snapshot()
    }

    /// Copy of the full record, for persistence
    pub async fn record(&self) -> PipelineRun {
        self.run.read().await.clone()
    }

    pub async fn workspace(&self) -> WorkspaceContext {
        self.run.read().await.workspace.clone()
    }

    pub async fn start(&self, mode: ExecutionMode, total_stages: usize) {
        let pipeline_name = {
            let mut run = self.run.write().await;
            run.mode = mode.to_string();
            run.total_stages = total_stages;
            run.start();
            run.pipeline_name.clone()
        };
        info!("Starting pipeline run: {} ({}, {} mode)", pipeline_name, self.run_id, mode);
        self.events.emit(ExecutionEvent::RunStarted {
            run_id: self.run_id,
            pipeline_name,
            mode,
            total_stages,
        });
        self.persist().await;
    }

    /// Create pending records for a stage's members that have none yet
    pub async fn register_steps(&self, stage: &Stage) {
        let mut run = self.run.write().await;
        for step in &stage.steps {
            if run.step_execution(&step.id).is_none() {
                run.step_executions
                    .push(StepExecution::for_step(step, Some(stage.index)));
            }
        }
    }

    pub async fn begin_stage(&self, stage: &Stage) {
        self.register_steps(stage).await;
        debug!("Starting {} with {} step(s)", stage.label(), stage.steps.len());
        self.events.emit(ExecutionEvent::StageStarted {
            run_id: self.run_id,
            stage_index: stage.index,
            kind: stage.kind,
            group: stage.group.clone(),
            step_count: stage.steps.len(),
        });
    }

    pub async fn end_stage(&self, stage: &Stage, success: bool) {
        self.run.write().await.completed_stages += 1;
        self.events.emit(ExecutionEvent::StageCompleted {
            run_id: self.run_id,
            stage_index: stage.index,
            success,
        });
        self.persist().await;
    }

    pub async fn step_started(&self, step_id: &str) {
        let moved = self
            .transition(step_id, ExecutionStatus::Running, |_| {})
            .await;
        if moved {
            self.events.emit(ExecutionEvent::StepStarted {
                run_id: self.run_id,
                step_id: step_id.to_string(),
            });
        }
    }

    /// Record a step's result; `tolerated` marks an allowed failure
    pub async fn step_finished(&self, step_id: &str, result: &StepResult, tolerated: bool) {
        let status = if result.success {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        };
        let moved = self
            .transition(step_id, status, |exec| {
                exec.output = result.output.clone();
                exec.error = result.error.clone();
            })
            .await;
        if !moved {
            return;
        }

        if result.success {
            self.events.emit(ExecutionEvent::StepSucceeded {
                run_id: self.run_id,
                step_id: step_id.to_string(),
                output: result.output.clone(),
            });
        } else {
            self.events.emit(ExecutionEvent::StepFailed {
                run_id: self.run_id,
                step_id: step_id.to_string(),
                error: result.error.clone().unwrap_or_default(),
                tolerated,
            });
        }
    }

    /// Mark a step cancelled, creating its record if its stage never began
    pub async fn step_cancelled(&self, step: &Step, stage_index: Option<usize>, reason: &str) {
        {
            let mut run = self.run.write().await;
            if run.step_execution(&step.id).is_none() {
                run.step_executions.push(StepExecution::for_step(step, stage_index));
            }
        }
        let moved = self
            .transition(&step.id, ExecutionStatus::Cancelled, |exec| {
                exec.error = Some(reason.to_string());
            })
            .await;
        if moved {
            debug!("Step {} cancelled: {}", step.id, reason);
            self.events.emit(ExecutionEvent::StepCancelled {
                run_id: self.run_id,
                step_id: step.id.clone(),
                reason: reason.to_string(),
            });
        }
    }

    pub async fn apply_delta(&self, delta: &ContextDelta) {
        self.run.write().await.workspace.apply(delta);
    }

    pub async fn record_failure(&self, failure: RunFailure) {
        self.run.write().await.record_failure(failure);
    }

    pub async fn remote_dispatched(&self, tool: &str, external_id: &str) {
        self.run.write().await.external_id = Some(external_id.to_string());
        info!("Run {} dispatched to {} as {}", self.run_id, tool, external_id);
        self.events.emit(ExecutionEvent::RemoteDispatched {
            run_id: self.run_id,
            tool: tool.to_string(),
            external_id: external_id.to_string(),
        });
    }

    /// Move the run to a terminal status; returns false if it already was
    pub async fn finish(&self, status: ExecutionStatus) -> bool {
        let (changed, name) = {
            let mut run = self.run.write().await;
            let changed = !run.status.is_terminal();
            run.finish(status);
            (changed, run.pipeline_name.clone())
        };
        if changed {
            info!("Pipeline run finished: {} - {}", name, status);
            self.events.emit(ExecutionEvent::RunCompleted {
                run_id: self.run_id,
                status,
            });
            self.persist().await;
        }
        changed
    }

    /// Save the current record; store failures never fail the run
    pub async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let run = self.record().await;
        if let Err(e) = store.save_run(&run).await {
            warn!("Failed to save run {}: {:#}", run.id, e);
            return;
        }
        if let Err(e) = store.save_step_executions(run.id, &run.step_executions).await {
            warn!("Failed to save step executions for run {}: {:#}", run.id, e);
        }
    }

    async fn transition<F>(&self, step_id: &str, next: ExecutionStatus, update: F) -> bool
    where
        F: FnOnce(&mut StepExecution),
    {
        let mut run = self.run.write().await;
        let Some(exec) = run.step_execution_mut(step_id) else {
            debug!("No execution record for step {}", step_id);
            return false;
        };
        match exec.transition(next) {
            Ok(()) => {
                update(exec);
                true
            }
            Err(err) => {
                debug!("Ignoring status change: {}", err);
                false
            }
        }
    }
}
