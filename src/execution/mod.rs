//! Pipeline execution: planning, stage coordination and run tracking

pub mod coordinator;
pub mod engine;
pub mod executor;
pub mod optimizer;
pub mod placement;
pub mod planner;
pub mod tracker;
pub mod worker_pool;

pub use coordinator::{
    run_plan, ParallelExecutionCoordinator, PlanOutcome, StageExecutor, StageResult, StepOutcome,
};
pub use engine::{ExecutionEngine, RunHandle};
pub use executor::{ExecutorRegistry, StepExecutor, StepResult};
pub use optimizer::{OptimizerStats, PerformanceOptimizer};
pub use planner::{ExecutionPlan, ExecutionPlanner, Stage, StageKind};
pub use tracker::{EventBus, ExecutionEvent, RunTracker};
pub use worker_pool::{WorkQueue, WorkerPool};
