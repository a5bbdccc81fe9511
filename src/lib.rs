//! pipeline-orchestrator - Stage-based CI/CD pipeline execution
//!
//! Pipelines run locally through step executors, remotely as generated
//! Jenkins/GitLab/GitHub definitions, or split across both.

pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;
pub mod remote;
pub mod runners;

// Re-export commonly used types
pub use core::{
    ExecutionMode, ExecutionStatus, OrchestratorError, Pipeline, PipelineRun, RunSnapshot, Step,
    SyncPolicy, TriggerMetadata, WorkspaceContext,
};
pub use execution::{
    ExecutionEngine, ExecutionEvent, ExecutionPlan, ExecutionPlanner, ExecutorRegistry,
    PerformanceOptimizer, RunHandle, StepExecutor, StepResult,
};
pub use remote::{BuildTrigger, CodeGenerator, RemoteBuildStatus, RemoteRegistry, ToolType};
