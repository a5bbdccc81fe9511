//! Execution state models

use crate::core::{context::WorkspaceContext, step::Step};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Status of a pipeline run or of a single step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Not started yet
    Pending,
    /// Currently running
    Running,
    /// Finished successfully
    Success,
    /// Finished with a failure
    Failed,
    /// Never ran to completion because something else decided the outcome
    Cancelled,
}

impl ExecutionStatus {
    /// Check if the status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            ExecutionStatus::Pending => 0,
            ExecutionStatus::Running => 1,
            ExecutionStatus::Success | ExecutionStatus::Failed | ExecutionStatus::Cancelled => 2,
        }
    }

    /// Status only moves forward: pending -> running -> terminal
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// How a whole pipeline run is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Local,
    Remote,
    Hybrid,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Local => "local",
            ExecutionMode::Remote => "remote",
            ExecutionMode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(ExecutionMode::Local),
            "remote" => Ok(ExecutionMode::Remote),
            "hybrid" => Ok(ExecutionMode::Hybrid),
            other => Err(format!("unsupported execution mode '{}'", other)),
        }
    }
}

/// Rejected status transition
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transition for step '{step_id}': {from} -> {to}")]
pub struct StateError {
    pub step_id: String,
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

/// One step's outcome within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub step_id: String,
    pub step_name: String,
    pub status: ExecutionStatus,
    pub output: String,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub order: i64,
    pub stage_index: Option<usize>,
    /// Declared retry policy, interpreted by callers that resubmit
    #[serde(default)]
    pub max_retries: usize,
}

impl StepExecution {
    pub fn new(step_id: &str, step_name: &str, order: i64, stage_index: Option<usize>) -> Self {
        Self {
            id: Uuid::new_v4(),
            step_id: step_id.to_string(),
            step_name: step_name.to_string(),
            status: ExecutionStatus::Pending,
            output: String::new(),
            error: None,
            started_at: None,
            completed_at: None,
            order,
            stage_index,
            max_retries: 0,
        }
    }

    /// Pending record for a planned step
    pub fn for_step(step: &Step, stage_index: Option<usize>) -> Self {
        let mut exec = Self::new(&step.id, &step.name, step.order, stage_index);
        exec.max_retries = step.max_retries;
        exec
    }

    /// Move to `next`, rejecting reverse or repeated transitions
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(next) {
            return Err(StateError {
                step_id: self.step_id.clone(),
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        if next == ExecutionStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }
}

/// Identity of the first failure that decided a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage_index: Option<usize>,
    pub step_id: Option<String>,
    pub error: String,
}

/// Who or what started a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerMetadata {
    /// User or system that triggered the run
    pub triggered_by: String,

    /// Trigger source (manual, webhook, schedule, ...)
    pub source: String,

    /// Mode to use instead of the pipeline's configured one
    pub mode_override: Option<String>,

    /// Extra workspace variables for this run only
    pub variables: std::collections::HashMap<String, String>,
}

impl TriggerMetadata {
    pub fn manual(triggered_by: impl Into<String>) -> Self {
        Self {
            triggered_by: triggered_by.into(),
            source: "manual".to_string(),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode_override = Some(mode.into());
        self
    }
}

/// One execution attempt of a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline_name: String,
    pub status: ExecutionStatus,
    /// Requested mode text; resolved by the engine
    pub mode: String,
    pub trigger: TriggerMetadata,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure: Option<RunFailure>,
    pub external_id: Option<String>,
    pub step_executions: Vec<StepExecution>,
    pub workspace: WorkspaceContext,
    pub total_stages: usize,
    pub completed_stages: usize,
}

impl PipelineRun {
    pub fn new(pipeline_name: &str, mode: &str, trigger: TriggerMetadata, workspace: WorkspaceContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_name: pipeline_name.to_string(),
            status: ExecutionStatus::Pending,
            mode: mode.to_string(),
            trigger,
            started_at: None,
            completed_at: None,
            failure: None,
            external_id: None,
            step_executions: Vec::new(),
            workspace,
            total_stages: 0,
            completed_stages: 0,
        }
    }

    /// Mark run as started
    pub fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Mark run as finished with a terminal status
    pub fn finish(&mut self, status: ExecutionStatus) {
        if self.status.is_terminal() {
            return;
        }
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    /// Record the first failure only; later failures are consequences
    pub fn record_failure(&mut self, failure: RunFailure) {
        if self.failure.is_none() {
            self.failure = Some(failure);
        }
    }

    pub fn step_execution(&self, step_id: &str) -> Option<&StepExecution> {
        self.step_executions.iter().find(|e| e.step_id == step_id)
    }

    pub fn step_execution_mut(&mut self, step_id: &str) -> Option<&mut StepExecution> {
        self.step_executions.iter_mut().find(|e| e.step_id == step_id)
    }

    /// Read-only view for pollers
    pub fn snapshot(&self) -> RunSnapshot {
        let retryable = self
            .step_executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Failed && e.max_retries > 0)
            .map(|e| e.step_id.clone())
            .collect();

        RunSnapshot {
            run_id: self.id,
            pipeline_name: self.pipeline_name.clone(),
            status: self.status,
            mode: self.mode.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            failure: self.failure.clone(),
            external_id: self.external_id.clone(),
            steps: self.step_executions.clone(),
            workspace: self.workspace.clone(),
            progress: self.progress(),
            retryable,
        }
    }

    /// Calculate progress (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.step_executions.is_empty() {
            return if self.status.is_terminal() { 1.0 } else { 0.0 };
        }
        let done = self
            .step_executions
            .iter()
            .filter(|e| e.status.is_terminal())
            .count();
        done as f64 / self.step_executions.len() as f64
    }
}

/// Read-only view of a run handed to pollers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub status: ExecutionStatus,
    pub mode: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure: Option<RunFailure>,
    pub external_id: Option<String>,
    pub steps: Vec<StepExecution>,
    pub workspace: WorkspaceContext,
    pub progress: f64,
    /// Failed steps that declare a retry policy, for callers that resubmit
    pub retryable: Vec<String>,
}

impl RunSnapshot {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn step(&self, step_id: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_status(&self, step_id: &str) -> Option<ExecutionStatus> {
        self.step(step_id).map(|s| s.status)
    }

    /// Cancelled steps with the reason recorded for each
    pub fn cancelled_steps(&self) -> Vec<(&str, &str)> {
        self.steps
            .iter()
            .filter(|s| s.status == ExecutionStatus::Cancelled)
            .map(|s| (s.step_id.as_str(), s.error.as_deref().unwrap_or("")))
            .collect()
    }

    pub fn retryable_steps(&self) -> &[String] {
        &self.retryable
    }
}
