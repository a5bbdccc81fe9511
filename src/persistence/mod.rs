//! Persistence layer for pipeline run history

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteRunStore;

use crate::core::{PipelineRun, StepExecution};
use anyhow::Result;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Trait for run stores
///
/// Runs are saved without their step records; those are written as a
/// separate batch so a store can keep them in their own table.
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or replace a run record
    async fn save_run(&self, run: &PipelineRun) -> Result<()>;

    /// Load a run, step records included
    async fn load_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>>;

    /// Most recent runs first, optionally for one pipeline; step records omitted
    async fn list_runs(&self, pipeline_name: Option<&str>, limit: usize) -> Result<Vec<PipelineRun>>;

    /// All pipeline names with at least one run
    async fn list_pipelines(&self) -> Result<Vec<String>>;

    /// Replace the step records of a run
    async fn save_step_executions(&self, run_id: Uuid, executions: &[StepExecution]) -> Result<()>;

    /// Step records of a run in pipeline order
    async fn load_step_executions(&self, run_id: Uuid) -> Result<Vec<StepExecution>>;
}

/// In-memory store (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<Uuid, PipelineRun>>,
    steps: RwLock<HashMap<Uuid, Vec<StepExecution>>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(runs: &mut [PipelineRun]) {
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
}

#[async_trait::async_trait]
impl RunStore for InMemoryRunStore {
    async fn save_run(&self, run: &PipelineRun) -> Result<()> {
        let mut record = run.clone();
        record.step_executions.clear();
        self.runs.write().await.insert(run.id, record);
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>> {
        let Some(mut run) = self.runs.read().await.get(&run_id).cloned() else {
            return Ok(None);
        };
        run.step_executions = self.load_step_executions(run_id).await?;
        Ok(Some(run))
    }

    async fn list_runs(&self, pipeline_name: Option<&str>, limit: usize) -> Result<Vec<PipelineRun>> {
        let runs = self.runs.read().await;
        let mut result: Vec<PipelineRun> = runs
            .values()
            .filter(|r| pipeline_name.map_or(true, |name| r.pipeline_name == name))
            .cloned()
            .collect();
        newest_first(&mut result);
        result.truncate(limit);
        Ok(result)
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let runs = self.runs.read().await;
        let mut names: Vec<String> = runs.values().map(|r| r.pipeline_name.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn save_step_executions(&self, run_id: Uuid, executions: &[StepExecution]) -> Result<()> {
        self.steps.write().await.insert(run_id, executions.to_vec());
        Ok(())
    }

    async fn load_step_executions(&self, run_id: Uuid) -> Result<Vec<StepExecution>> {
        let mut executions = self
            .steps
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default();
        executions.sort_by_key(|e| (e.order, e.stage_index));
        Ok(executions)
    }
}
