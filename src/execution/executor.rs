//! Step executor contract and the type-tag registry

use crate::core::{ContextDelta, ExecutorError, Step, WorkspaceContext};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Result of executing a step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    /// Workspace writes, merged by the coordinator after the stage resolves
    pub data_delta: ContextDelta,
}

impl StepResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            data_delta: ContextDelta::default(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            data_delta: ContextDelta::default(),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_delta(mut self, delta: ContextDelta) -> Self {
        self.data_delta = delta;
        self
    }
}

/// Runs one kind of step
///
/// Executors read the workspace by reference and never mutate shared
/// state; writes go into the returned delta. Timeouts are enforced by the
/// coordinator, not by the executor.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        step: &Step,
        context: &WorkspaceContext,
    ) -> Result<StepResult, ExecutorError>;

    /// Shell line equivalent of the step, used for remote code generation
    fn render_script(&self, step: &Step) -> Result<String, ExecutorError> {
        Err(ExecutorError::InvalidParameters(format!(
            "step type '{}' cannot be rendered for a remote tool",
            step.step_type
        )))
    }
}

/// Maps step type tags to executors
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor, replacing any previous one for the tag
    pub fn register(&mut self, step_type: &str, executor: Arc<dyn StepExecutor>) -> &mut Self {
        self.executors.insert(step_type.to_string(), executor);
        self
    }

    pub fn with(mut self, step_type: &str, executor: Arc<dyn StepExecutor>) -> Self {
        self.register(step_type, executor);
        self
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(step_type).cloned()
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.executors.contains_key(step_type)
    }

    /// Registered type tags, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }

    /// Type tags used by `steps` that have no executor
    pub fn missing_types<'a>(&self, steps: impl IntoIterator<Item = &'a Step>) -> Vec<String> {
        steps
            .into_iter()
            .filter(|s| !self.contains(&s.step_type))
            .map(|s| s.step_type.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Render a step for remote execution through its executor
    pub fn render_script(&self, step: &Step) -> Result<String, ExecutorError> {
        match self.get(&step.step_type) {
            Some(executor) => executor.render_script(step),
            None => Err(ExecutorError::InvalidParameters(format!(
                "no executor registered for step type '{}'",
                step.step_type
            ))),
        }
    }

    /// Registry with every executor wrapped by `wrap`
    pub fn wrapped<F>(&self, wrap: F) -> Self
    where
        F: Fn(Arc<dyn StepExecutor>) -> Arc<dyn StepExecutor>,
    {
        Self {
            executors: self
                .executors
                .iter()
                .map(|(tag, executor)| (tag.clone(), wrap(executor.clone())))
                .collect(),
        }
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("types", &self.types())
            .finish()
    }
}
