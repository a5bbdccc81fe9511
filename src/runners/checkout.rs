//! Source checkout steps

use crate::core::{ContextDelta, ExecutorError, Step, WorkspaceContext};
use crate::execution::executor::{StepExecutor, StepResult};
use crate::runners::{run_command, CommandSpec, ProcessRunner};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Clones `parameters.repository` with git
///
/// `ref` selects a branch or tag, `depth` makes a shallow clone and `path`
/// overrides the destination (default: the step id). The destination is
/// recorded as `checkout.<id>.path`.
pub struct CheckoutExecutor {
    runner: Arc<dyn ProcessRunner>,
}

impl CheckoutExecutor {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }
}

fn destination(step: &Step, context: &WorkspaceContext) -> String {
    context.render(step.param_str("path").unwrap_or(&step.id))
}

fn clone_command(step: &Step, context: &WorkspaceContext) -> Result<CommandSpec, ExecutorError> {
    let repository = context.render(step.require_str("repository")?);
    let mut spec = CommandSpec::new("git").arg("clone");

    match step.parameters.get("depth") {
        Some(Value::Number(n)) => spec = spec.arg("--depth").arg(n.to_string()),
        Some(Value::String(s)) => spec = spec.arg("--depth").arg(s.clone()),
        _ => {}
    }
    if let Some(git_ref) = step.param_str("ref") {
        spec = spec.arg("--branch").arg(context.render(git_ref));
    }
    Ok(spec.arg(repository).arg(destination(step, context)))
}

#[async_trait]
impl StepExecutor for CheckoutExecutor {
    async fn execute(
        &self,
        step: &Step,
        context: &WorkspaceContext,
    ) -> Result<StepResult, ExecutorError> {
        let spec = clone_command(step, context)?;
        let (result, _) = run_command(self.runner.as_ref(), &spec).await?;
        if !result.success {
            return Ok(result);
        }
        let delta = ContextDelta::new().with(
            format!("checkout.{}.path", step.id),
            destination(step, context),
        );
        Ok(result.with_delta(delta))
    }

    fn render_script(&self, step: &Step) -> Result<String, ExecutorError> {
        Ok(clone_command(step, &WorkspaceContext::new())?.shell_line())
    }
}
