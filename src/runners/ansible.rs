//! Ansible playbook steps

use crate::core::{ExecutorError, Step, WorkspaceContext};
use crate::execution::executor::{StepExecutor, StepResult};
use crate::runners::{run_command, CommandSpec, ProcessRunner};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Runs `ansible-playbook` on `parameters.playbook`
///
/// Optional parameters: `inventory`, `extra_vars` (a map, passed as one
/// JSON `-e` argument), `limit`, `tags` (string or list) and `check`.
pub struct AnsibleExecutor {
    runner: Arc<dyn ProcessRunner>,
}

impl AnsibleExecutor {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }
}

fn playbook_command(step: &Step, context: &WorkspaceContext) -> Result<CommandSpec, ExecutorError> {
    let mut spec = CommandSpec::new("ansible-playbook");

    if let Some(inventory) = step.param_str("inventory") {
        spec = spec.arg("-i").arg(context.render(inventory));
    }
    match step.parameters.get("extra_vars") {
        Some(Value::Object(vars)) => {
            let rendered: serde_json::Map<String, Value> = vars
                .iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => Value::String(context.render(s)),
                        other => other.clone(),
                    };
                    (k.clone(), v)
                })
                .collect();
            spec = spec.arg("-e").arg(Value::Object(rendered).to_string());
        }
        Some(Value::String(s)) => spec = spec.arg("-e").arg(context.render(s)),
        Some(Value::Null) | None => {}
        Some(_) => {
            return Err(ExecutorError::InvalidParameters(format!(
                "step '{}': extra_vars must be a map or a string",
                step.id
            )))
        }
    }
    if let Some(limit) = step.param_str("limit") {
        spec = spec.arg("--limit").arg(context.render(limit));
    }
    let tags = step.param_list("tags");
    if !tags.is_empty() {
        spec = spec.arg("--tags").arg(tags.join(","));
    }
    if step.parameters.get("check").and_then(Value::as_bool) == Some(true) {
        spec = spec.arg("--check");
    }

    Ok(spec.arg(context.render(step.require_str("playbook")?)))
}

#[async_trait]
impl StepExecutor for AnsibleExecutor {
    async fn execute(
        &self,
        step: &Step,
        context: &WorkspaceContext,
    ) -> Result<StepResult, ExecutorError> {
        let spec = playbook_command(step, context)?;
        let (result, _) = run_command(self.runner.as_ref(), &spec).await?;
        Ok(result)
    }

    fn render_script(&self, step: &Step) -> Result<String, ExecutorError> {
        Ok(playbook_command(step, &WorkspaceContext::new())?.shell_line())
    }
}
