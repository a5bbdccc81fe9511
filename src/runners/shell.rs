//! Raw command steps

use crate::core::{ContextDelta, ExecutorError, Step, WorkspaceContext};
use crate::execution::executor::{StepExecutor, StepResult};
use crate::runners::{run_command, CommandSpec, ProcessRunner};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;

/// Stdout lines of this form write to the workspace
const SET_PATTERN: &str = r"^::set\s+([A-Za-z0-9_.\-]+)=(.*)$";

/// Runs `parameters.command` through a shell
///
/// `{{ key }}` placeholders are filled from the workspace. Optional
/// parameters: `shell` (default `sh`), `working_dir`, and `env` (a map).
pub struct ShellExecutor {
    runner: Arc<dyn ProcessRunner>,
}

impl ShellExecutor {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    fn spec(&self, step: &Step, context: &WorkspaceContext) -> Result<CommandSpec, ExecutorError> {
        let command = context.render(step.require_str("command")?);
        let shell = step.param_str("shell").unwrap_or("sh");
        let mut spec = CommandSpec::new(shell).args(["-c".to_string(), command]);

        if let Some(dir) = step.param_str("working_dir") {
            spec = spec.current_dir(context.render(dir));
        }
        if let Some(Value::Object(env)) = step.parameters.get("env") {
            for (key, value) in env {
                let value = match value {
                    Value::String(s) => context.render(s),
                    other => other.to_string(),
                };
                spec = spec.env(key.clone(), value);
            }
        }
        Ok(spec)
    }
}

/// Collect `::set key=value` lines from command output
pub fn parse_set_lines(stdout: &str) -> Result<ContextDelta, ExecutorError> {
    let pattern = Regex::new(SET_PATTERN)
        .map_err(|e| ExecutorError::Output(format!("invalid set pattern: {}", e)))?;
    let mut delta = ContextDelta::new();
    for line in stdout.lines() {
        if let Some(caps) = pattern.captures(line.trim_end()) {
            delta.insert(&caps[1], caps[2].trim());
        }
    }
    Ok(delta)
}

#[async_trait]
impl StepExecutor for ShellExecutor {
    async fn execute(
        &self,
        step: &Step,
        context: &WorkspaceContext,
    ) -> Result<StepResult, ExecutorError> {
        let spec = self.spec(step, context)?;
        let (result, output) = run_command(self.runner.as_ref(), &spec).await?;
        if !result.success {
            return Ok(result);
        }
        Ok(result.with_delta(parse_set_lines(&output.stdout)?))
    }

    fn render_script(&self, step: &Step) -> Result<String, ExecutorError> {
        let command = step.require_str("command")?;
        Ok(match step.param_str("working_dir") {
            Some(dir) => format!("cd {} && {}", crate::runners::process::shell_quote(dir), command),
            None => command.to_string(),
        })
    }
}
