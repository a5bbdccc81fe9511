//! Container image and container steps

use crate::core::{ContextDelta, ExecutorError, Step, WorkspaceContext};
use crate::execution::executor::{StepExecutor, StepResult};
use crate::runners::{run_command, CommandSpec, ProcessRunner};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Supported docker actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Build,
    Run,
    Push,
    Pull,
}

impl Action {
    fn parse(step: &Step) -> Result<Self, ExecutorError> {
        match step.param_str("action").unwrap_or("build") {
            "build" => Ok(Action::Build),
            "run" => Ok(Action::Run),
            "push" => Ok(Action::Push),
            "pull" => Ok(Action::Pull),
            other => Err(ExecutorError::InvalidParameters(format!(
                "step '{}': unknown docker action '{}'",
                step.id, other
            ))),
        }
    }
}

/// Drives the docker CLI
///
/// `action` is one of `build` (default), `run`, `push` or `pull`; every
/// action needs `image`. Builds take `context` (default `.`), `dockerfile`
/// and `build_args`, and record the image as `docker.image`. Runs take
/// `command`, `env` and `remove` (default true).
pub struct DockerExecutor {
    runner: Arc<dyn ProcessRunner>,
}

impl DockerExecutor {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }
}

fn string_map(step: &Step, key: &str, context: &WorkspaceContext) -> Vec<(String, String)> {
    match step.parameters.get(key) {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => context.render(s),
                    other => other.to_string(),
                };
                (k.clone(), v)
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn docker_command(step: &Step, context: &WorkspaceContext) -> Result<CommandSpec, ExecutorError> {
    let action = Action::parse(step)?;
    let image = context.render(step.require_str("image")?);
    let spec = CommandSpec::new("docker");

    let spec = match action {
        Action::Build => {
            let mut spec = spec.arg("build").arg("-t").arg(image);
            if let Some(dockerfile) = step.param_str("dockerfile") {
                spec = spec.arg("-f").arg(context.render(dockerfile));
            }
            for (key, value) in string_map(step, "build_args", context) {
                spec = spec.arg("--build-arg").arg(format!("{}={}", key, value));
            }
            spec.arg(context.render(step.param_str("context").unwrap_or(".")))
        }
        Action::Run => {
            let mut spec = spec.arg("run");
            if step.parameters.get("remove").and_then(Value::as_bool) != Some(false) {
                spec = spec.arg("--rm");
            }
            for (key, value) in string_map(step, "env", context) {
                spec = spec.arg("-e").arg(format!("{}={}", key, value));
            }
            spec = spec.arg(image);
            if let Some(command) = step.param_str("command") {
                spec = spec.arg("sh").arg("-c").arg(context.render(command));
            }
            spec
        }
        Action::Push => spec.arg("push").arg(image),
        Action::Pull => spec.arg("pull").arg(image),
    };
    Ok(spec)
}

#[async_trait]
impl StepExecutor for DockerExecutor {
    async fn execute(
        &self,
        step: &Step,
        context: &WorkspaceContext,
    ) -> Result<StepResult, ExecutorError> {
        let spec = docker_command(step, context)?;
        let (result, _) = run_command(self.runner.as_ref(), &spec).await?;
        if !result.success || Action::parse(step)? != Action::Build {
            return Ok(result);
        }
        let image = context.render(step.require_str("image")?);
        Ok(result.with_delta(ContextDelta::new().with("docker.image", image)))
    }

    fn render_script(&self, step: &Step) -> Result<String, ExecutorError> {
        Ok(docker_command(step, &WorkspaceContext::new())?.shell_line())
    }
}
