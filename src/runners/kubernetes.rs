//! Cluster deployment steps

use crate::core::{ExecutorError, Step, WorkspaceContext};
use crate::execution::executor::{StepExecutor, StepResult};
use crate::runners::{run_command, CommandSpec, ProcessRunner};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Drives kubectl
///
/// | action   | parameters                                  |
/// |----------|---------------------------------------------|
/// | `deploy` | `manifest` (file or directory, `apply -f`)  |
/// | `scale`  | `resource`, `replicas`                      |
/// | `delete` | `resource` or `manifest`                    |
/// | `wait`   | `resource`, `condition` (default `available`), `wait_timeout` |
///
/// Every action honours `namespace` and `context`.
pub struct KubernetesExecutor {
    runner: Arc<dyn ProcessRunner>,
}

impl KubernetesExecutor {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }
}

fn rendered(step: &Step, key: &str, context: &WorkspaceContext) -> Result<String, ExecutorError> {
    Ok(context.render(step.require_str(key)?))
}

fn kubectl_command(step: &Step, context: &WorkspaceContext) -> Result<CommandSpec, ExecutorError> {
    let mut spec = CommandSpec::new("kubectl");
    if let Some(kube_context) = step.param_str("context") {
        spec = spec.arg("--context").arg(context.render(kube_context));
    }
    if let Some(namespace) = step.param_str("namespace") {
        spec = spec.arg("-n").arg(context.render(namespace));
    }

    let spec = match step.param_str("action").unwrap_or("deploy") {
        "deploy" => spec
            .arg("apply")
            .arg("-f")
            .arg(rendered(step, "manifest", context)?),
        "scale" => {
            let replicas = match step.parameters.get("replicas") {
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::String(s)) => context.render(s),
                _ => {
                    return Err(ExecutorError::InvalidParameters(format!(
                        "step '{}': scale requires 'replicas'",
                        step.id
                    )))
                }
            };
            spec.arg("scale")
                .arg(rendered(step, "resource", context)?)
                .arg(format!("--replicas={}", replicas))
        }
        "delete" => match step.param_str("resource") {
            Some(resource) => spec.arg("delete").arg(context.render(resource)),
            None => spec
                .arg("delete")
                .arg("-f")
                .arg(rendered(step, "manifest", context)?),
        },
        "wait" => {
            let condition = step.param_str("condition").unwrap_or("available");
            let timeout = step
                .parameters
                .get("wait_timeout")
                .and_then(Value::as_u64)
                .unwrap_or(step.timeout_secs);
            let mut spec = spec
                .arg("wait")
                .arg(format!("--for=condition={}", condition))
                .arg(rendered(step, "resource", context)?);
            if timeout > 0 {
                spec = spec.arg(format!("--timeout={}s", timeout));
            }
            spec
        }
        other => {
            return Err(ExecutorError::InvalidParameters(format!(
                "step '{}': unknown kubernetes action '{}'",
                step.id, other
            )))
        }
    };
    Ok(spec)
}

#[async_trait]
impl StepExecutor for KubernetesExecutor {
    async fn execute(
        &self,
        step: &Step,
        context: &WorkspaceContext,
    ) -> Result<StepResult, ExecutorError> {
        let spec = kubectl_command(step, context)?;
        let (result, _) = run_command(self.runner.as_ref(), &spec).await?;
        Ok(result)
    }

    fn render_script(&self, step: &Step) -> Result<String, ExecutorError> {
        Ok(kubectl_command(step, &WorkspaceContext::new())?.shell_line())
    }
}
