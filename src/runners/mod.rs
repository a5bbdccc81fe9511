//! Built-in step executors
//!
//! Every executor builds a [`CommandSpec`] from the step parameters and
//! runs it through a shared [`ProcessRunner`]. The same spec renders the
//! shell line used by the remote code generators.

pub mod ansible;
pub mod checkout;
pub mod docker;
pub mod kubernetes;
pub mod process;
pub mod shell;

pub use ansible::AnsibleExecutor;
pub use checkout::CheckoutExecutor;
pub use docker::DockerExecutor;
pub use kubernetes::KubernetesExecutor;
pub use process::{CommandSpec, ProcessOutput, ProcessRunner, SystemProcessRunner};
pub use shell::ShellExecutor;

use crate::core::ExecutorError;
use crate::execution::executor::{ExecutorRegistry, StepResult};
use std::sync::Arc;

/// Registry with every built-in executor on real processes
pub fn default_registry() -> ExecutorRegistry {
    registry_with_runner(Arc::new(SystemProcessRunner))
}

/// Registry with every built-in executor on `runner`
pub fn registry_with_runner(runner: Arc<dyn ProcessRunner>) -> ExecutorRegistry {
    ExecutorRegistry::new()
        .with("shell", Arc::new(ShellExecutor::new(runner.clone())))
        .with("checkout", Arc::new(CheckoutExecutor::new(runner.clone())))
        .with("ansible", Arc::new(AnsibleExecutor::new(runner.clone())))
        .with("docker", Arc::new(DockerExecutor::new(runner.clone())))
        .with("kubernetes", Arc::new(KubernetesExecutor::new(runner)))
}

/// Run `spec`; a non-zero exit is a failed result carrying stdout
pub(crate) async fn run_command(
    runner: &dyn ProcessRunner,
    spec: &CommandSpec,
) -> Result<(StepResult, ProcessOutput), ExecutorError> {
    let output = runner.run(spec).await?;
    let result = match output.exit_error(&spec.program) {
        Some(err) => StepResult::failure(err.to_string()).with_output(output.stdout.clone()),
        None => StepResult::success(output.stdout.clone()),
    };
    Ok((result, output))
}
