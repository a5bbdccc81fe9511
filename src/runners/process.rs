//! Subprocess runner shared by the built-in executors

use crate::core::ExecutorError;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, warn};

/// A program invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Equivalent POSIX shell line
    pub fn shell_line(&self) -> String {
        let mut parts: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, shell_quote(v)))
            .collect();
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        let line = parts.join(" ");
        match &self.current_dir {
            Some(dir) => format!("cd {} && {}", shell_quote(&dir.to_string_lossy()), line),
            None => line,
        }
    }
}

/// Quote `text` for a POSIX shell when it contains anything unsafe
pub fn shell_quote(text: &str) -> String {
    let safe = !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if safe {
        text.to_string()
    } else {
        format!("'{}'", text.replace('\'', "'\\''"))
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code; -1 when the process was killed by a signal
    pub code: i32,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Error describing a non-zero exit, if any
    pub fn exit_error(&self, program: &str) -> Option<ExecutorError> {
        if self.success() {
            return None;
        }
        Some(ExecutorError::NonZeroExit {
            program: program.to_string(),
            code: self.code,
            stderr: self.stderr.trim().to_string(),
        })
    }
}

/// Runs processes for executors
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, ExecutorError>;
}

/// Spawns real processes with tokio
///
/// Children are spawned with `kill_on_drop`, so aborting the step's task
/// kills the direct child process.
#[derive(Debug, Clone, Default)]
pub struct SystemProcessRunner;

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, ExecutorError> {
        debug!("Spawning {} with {} argument(s)", spec.program, spec.args.len());

        let mut command = Command::new(&spec.program);
        command.args(&spec.args).kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let output = command.output().await.map_err(|source| ExecutorError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let stdout = String::from_utf8(output.stdout)
            .map_err(|e| ExecutorError::Output(format!("{} stdout: {}", spec.program, e)))?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let code = output.status.code().unwrap_or(-1);

        if code != 0 {
            warn!("{} exited with code {}: {}", spec.program, code, stderr.trim());
        }
        debug!("{} returned {} bytes of output", spec.program, stdout.len());

        Ok(ProcessOutput {
            stdout,
            stderr,
            code,
        })
    }
}
