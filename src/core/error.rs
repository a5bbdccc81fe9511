//! Error taxonomy for the orchestrator

use thiserror::Error;
use uuid::Uuid;

/// Errors raised while planning, running or dispatching a pipeline
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    /// Malformed step list or unsupported mode; the run never starts
    #[error("planning error: {0}")]
    Planning(String),

    /// An executor reported a failure for a step
    #[error("step '{step_id}' failed: {message}")]
    StepExecution { step_id: String, message: String },

    /// A step or stage exceeded its timeout
    #[error("{scope} timed out after {seconds}s")]
    Timeout { scope: String, seconds: u64 },

    /// A step was cancelled because of a sibling or upstream outcome
    #[error("cancelled: {0}")]
    Cancellation(String),

    /// The external CI tool could not be reached or rejected the build
    #[error("remote dispatch to {tool} failed: {message}")]
    RemoteDispatch { tool: String, message: String },

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl OrchestratorError {
    pub fn planning(message: impl Into<String>) -> Self {
        Self::Planning(message.into())
    }

    pub fn remote(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteDispatch {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Cancellations are bookkeeping, not root causes
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancellation(_))
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        Self::Persistence(format!("{:#}", err))
    }
}

/// Errors returned by step executors
///
/// The coordinator converts these into failed step results; they never
/// abort a run on their own.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with code {code}: {stderr}")]
    NonZeroExit {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("failed to decode output: {0}")]
    Output(String),
}
