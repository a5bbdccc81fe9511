//! Step domain model

use crate::core::{config::StepConfig, error::ExecutorError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A single declared unit of work
///
/// Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique step identifier
    pub id: String,

    /// Human-readable step name
    pub name: String,

    /// Type tag used to look up the executor
    #[serde(rename = "type")]
    pub step_type: String,

    /// Position in the pipeline; lower runs first
    pub order: i64,

    /// Steps sharing a group tag run together as one parallel stage
    #[serde(default)]
    pub parallel_group: Option<String>,

    /// Timeout in seconds (0 = none)
    pub timeout_secs: u64,

    /// A failure of this step does not stop the run
    #[serde(default)]
    pub continue_on_failure: bool,

    /// Declared retry policy, interpreted by callers that resubmit
    #[serde(default)]
    pub max_retries: usize,

    /// Expected duration, used for shortest-job-first ordering
    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,

    /// Informational dependencies; only weigh scheduling, never order it
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Type-specific parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct StepDefaults {
    pub max_retries: usize,
    pub timeout_secs: u64,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            max_retries: 0,
            timeout_secs: 300, // 5 minutes
        }
    }
}

impl Step {
    /// Create a step from a step config
    pub fn from_config(config: &StepConfig, defaults: &StepDefaults) -> Self {
        Step {
            id: config.id.clone(),
            name: config.name.clone().unwrap_or_else(|| config.id.clone()),
            step_type: config.step_type.clone(),
            order: config.order,
            parallel_group: config
                .parallel_group
                .as_ref()
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty()),
            timeout_secs: config.timeout_secs.unwrap_or(defaults.timeout_secs),
            continue_on_failure: config.continue_on_failure,
            max_retries: config.max_retries.unwrap_or(defaults.max_retries),
            estimated_duration_secs: config.estimated_duration_secs,
            depends_on: config.depends_on.clone(),
            parameters: config.parameters.clone(),
        }
    }

    /// Minimal step, mostly for tests and programmatic pipelines
    pub fn new(id: &str, step_type: &str, order: i64) -> Self {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            step_type: step_type.to_string(),
            order,
            parallel_group: None,
            timeout_secs: StepDefaults::default().timeout_secs,
            continue_on_failure: false,
            max_retries: 0,
            estimated_duration_secs: None,
            depends_on: Vec::new(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn in_group(mut self, group: &str) -> Self {
        self.parallel_group = Some(group.to_string());
        self
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn continuing_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }

    pub fn is_grouped(&self) -> bool {
        self.parallel_group.is_some()
    }

    /// Get a string parameter
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    /// Get a required string parameter
    pub fn require_str(&self, key: &str) -> Result<&str, ExecutorError> {
        self.param_str(key).ok_or_else(|| {
            ExecutorError::InvalidParameters(format!(
                "step '{}' ({}) requires string parameter '{}'",
                self.id, self.step_type, key
            ))
        })
    }

    /// Get a list of strings; a single string is accepted as a one-item list
    pub fn param_list(&self, key: &str) -> Vec<String> {
        match self.parameters.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    /// Size of the serialized parameters, used by hybrid placement
    pub fn config_size_bytes(&self) -> usize {
        serde_json::to_vec(&self.parameters)
            .map(|bytes| bytes.len())
            .unwrap_or(0)
    }
}
