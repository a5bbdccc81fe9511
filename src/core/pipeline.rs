//! Pipeline domain model

use crate::core::{
    config::{ExecutionConfig, GroupConfig, PipelineConfig},
    context::WorkspaceContext,
    step::{Step, StepDefaults},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Rule for deciding a parallel stage's outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Succeeds iff no member fails; every member runs to completion
    #[default]
    WaitAll,
    /// Succeeds on the first member success; the rest are cancelled
    WaitAny,
    /// Fails on the first member failure; the rest are cancelled
    FailFast,
}

impl fmt::Display for SyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPolicy::WaitAll => "wait_all",
            SyncPolicy::WaitAny => "wait_any",
            SyncPolicy::FailFast => "fail_fast",
        };
        f.write_str(name)
    }
}

/// A pipeline definition
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    /// Initial workspace variables
    pub variables: HashMap<String, String>,

    /// Steps in declaration order
    pub steps: Vec<Step>,

    /// Settings per parallel group tag
    pub groups: HashMap<String, GroupConfig>,

    /// Execution settings
    pub execution: ExecutionConfig,
}

impl Pipeline {
    /// Create a pipeline from configuration
    pub fn from_config(config: &PipelineConfig) -> Self {
        let defaults = StepDefaults {
            max_retries: config.max_retries.unwrap_or(0),
            timeout_secs: config.default_timeout_secs.unwrap_or(300),
        };

        let steps = config
            .steps
            .iter()
            .map(|step_config| Step::from_config(step_config, &defaults))
            .collect();

        Pipeline {
            name: config.name.clone(),
            variables: config.variables_as_string_map(),
            steps,
            groups: config.parallel_groups.clone(),
            execution: config.execution.clone(),
        }
    }

    /// Programmatic pipeline with default settings
    pub fn new(name: &str, steps: Vec<Step>) -> Self {
        Pipeline {
            name: name.to_string(),
            variables: HashMap::new(),
            steps,
            groups: HashMap::new(),
            execution: ExecutionConfig::default(),
        }
    }

    pub fn with_group(mut self, tag: &str, sync_policy: SyncPolicy, timeout_secs: Option<u64>) -> Self {
        self.groups.insert(
            tag.to_string(),
            GroupConfig {
                sync_policy,
                timeout_secs,
            },
        );
        self
    }

    pub fn with_mode(mut self, mode: &str) -> Self {
        self.execution.mode = mode.to_string();
        self
    }

    /// Get a step by ID
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Workspace seeded with the pipeline variables
    pub fn initial_workspace(&self) -> WorkspaceContext {
        WorkspaceContext::from_variables(&self.variables)
    }
}
