//! Pipeline configuration from YAML

use crate::core::{pipeline::SyncPolicy, Pipeline};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tracing::warn;

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    /// Pipeline version (optional)
    #[serde(default)]
    pub version: Option<String>,

    /// Initial workspace variables
    #[serde(default)]
    pub variables: HashMap<String, Value>,

    /// Execution settings (mode, workers, optimizer, remote, hybrid)
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Synchronization settings per parallel group tag
    #[serde(default)]
    pub parallel_groups: HashMap<String, GroupConfig>,

    /// Pipeline steps in declaration order
    #[serde(default)]
    pub steps: Vec<StepConfig>,

    /// Maximum number of retries per step (global default)
    #[serde(default)]
    pub max_retries: Option<usize>,

    /// Default timeout for steps (in seconds)
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,
}

/// Step configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Unique step identifier
    pub id: String,

    /// Human-readable step name (defaults to the id)
    #[serde(default)]
    pub name: Option<String>,

    /// Executor type tag
    #[serde(rename = "type")]
    pub step_type: String,

    /// Position in the pipeline
    pub order: i64,

    /// Parallel group tag
    #[serde(default)]
    pub parallel_group: Option<String>,

    /// Timeout for this step (overrides global)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub continue_on_failure: bool,

    /// Maximum retries for this step (overrides global)
    #[serde(default)]
    pub max_retries: Option<usize>,

    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Type-specific parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, JsonValue>,
}

/// Parallel group settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub sync_policy: SyncPolicy,

    /// Stage-level timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// How the pipeline is executed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// `local`, `remote` or `hybrid`; resolved when the run starts
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Worker pool size when the optimizer is disabled
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default)]
    pub optimizer: OptimizerConfig,

    #[serde(default)]
    pub remote: Option<RemoteConfig>,

    #[serde(default)]
    pub hybrid: HybridConfig,
}

fn default_mode() -> String {
    "local".to_string()
}

fn default_max_workers() -> usize {
    4
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            max_workers: default_max_workers(),
            optimizer: OptimizerConfig::default(),
            remote: None,
            hybrid: HybridConfig::default(),
        }
    }
}

/// Performance optimizer settings
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub enabled: bool,
    /// Parallel groups larger than this run in sequential sub-batches
    pub batch_size: usize,
    pub cache_enabled: bool,
    pub cache_capacity: usize,
    /// Resident memory above this triggers a cleanup pass
    pub memory_threshold_mb: u64,
    pub default_estimate_secs: u64,
    pub dependency_weight_secs: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_size: 8,
            cache_enabled: true,
            cache_capacity: 256,
            memory_threshold_mb: 2048,
            default_estimate_secs: 60,
            dependency_weight_secs: 5,
        }
    }
}

/// Remote CI tool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// `jenkins`, `gitlab` or `github`; resolved when the run starts
    pub tool: String,

    /// Base URL of the tool
    pub endpoint: String,

    /// Jenkins job, GitLab project path/id, or GitHub owner/repo
    pub project: String,

    /// GitHub workflow file
    #[serde(default)]
    pub workflow: Option<String>,

    /// Git ref to build
    #[serde(default = "default_ref", rename = "ref")]
    pub git_ref: String,

    /// Environment variable holding the API token
    #[serde(default)]
    pub token_env: Option<String>,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Give up waiting on the remote build after this long
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,
}

fn default_ref() -> String {
    "main".to_string()
}

fn default_poll_interval() -> u64 {
    10
}

fn default_remote_timeout() -> u64 {
    3600
}

impl RemoteConfig {
    /// Read the API token from the configured environment variable
    pub fn token(&self) -> Option<String> {
        self.token_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|token| !token.is_empty())
    }
}

/// Hybrid placement heuristic settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    /// Step types allowed to run locally
    pub local_step_types: Vec<String>,
    /// Steps with larger serialized parameters go remote
    pub max_local_config_bytes: usize,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            local_step_types: vec![
                "shell".to_string(),
                "checkout".to_string(),
                "ansible".to_string(),
            ],
            max_local_config_bytes: 4096,
        }
    }
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the pipeline configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Pipeline name must not be empty");
        }

        let mut seen_ids = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                anyhow::bail!("Step with empty id");
            }
            if !seen_ids.insert(&step.id) {
                anyhow::bail!("Duplicate step ID: {}", step.id);
            }
            if step.step_type.trim().is_empty() {
                anyhow::bail!("Step '{}' has an empty type", step.id);
            }
        }

        if self.execution.max_workers == 0 {
            anyhow::bail!("execution.max_workers must be at least 1");
        }
        if self.execution.optimizer.batch_size == 0 {
            anyhow::bail!("execution.optimizer.batch_size must be at least 1");
        }

        let used_groups: HashSet<&str> = self
            .steps
            .iter()
            .filter_map(|s| s.parallel_group.as_deref())
            .collect();
        for group in self.parallel_groups.keys() {
            if !used_groups.contains(group.as_str()) {
                warn!("Parallel group '{}' is configured but no step uses it", group);
            }
        }

        Ok(())
    }

    /// Get variables as a string map; non-string values are rendered as YAML
    pub fn variables_as_string_map(&self) -> HashMap<String, String> {
        self.variables
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    Value::Bool(b) => b.to_string(),
                    Value::Number(n) => n.to_string(),
                    other => serde_yaml::to_string(other)
                        .unwrap_or_default()
                        .trim_end()
                        .to_string(),
                };
                (key.clone(), rendered)
            })
            .collect()
    }

    /// Convert config to a Pipeline domain model
    pub fn to_pipeline(&self) -> Pipeline {
        Pipeline::from_config(self)
    }
}
