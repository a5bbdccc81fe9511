//! Remote dispatch - per-tool code generation and build triggering
//!
//! Each CI tool provides a [`CodeGenerator`] that turns an execution plan
//! into the tool's native definition, and a [`BuildTrigger`] that submits
//! the definition and reports on the resulting build. Both are looked up by
//! [`ToolType`] in a [`RemoteRegistry`].

pub mod github;
pub mod gitlab;
pub mod http;
pub mod jenkins;

pub use github::{GitHubGenerator, GitHubTrigger};
pub use gitlab::{GitLabGenerator, GitLabTrigger};
pub use jenkins::{JenkinsGenerator, JenkinsTrigger};

use crate::core::{config::RemoteConfig, ExecutionStatus, OrchestratorError, WorkspaceContext};
use crate::execution::{executor::ExecutorRegistry, planner::ExecutionPlan};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Supported external CI tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    Jenkins,
    GitLab,
    GitHub,
}

impl ToolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolType::Jenkins => "jenkins",
            ToolType::GitLab => "gitlab",
            ToolType::GitHub => "github",
        }
    }

    /// Parse a configured tool name into a dispatch error when unsupported
    pub fn resolve(name: &str) -> Result<Self, OrchestratorError> {
        name.parse()
            .map_err(|message: String| OrchestratorError::remote(name, message))
    }
}

impl fmt::Display for ToolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jenkins" => Ok(ToolType::Jenkins),
            "gitlab" | "gitlab-ci" => Ok(ToolType::GitLab),
            "github" | "github-actions" => Ok(ToolType::GitHub),
            other => Err(format!("unsupported remote tool '{}'", other)),
        }
    }
}

/// State of a build on the external tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteBuildStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RemoteBuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RemoteBuildStatus::Success | RemoteBuildStatus::Failed | RemoteBuildStatus::Cancelled
        )
    }

    /// Run status this build status resolves to
    pub fn as_execution_status(&self) -> ExecutionStatus {
        match self {
            RemoteBuildStatus::Pending => ExecutionStatus::Pending,
            RemoteBuildStatus::Running => ExecutionStatus::Running,
            RemoteBuildStatus::Success => ExecutionStatus::Success,
            RemoteBuildStatus::Failed => ExecutionStatus::Failed,
            RemoteBuildStatus::Cancelled => ExecutionStatus::Cancelled,
        }
    }
}

/// A generated tool-native pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineDefinition {
    pub tool: ToolType,
    /// Conventional path of the definition in a repository
    pub file_name: String,
    pub content: String,
}

/// Shell line per step id, rendered by the step executors
#[derive(Debug, Clone, Default)]
pub struct StepScripts {
    lines: HashMap<String, String>,
}

impl StepScripts {
    /// Render every step of `plan` through its executor
    pub fn render(plan: &ExecutionPlan, registry: &ExecutorRegistry, tool: ToolType) -> Result<Self, OrchestratorError> {
        let mut lines = HashMap::new();
        for (_, step) in plan.steps() {
            let line = registry
                .render_script(step)
                .map_err(|e| OrchestratorError::remote(tool.as_str(), e.to_string()))?;
            lines.insert(step.id.clone(), line);
        }
        Ok(Self { lines })
    }

    pub fn insert(&mut self, step_id: &str, line: impl Into<String>) {
        self.lines.insert(step_id.to_string(), line.into());
    }

    pub fn get(&self, step_id: &str) -> &str {
        self.lines.get(step_id).map(String::as_str).unwrap_or("true")
    }
}

/// Translates an execution plan into a tool-native definition
pub trait CodeGenerator: Send + Sync {
    fn tool(&self) -> ToolType;

    fn generate(
        &self,
        pipeline_name: &str,
        plan: &ExecutionPlan,
        scripts: &StepScripts,
    ) -> Result<PipelineDefinition, OrchestratorError>;
}

/// Submits definitions to a tool and reports on the builds
#[async_trait]
pub trait BuildTrigger: Send + Sync {
    /// Start a build; returns the tool's identifier for it
    async fn trigger(
        &self,
        definition: &PipelineDefinition,
        variables: &WorkspaceContext,
    ) -> Result<String, OrchestratorError>;

    async fn status(&self, external_id: &str) -> Result<RemoteBuildStatus, OrchestratorError>;
}

/// Generators and triggers keyed by tool type
#[derive(Clone, Default)]
pub struct RemoteRegistry {
    generators: HashMap<ToolType, Arc<dyn CodeGenerator>>,
    triggers: HashMap<ToolType, Arc<dyn BuildTrigger>>,
}

impl RemoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in generators and no triggers
    pub fn with_generators() -> Self {
        let mut registry = Self::new();
        registry.register_generator(Arc::new(JenkinsGenerator));
        registry.register_generator(Arc::new(GitLabGenerator));
        registry.register_generator(Arc::new(GitHubGenerator::default()));
        registry
    }

    /// Built-in generators plus the HTTP trigger for the configured tool
    pub fn from_config(config: &RemoteConfig) -> Result<Self, OrchestratorError> {
        let tool = ToolType::resolve(&config.tool)?;
        let mut registry = Self::with_generators();
        let trigger: Arc<dyn BuildTrigger> = match tool {
            ToolType::Jenkins => Arc::new(JenkinsTrigger::new(config)?),
            ToolType::GitLab => Arc::new(GitLabTrigger::new(config)?),
            ToolType::GitHub => {
                if let Some(workflow) = &config.workflow {
                    registry.register_generator(Arc::new(GitHubGenerator::new(workflow)));
                }
                Arc::new(GitHubTrigger::new(config)?)
            }
        };
        registry.register_trigger(tool, trigger);
        Ok(registry)
    }

    pub fn register_generator(&mut self, generator: Arc<dyn CodeGenerator>) -> &mut Self {
        self.generators.insert(generator.tool(), generator);
        self
    }

    pub fn register_trigger(&mut self, tool: ToolType, trigger: Arc<dyn BuildTrigger>) -> &mut Self {
        self.triggers.insert(tool, trigger);
        self
    }

    pub fn generator(&self, tool: ToolType) -> Result<Arc<dyn CodeGenerator>, OrchestratorError> {
        self.generators
            .get(&tool)
            .cloned()
            .ok_or_else(|| OrchestratorError::remote(tool.as_str(), "no code generator registered"))
    }

    pub fn trigger(&self, tool: ToolType) -> Result<Arc<dyn BuildTrigger>, OrchestratorError> {
        self.triggers
            .get(&tool)
            .cloned()
            .ok_or_else(|| OrchestratorError::remote(tool.as_str(), "no build trigger registered"))
    }

    pub fn has_trigger(&self, tool: ToolType) -> bool {
        self.triggers.contains_key(&tool)
    }
}

impl fmt::Debug for RemoteRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut generators: Vec<_> = self.generators.keys().map(|t| t.as_str()).collect();
        generators.sort();
        let mut triggers: Vec<_> = self.triggers.keys().map(|t| t.as_str()).collect();
        triggers.sort();
        f.debug_struct("RemoteRegistry")
            .field("generators", &generators)
            .field("triggers", &triggers)
            .finish()
    }
}

/// Identifier safe for job and stage names in every supported tool
pub fn job_name(raw: &str) -> String {
    let mut name = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            name.push(c.to_ascii_lowercase());
        } else if !name.ends_with('-') {
            name.push('-');
        }
    }
    let name = name.trim_matches('-').to_string();
    if name.is_empty() {
        "job".to_string()
    } else {
        name
    }
}

/// First of `base`, `base-2`, `base-3`, ... not yet in `taken`; the result is recorded
pub fn unique_name(base: &str, taken: &mut HashSet<String>) -> String {
    let mut name = base.to_string();
    let mut n = 1;
    while taken.contains(&name) {
        n += 1;
        name = format!("{}-{}", base, n);
    }
    taken.insert(name.clone());
    name
}
