//! GitLab CI YAML generation and pipeline triggering

use crate::core::{config::RemoteConfig, OrchestratorError, Step, WorkspaceContext};
use crate::execution::planner::{ExecutionPlan, Stage};
use crate::remote::{
    http::{encode_segment, RemoteClient},
    job_name, unique_name, BuildTrigger, CodeGenerator, PipelineDefinition, RemoteBuildStatus, StepScripts,
    ToolType,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use serde_yaml::{Mapping, Value as Yaml};
use std::collections::HashSet;
use tracing::debug;

/// Emits a `.gitlab-ci.yml` with one CI stage per plan stage
///
/// Jobs of a parallel group share their CI stage. GitLab joins a stage only
/// when all of its jobs finish, so every group behaves as `wait_all` there;
/// a group timeout caps each member job's timeout.
pub struct GitLabGenerator;

/// Top-level keywords a job name must never shadow
const RESERVED_KEYS: &[&str] = &[
    "stages",
    "variables",
    "default",
    "include",
    "workflow",
    "image",
    "services",
    "cache",
    "before_script",
    "after_script",
    "pages",
];

fn yaml(text: impl Into<String>) -> Yaml {
    Yaml::String(text.into())
}

fn stage_name(stage: &Stage) -> String {
    let label = match &stage.group {
        Some(group) => group.clone(),
        None => stage
            .steps
            .first()
            .map(|s| s.id.clone())
            .unwrap_or_default(),
    };
    format!("stage-{}-{}", stage.index, job_name(&label))
}

fn job_timeout(step: &Step, stage: &Stage) -> Option<u64> {
    let step_timeout = Some(step.timeout_secs).filter(|t| *t > 0);
    match (step_timeout, stage.timeout_secs) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl CodeGenerator for GitLabGenerator {
    fn tool(&self) -> ToolType {
        ToolType::GitLab
    }

    fn generate(
        &self,
        pipeline_name: &str,
        plan: &ExecutionPlan,
        scripts: &StepScripts,
    ) -> Result<PipelineDefinition, OrchestratorError> {
        let mut root = Mapping::new();
        let stages: Vec<Yaml> = plan.stages.iter().map(|s| yaml(stage_name(s))).collect();
        root.insert(yaml("stages"), Yaml::Sequence(stages));

        let mut variables = Mapping::new();
        variables.insert(yaml("ORCHESTRATOR_PIPELINE"), yaml(pipeline_name));
        root.insert(yaml("variables"), Yaml::Mapping(variables));

        let mut used: HashSet<String> = RESERVED_KEYS.iter().map(|k| k.to_string()).collect();
        for stage in &plan.stages {
            let ci_stage = stage_name(stage);
            for step in &stage.steps {
                let name = unique_name(&job_name(&step.id), &mut used);

                let mut job = Mapping::new();
                job.insert(yaml("stage"), yaml(ci_stage.clone()));
                job.insert(
                    yaml("script"),
                    Yaml::Sequence(vec![yaml(scripts.get(&step.id))]),
                );
                if let Some(seconds) = job_timeout(step, stage) {
                    job.insert(yaml("timeout"), yaml(format!("{} seconds", seconds)));
                }
                if step.continue_on_failure {
                    job.insert(yaml("allow_failure"), Yaml::Bool(true));
                }
                root.insert(yaml(name), Yaml::Mapping(job));
            }
        }

        let content = serde_yaml::to_string(&Yaml::Mapping(root))
            .map_err(|e| OrchestratorError::remote("gitlab", format!("failed to render YAML: {}", e)))?;

        Ok(PipelineDefinition {
            tool: ToolType::GitLab,
            file_name: ".gitlab-ci.yml".to_string(),
            content,
        })
    }
}

/// Creates pipelines through the GitLab API
///
/// The definition travels in the `ORCHESTRATOR_PIPELINE_YAML` variable for
/// the project's CI config to run as a dynamic child pipeline. The
/// returned id is the GitLab pipeline id.
pub struct GitLabTrigger {
    remote: RemoteClient,
    project: String,
    git_ref: String,
}

impl GitLabTrigger {
    pub fn new(config: &RemoteConfig) -> Result<Self, OrchestratorError> {
        Ok(Self {
            remote: RemoteClient::new(ToolType::GitLab, config)?,
            project: encode_segment(&config.project),
            git_ref: config.git_ref.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = self
            .remote
            .url(&format!("api/v4/projects/{}/{}", self.project, path));
        let request = self.remote.client.request(method, url);
        match &self.remote.token {
            Some(token) => request.header("PRIVATE-TOKEN", token),
            None => request,
        }
    }
}

/// Map a GitLab pipeline status string
pub fn pipeline_status(status: &str) -> RemoteBuildStatus {
    match status {
        "running" => RemoteBuildStatus::Running,
        "success" => RemoteBuildStatus::Success,
        "failed" => RemoteBuildStatus::Failed,
        "canceled" | "canceling" | "skipped" => RemoteBuildStatus::Cancelled,
        _ => RemoteBuildStatus::Pending,
    }
}

#[async_trait]
impl BuildTrigger for GitLabTrigger {
    async fn trigger(
        &self,
        definition: &PipelineDefinition,
        variables: &WorkspaceContext,
    ) -> Result<String, OrchestratorError> {
        let mut vars: Vec<Value> = variables
            .iter()
            .map(|(k, v)| json!({ "key": k, "value": v }))
            .collect();
        vars.push(json!({ "key": "ORCHESTRATOR_PIPELINE_YAML", "value": definition.content }));

        let body = json!({ "ref": self.git_ref, "variables": vars });
        let reply = self
            .remote
            .json(self.request(reqwest::Method::POST, "pipeline").json(&body))
            .await?;

        let id = reply
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| self.remote.error("pipeline id missing from response"))?;
        debug!("GitLab created pipeline {}", id);
        Ok(id.to_string())
    }

    async fn status(&self, external_id: &str) -> Result<RemoteBuildStatus, OrchestratorError> {
        let reply = self
            .remote
            .json(self.request(reqwest::Method::GET, &format!("pipelines/{}", external_id)))
            .await?;
        let status = reply
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| self.remote.error("pipeline status missing from response"))?;
        Ok(pipeline_status(status))
    }
}
