//! GitHub Actions workflow generation and dispatch

use crate::core::{config::RemoteConfig, OrchestratorError, SyncPolicy, WorkspaceContext};
use crate::execution::planner::{ExecutionPlan, Stage};
use crate::remote::{
    http::RemoteClient, job_name, BuildTrigger, CodeGenerator, PipelineDefinition,
    RemoteBuildStatus, StepScripts, ToolType,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use serde_yaml::{Mapping, Value as Yaml};
use tracing::debug;

const RUNNER: &str = "ubuntu-latest";
const CHECKOUT_ACTION: &str = "actions/checkout@v4";

/// Emits a workflow with one job per plan stage
///
/// Jobs are chained with `needs`. A parallel stage becomes a single job
/// whose `strategy.matrix.include` lists the members; `fail_fast` groups
/// set `fail-fast: true`.
pub struct GitHubGenerator {
    workflow_file: String,
}

impl GitHubGenerator {
    pub fn new(workflow_file: &str) -> Self {
        Self {
            workflow_file: workflow_file.to_string(),
        }
    }
}

impl Default for GitHubGenerator {
    fn default() -> Self {
        Self::new("orchestrated.yml")
    }
}

fn yaml(text: impl Into<String>) -> Yaml {
    Yaml::String(text.into())
}

fn minutes(seconds: u64) -> Yaml {
    Yaml::Number(seconds.div_ceil(60).max(1).into())
}

fn stage_job_id(stage: &Stage) -> String {
    let label = match &stage.group {
        Some(group) => group.clone(),
        None => stage.steps.first().map(|s| s.id.clone()).unwrap_or_default(),
    };
    format!("stage-{}-{}", stage.index, job_name(&label))
}

fn checkout_step() -> Yaml {
    let mut step = Mapping::new();
    step.insert(yaml("uses"), yaml(CHECKOUT_ACTION));
    Yaml::Mapping(step)
}

fn sequential_job(stage: &Stage, scripts: &StepScripts) -> Mapping {
    let mut job = Mapping::new();
    job.insert(yaml("runs-on"), yaml(RUNNER));
    let mut steps = vec![checkout_step()];
    if let Some(step) = stage.steps.first() {
        if step.timeout_secs > 0 {
            job.insert(yaml("timeout-minutes"), minutes(step.timeout_secs));
        }
        if step.continue_on_failure {
            job.insert(yaml("continue-on-error"), Yaml::Bool(true));
        }
        let mut run = Mapping::new();
        run.insert(yaml("name"), yaml(step.name.clone()));
        run.insert(yaml("run"), yaml(scripts.get(&step.id)));
        steps.push(Yaml::Mapping(run));
    }
    job.insert(yaml("steps"), Yaml::Sequence(steps));
    job
}

fn matrix_job(stage: &Stage, scripts: &StepScripts) -> Mapping {
    let mut job = Mapping::new();
    job.insert(yaml("runs-on"), yaml(RUNNER));
    let longest = stage.steps.iter().map(|s| s.timeout_secs).max().unwrap_or(0);
    let timeout = match stage.timeout_secs {
        Some(group) if longest > 0 => Some(group.min(longest)),
        Some(group) => Some(group),
        None => Some(longest).filter(|t| *t > 0),
    };
    if let Some(seconds) = timeout {
        job.insert(yaml("timeout-minutes"), minutes(seconds));
    }

    let include: Vec<Yaml> = stage
        .steps
        .iter()
        .map(|step| {
            let mut entry = Mapping::new();
            entry.insert(yaml("step"), yaml(step.id.clone()));
            entry.insert(yaml("name"), yaml(step.name.clone()));
            entry.insert(yaml("command"), yaml(scripts.get(&step.id)));
            entry.insert(yaml("allow_failure"), Yaml::Bool(step.continue_on_failure));
            Yaml::Mapping(entry)
        })
        .collect();
    let mut matrix = Mapping::new();
    matrix.insert(yaml("include"), Yaml::Sequence(include));

    let mut strategy = Mapping::new();
    strategy.insert(
        yaml("fail-fast"),
        Yaml::Bool(stage.policy() == SyncPolicy::FailFast),
    );
    strategy.insert(yaml("matrix"), Yaml::Mapping(matrix));
    job.insert(yaml("strategy"), Yaml::Mapping(strategy));
    job.insert(yaml("continue-on-error"), yaml("${{ matrix.allow_failure }}"));

    let mut run = Mapping::new();
    run.insert(yaml("name"), yaml("${{ matrix.name }}"));
    run.insert(yaml("run"), yaml("${{ matrix.command }}"));
    job.insert(
        yaml("steps"),
        Yaml::Sequence(vec![checkout_step(), Yaml::Mapping(run)]),
    );
    job
}

impl CodeGenerator for GitHubGenerator {
    fn tool(&self) -> ToolType {
        ToolType::GitHub
    }

    fn generate(
        &self,
        pipeline_name: &str,
        plan: &ExecutionPlan,
        scripts: &StepScripts,
    ) -> Result<PipelineDefinition, OrchestratorError> {
        let mut root = Mapping::new();
        root.insert(yaml("name"), yaml(pipeline_name));

        let mut on = Mapping::new();
        on.insert(yaml("workflow_dispatch"), Yaml::Mapping(Mapping::new()));
        root.insert(yaml("on"), Yaml::Mapping(on));

        let mut jobs = Mapping::new();
        let mut previous: Option<String> = None;
        for stage in &plan.stages {
            let id = stage_job_id(stage);
            let mut job = if stage.is_parallel() {
                matrix_job(stage, scripts)
            } else {
                sequential_job(stage, scripts)
            };
            if let Some(prev) = &previous {
                job.insert(yaml("needs"), Yaml::Sequence(vec![yaml(prev.clone())]));
            }
            jobs.insert(yaml(id.clone()), Yaml::Mapping(job));
            previous = Some(id);
        }
        root.insert(yaml("jobs"), Yaml::Mapping(jobs));

        let content = serde_yaml::to_string(&Yaml::Mapping(root))
            .map_err(|e| OrchestratorError::remote("github", format!("failed to render YAML: {}", e)))?;

        Ok(PipelineDefinition {
            tool: ToolType::GitHub,
            file_name: format!(".github/workflows/{}", self.workflow_file),
            content,
        })
    }
}

/// Dispatches a workflow through the GitHub REST API
///
/// The workflow must declare a `pipeline` input receiving the definition.
/// Dispatch replies carry no run id, so the newest dispatched run of the
/// workflow is taken as the build.
pub struct GitHubTrigger {
    remote: RemoteClient,
    repository: String,
    workflow: String,
    git_ref: String,
}

impl GitHubTrigger {
    pub fn new(config: &RemoteConfig) -> Result<Self, OrchestratorError> {
        Ok(Self {
            remote: RemoteClient::new(ToolType::GitHub, config)?,
            repository: config.project.clone(),
            workflow: config
                .workflow
                .clone()
                .unwrap_or_else(|| "orchestrated.yml".to_string()),
            git_ref: config.git_ref.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = self
            .remote
            .url(&format!("repos/{}/{}", self.repository, path));
        let request = self
            .remote
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json");
        match &self.remote.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Map a workflow run's `status` and `conclusion`
pub fn run_status(status: &str, conclusion: Option<&str>) -> RemoteBuildStatus {
    match status {
        "completed" => match conclusion {
            Some("success") | Some("neutral") | Some("skipped") => RemoteBuildStatus::Success,
            Some("cancelled") => RemoteBuildStatus::Cancelled,
            _ => RemoteBuildStatus::Failed,
        },
        "in_progress" => RemoteBuildStatus::Running,
        _ => RemoteBuildStatus::Pending,
    }
}

#[async_trait]
impl BuildTrigger for GitHubTrigger {
    async fn trigger(
        &self,
        definition: &PipelineDefinition,
        variables: &WorkspaceContext,
    ) -> Result<String, OrchestratorError> {
        let vars: serde_json::Map<String, Value> = variables
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let body = json!({
            "ref": self.git_ref,
            "inputs": {
                "pipeline": definition.content,
                "variables": Value::Object(vars).to_string(),
            }
        });
        let dispatch = format!("actions/workflows/{}/dispatches", self.workflow);
        self.remote
            .send(self.request(reqwest::Method::POST, &dispatch).json(&body))
            .await?;

        let runs = format!(
            "actions/workflows/{}/runs?event=workflow_dispatch&per_page=1",
            self.workflow
        );
        let reply = self
            .remote
            .json(self.request(reqwest::Method::GET, &runs))
            .await?;
        let id = reply
            .get("workflow_runs")
            .and_then(|runs| runs.get(0))
            .and_then(|run| run.get("id"))
            .and_then(Value::as_u64)
            .ok_or_else(|| self.remote.error("dispatched run not found"))?;
        debug!("GitHub dispatched workflow run {}", id);
        Ok(id.to_string())
    }

    async fn status(&self, external_id: &str) -> Result<RemoteBuildStatus, OrchestratorError> {
        let reply = self
            .remote
            .json(self.request(reqwest::Method::GET, &format!("actions/runs/{}", external_id)))
            .await?;
        let status = reply
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| self.remote.error("run status missing from response"))?;
        let conclusion = reply.get("conclusion").and_then(Value::as_str);
        Ok(run_status(status, conclusion))
    }
}
