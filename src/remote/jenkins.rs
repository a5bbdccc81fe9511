//! Jenkins declarative pipeline generation and build triggering

use crate::core::{config::RemoteConfig, OrchestratorError, Step, SyncPolicy, WorkspaceContext};
use crate::execution::planner::{ExecutionPlan, Stage};
use crate::remote::{
    http::{encode_segment, RemoteClient},
    unique_name, BuildTrigger, CodeGenerator, PipelineDefinition, RemoteBuildStatus, StepScripts,
    ToolType,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

/// Emits a declarative `Jenkinsfile`
///
/// Parallel groups become `parallel` blocks; `fail_fast` groups set
/// `failFast true`. Jenkins has no first-success join, so `wait_any`
/// groups run as plain parallel blocks. Stage names are unique across the
/// whole file, as Jenkins requires.
pub struct JenkinsGenerator;

/// Single-quoted Groovy string; line breaks become escapes
fn quote(text: &str) -> String {
    let escaped = text
        .replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace('\r', "\\r")
        .replace('\n', "\\n");
    format!("'{}'", escaped)
}

fn pad(depth: usize) -> String {
    " ".repeat(depth * 4)
}

fn render_timeout(out: &mut String, depth: usize, seconds: u64) {
    out.push_str(&format!("{}options {{\n", pad(depth)));
    out.push_str(&format!(
        "{}timeout(time: {}, unit: 'SECONDS')\n",
        pad(depth + 1),
        seconds
    ));
    out.push_str(&format!("{}}}\n", pad(depth)));
}

fn render_step(
    out: &mut String,
    depth: usize,
    step: &Step,
    scripts: &StepScripts,
    names: &mut HashSet<String>,
) {
    let name = unique_name(&step.name, names);
    out.push_str(&format!("{}stage({}) {{\n", pad(depth), quote(&name)));
    if step.timeout_secs > 0 {
        render_timeout(out, depth + 1, step.timeout_secs);
    }
    out.push_str(&format!("{}steps {{\n", pad(depth + 1)));
    let sh = format!("sh {}", quote(scripts.get(&step.id)));
    if step.continue_on_failure {
        out.push_str(&format!(
            "{}catchError(buildResult: 'SUCCESS', stageResult: 'FAILURE') {{\n",
            pad(depth + 2)
        ));
        out.push_str(&format!("{}{}\n", pad(depth + 3), sh));
        out.push_str(&format!("{}}}\n", pad(depth + 2)));
    } else {
        out.push_str(&format!("{}{}\n", pad(depth + 2), sh));
    }
    out.push_str(&format!("{}}}\n", pad(depth + 1)));
    out.push_str(&format!("{}}}\n", pad(depth)));
}

fn render_group(
    out: &mut String,
    depth: usize,
    stage: &Stage,
    scripts: &StepScripts,
    names: &mut HashSet<String>,
) {
    let base = stage.group.clone().unwrap_or_else(|| format!("stage-{}", stage.index));
    let name = unique_name(&base, names);
    out.push_str(&format!("{}stage({}) {{\n", pad(depth), quote(&name)));
    if let Some(seconds) = stage.timeout_secs {
        render_timeout(out, depth + 1, seconds);
    }
    match stage.policy() {
        SyncPolicy::FailFast => out.push_str(&format!("{}failFast true\n", pad(depth + 1))),
        SyncPolicy::WaitAny => out.push_str(&format!("{}// sync policy: wait_any\n", pad(depth + 1))),
        SyncPolicy::WaitAll => {}
    }
    out.push_str(&format!("{}parallel {{\n", pad(depth + 1)));
    for step in &stage.steps {
        render_step(out, depth + 2, step, scripts, names);
    }
    out.push_str(&format!("{}}}\n", pad(depth + 1)));
    out.push_str(&format!("{}}}\n", pad(depth)));
}

impl CodeGenerator for JenkinsGenerator {
    fn tool(&self) -> ToolType {
        ToolType::Jenkins
    }

    fn generate(
        &self,
        pipeline_name: &str,
        plan: &ExecutionPlan,
        scripts: &StepScripts,
    ) -> Result<PipelineDefinition, OrchestratorError> {
        let mut out = format!("// Pipeline: {}\n", pipeline_name.replace('\n', " "));
        out.push_str("pipeline {\n");
        out.push_str(&format!("{}agent any\n", pad(1)));
        out.push_str(&format!("{}stages {{\n", pad(1)));
        let mut names = HashSet::new();
        for stage in &plan.stages {
            if stage.is_parallel() {
                render_group(&mut out, 2, stage, scripts, &mut names);
            } else {
                for step in &stage.steps {
                    render_step(&mut out, 2, step, scripts, &mut names);
                }
            }
        }
        out.push_str(&format!("{}}}\n", pad(1)));
        out.push_str("}\n");

        Ok(PipelineDefinition {
            tool: ToolType::Jenkins,
            file_name: "Jenkinsfile".to_string(),
            content: out,
        })
    }
}

/// Triggers a parameterized Jenkins job that runs the generated script
///
/// The job receives the definition in its `PIPELINE_SCRIPT` parameter. The
/// returned id is the queue item URL.
pub struct JenkinsTrigger {
    remote: RemoteClient,
    job_path: String,
}

impl JenkinsTrigger {
    pub fn new(config: &RemoteConfig) -> Result<Self, OrchestratorError> {
        let job_path = config
            .project
            .split('/')
            .filter(|p| !p.is_empty())
            .map(|p| format!("job/{}", encode_segment(p)))
            .collect::<Vec<_>>()
            .join("/");
        Ok(Self {
            remote: RemoteClient::new(ToolType::Jenkins, config)?,
            job_path,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        // `user:api-token` is sent as basic auth
        match self.remote.token.as_deref() {
            Some(token) => match token.split_once(':') {
                Some((user, secret)) => request.basic_auth(user, Some(secret)),
                None => request.bearer_auth(token),
            },
            None => request,
        }
    }
}

/// Map a Jenkins build JSON object to a build status
pub fn build_status(build: &Value) -> RemoteBuildStatus {
    if build.get("building").and_then(Value::as_bool).unwrap_or(false) {
        return RemoteBuildStatus::Running;
    }
    match build.get("result").and_then(Value::as_str) {
        Some("SUCCESS") => RemoteBuildStatus::Success,
        Some("FAILURE") | Some("UNSTABLE") => RemoteBuildStatus::Failed,
        Some("ABORTED") | Some("NOT_BUILT") => RemoteBuildStatus::Cancelled,
        _ => RemoteBuildStatus::Pending,
    }
}

#[async_trait]
impl BuildTrigger for JenkinsTrigger {
    async fn trigger(
        &self,
        definition: &PipelineDefinition,
        variables: &WorkspaceContext,
    ) -> Result<String, OrchestratorError> {
        let mut params: Vec<(String, String)> = variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        params.push(("PIPELINE_SCRIPT".to_string(), definition.content.clone()));

        let url = self.remote.url(&format!("{}/buildWithParameters", self.job_path));
        let request = self.authorize(self.remote.client.post(&url)).form(&params);
        let response = self.remote.send(request).await?;

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_end_matches('/').to_string())
            .ok_or_else(|| self.remote.error("no queue location in trigger response"))?;
        debug!("Jenkins queued build at {}", location);
        Ok(location)
    }

    async fn status(&self, external_id: &str) -> Result<RemoteBuildStatus, OrchestratorError> {
        let queue_url = format!("{}/api/json", external_id.trim_end_matches('/'));
        let item = self
            .remote
            .json(self.authorize(self.remote.client.get(&queue_url)))
            .await?;

        if item.get("cancelled").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(RemoteBuildStatus::Cancelled);
        }
        let Some(build_url) = item
            .get("executable")
            .and_then(|e| e.get("url"))
            .and_then(Value::as_str)
        else {
            return Ok(RemoteBuildStatus::Pending);
        };

        let build_api = format!("{}/api/json", build_url.trim_end_matches('/'));
        let build = self
            .remote
            .json(self.authorize(self.remote.client.get(&build_api)))
            .await?;
        Ok(build_status(&build))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::planner::ExecutionPlanner;
    use serde_json::json;
    use std::collections::HashMap;

    fn scripts(ids: &[&str]) -> StepScripts {
        let mut scripts = StepScripts::default();
        for id in ids {
            scripts.insert(id, format!("echo {}", id));
        }
        scripts
    }

    #[test]
    fn test_parallel_group_with_fail_fast() {
        let steps = vec![
            Step::new("build", "shell", 1),
            Step::new("unit", "shell", 2).in_group("tests"),
            Step::new("lint", "shell", 2).in_group("tests").continuing_on_failure(),
        ];
        let mut groups = HashMap::new();
        groups.insert(
            "tests".to_string(),
            crate::core::config::GroupConfig {
                sync_policy: SyncPolicy::FailFast,
                timeout_secs: Some(600),
            },
        );
        let plan = ExecutionPlanner::build(&steps, &groups).unwrap();
        let definition = JenkinsGenerator
            .generate("ci", &plan, &scripts(&["build", "unit", "lint"]))
            .unwrap();
        let text = &definition.content;

        assert_eq!(definition.file_name, "Jenkinsfile");
        assert!(text.starts_with("// Pipeline: ci\npipeline {"));
        assert!(text.contains("stage('tests') {"));
        assert!(text.contains("failFast true"));
        assert!(text.contains("parallel {"));
        assert!(text.contains("timeout(time: 600, unit: 'SECONDS')"));
        assert!(text.contains("catchError(buildResult: 'SUCCESS', stageResult: 'FAILURE')"));
        assert!(text.find("stage('build')").unwrap() < text.find("stage('tests')").unwrap());
        assert_eq!(text.matches('{').count(), text.matches('}').count());
    }

    #[test]
    fn test_quotes_are_escaped() {
        assert_eq!(quote("it's"), "'it\\'s'");
        assert_eq!(quote("make\nmake test"), "'make\\nmake test'");
    }

    #[test]
    fn test_multi_line_script_stays_on_one_line() {
        let steps = vec![Step::new("build", "shell", 1)];
        let plan = ExecutionPlanner::build(&steps, &HashMap::new()).unwrap();
        let mut scripts = StepScripts::default();
        scripts.insert("build", "make\nmake test\n");

        let text = JenkinsGenerator.generate("ci", &plan, &scripts).unwrap().content;

        assert!(text.contains("sh 'make\\nmake test\\n'\n"));
        assert!(!text.lines().any(|line| line.trim() == "make test'"));
    }

    #[test]
    fn test_stage_names_are_unique() {
        let steps = vec![
            Step::new("a", "shell", 1).with_name("tests"),
            Step::new("b", "shell", 2).in_group("tests").with_name("unit"),
            Step::new("c", "shell", 2).in_group("tests").with_name("unit"),
        ];
        let plan = ExecutionPlanner::build(&steps, &HashMap::new()).unwrap();
        let text = JenkinsGenerator
            .generate("ci", &plan, &scripts(&["a", "b", "c"]))
            .unwrap()
            .content;

        for name in ["'tests'", "'tests-2'", "'unit'", "'unit-2'"] {
            assert_eq!(text.matches(&format!("stage({})", name)).count(), 1, "{}", name);
        }
    }

    #[test]
    fn test_build_status_mapping() {
        assert_eq!(build_status(&json!({"building": true})), RemoteBuildStatus::Running);
        assert_eq!(
            build_status(&json!({"building": false, "result": "SUCCESS"})),
            RemoteBuildStatus::Success
        );
        assert_eq!(
            build_status(&json!({"building": false, "result": "ABORTED"})),
            RemoteBuildStatus::Cancelled
        );
        assert_eq!(build_status(&json!({})), RemoteBuildStatus::Pending);
    }
}
