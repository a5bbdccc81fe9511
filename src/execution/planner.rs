//! Execution planner - turns the declared step list into ordered stages

use crate::core::{
    config::GroupConfig, OrchestratorError, Pipeline, Step, SyncPolicy,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Whether a stage runs one step or a group concurrently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Sequential,
    Parallel,
}

/// One unit of the execution plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Position in the plan, contiguous from 0
    pub index: usize,
    pub kind: StageKind,
    /// Minimum `order` among the members
    pub anchor_order: i64,
    /// Group tag for parallel stages
    #[serde(default)]
    pub group: Option<String>,
    pub steps: Vec<Step>,
    /// Only set for parallel stages
    #[serde(default)]
    pub sync_policy: Option<SyncPolicy>,
    /// Only set for parallel stages
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Stage {
    pub fn is_parallel(&self) -> bool {
        self.kind == StageKind::Parallel
    }

    /// Sync policy, `wait_all` when none was declared
    pub fn policy(&self) -> SyncPolicy {
        self.sync_policy.unwrap_or_default()
    }

    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }

    /// Human-readable label used in logs and error messages
    pub fn label(&self) -> String {
        match &self.group {
            Some(group) => format!("stage {} (group {})", self.index, group),
            None => format!("stage {}", self.index),
        }
    }

    /// Same stage restricted to a subset of members
    pub fn with_steps(&self, steps: Vec<Step>) -> Stage {
        Stage {
            steps,
            ..self.clone()
        }
    }
}

/// Ordered stage sequence for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub stages: Vec<Stage>,
    pub total_stages: usize,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn step_count(&self) -> usize {
        self.stages.iter().map(|s| s.steps.len()).sum()
    }

    /// Total number of steps inside parallel stages
    pub fn parallel_step_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.is_parallel())
            .map(|s| s.steps.len())
            .sum()
    }

    /// Size of the largest parallel stage
    pub fn max_group_size(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.is_parallel())
            .map(|s| s.steps.len())
            .max()
            .unwrap_or(0)
    }

    /// All steps in plan order
    pub fn steps(&self) -> impl Iterator<Item = (&Stage, &Step)> {
        self.stages
            .iter()
            .flat_map(|stage| stage.steps.iter().map(move |step| (stage, step)))
    }

    /// Renumber stages to start at `first`, for a plan run after another one
    pub fn offset_indices(&mut self, first: usize) {
        for (position, stage) in self.stages.iter_mut().enumerate() {
            stage.index = first + position;
        }
    }

    pub fn to_json(&self) -> Result<String, OrchestratorError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| OrchestratorError::planning(format!("failed to serialize plan: {}", e)))
    }

    /// Parse a serialized plan, checking its indices are intact
    pub fn from_json(json: &str) -> Result<Self, OrchestratorError> {
        let plan: ExecutionPlan = serde_json::from_str(json)
            .map_err(|e| OrchestratorError::planning(format!("failed to parse plan: {}", e)))?;

        if plan.total_stages != plan.stages.len() {
            return Err(OrchestratorError::planning(format!(
                "plan declares {} stages but contains {}",
                plan.total_stages,
                plan.stages.len()
            )));
        }
        for (position, stage) in plan.stages.iter().enumerate() {
            if stage.index != position {
                return Err(OrchestratorError::planning(format!(
                    "stage at position {} has index {}",
                    position, stage.index
                )));
            }
        }
        Ok(plan)
    }
}

/// Builds execution plans from flat step lists
pub struct ExecutionPlanner;

impl ExecutionPlanner {
    pub fn for_pipeline(pipeline: &Pipeline) -> Result<ExecutionPlan, OrchestratorError> {
        Self::build(&pipeline.steps, &pipeline.groups)
    }

    /// Partition, group, and order steps into stages
    ///
    /// Ties on anchor order are broken by the declaration position of each
    /// stage's earliest member.
    pub fn build(
        steps: &[Step],
        groups: &HashMap<String, GroupConfig>,
    ) -> Result<ExecutionPlan, OrchestratorError> {
        Self::check_steps(steps)?;

        // (first declaration index, stage without index)
        let mut pending: Vec<(usize, Stage)> = Vec::new();
        let mut group_slots: HashMap<&str, usize> = HashMap::new();

        for (position, step) in steps.iter().enumerate() {
            match step.parallel_group.as_deref() {
                Some(tag) => match group_slots.get(tag) {
                    Some(&slot) => {
                        let stage = &mut pending[slot].1;
                        stage.anchor_order = stage.anchor_order.min(step.order);
                        stage.steps.push(step.clone());
                    }
                    None => {
                        let settings = groups.get(tag).cloned().unwrap_or_default();
                        group_slots.insert(tag, pending.len());
                        pending.push((
                            position,
                            Stage {
                                index: 0,
                                kind: StageKind::Parallel,
                                anchor_order: step.order,
                                group: Some(tag.to_string()),
                                steps: vec![step.clone()],
                                sync_policy: Some(settings.sync_policy),
                                timeout_secs: settings.timeout_secs.filter(|t| *t > 0),
                            },
                        ));
                    }
                },
                None => pending.push((
                    position,
                    Stage {
                        index: 0,
                        kind: StageKind::Sequential,
                        anchor_order: step.order,
                        group: None,
                        steps: vec![step.clone()],
                        sync_policy: None,
                        timeout_secs: None,
                    },
                )),
            }
        }

        pending.sort_by_key(|(position, stage)| (stage.anchor_order, *position));

        let stages: Vec<Stage> = pending
            .into_iter()
            .enumerate()
            .map(|(index, (_, mut stage))| {
                stage.index = index;
                stage.steps.sort_by_key(|s| s.order);
                stage
            })
            .collect();

        debug!(
            "Planned {} steps into {} stages",
            steps.len(),
            stages.len()
        );

        Ok(ExecutionPlan {
            total_stages: stages.len(),
            stages,
        })
    }

    fn check_steps(steps: &[Step]) -> Result<(), OrchestratorError> {
        let mut seen = HashSet::new();
        for step in steps {
            if step.id.trim().is_empty() {
                return Err(OrchestratorError::planning("step with empty id"));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(OrchestratorError::planning(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
            if step.step_type.trim().is_empty() {
                return Err(OrchestratorError::planning(format!(
                    "step '{}' has an empty type",
                    step.id
                )));
            }
        }
        Ok(())
    }
}
