//! Scenario-based tests for pipeline-orchestrator

mod history;
mod hybrid;
mod local_stages;
mod optimizer_runs;
mod parallel_groups;
mod remote_dispatch;
