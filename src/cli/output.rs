//! CLI output formatting

use crate::core::{ExecutionStatus, PipelineRun, RunSnapshot};
use crate::execution::{ExecutionEvent, ExecutionPlan, StageKind};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");

/// Create a progress bar over plan stages
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Success => style("SUCCESS").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
        ExecutionStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format a run for the history listing
pub fn format_run_summary(run: &PipelineRun) -> String {
    let status_icon = match run.status {
        ExecutionStatus::Success => CHECK,
        ExecutionStatus::Failed => CROSS,
        ExecutionStatus::Running => SPINNER,
        _ => INFO,
    };
    let started = run
        .started_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());

    format!(
        "{} {} - {} - {} ({}) - {}",
        status_icon,
        style(short_id(&run.id)).dim(),
        style(&run.pipeline_name).bold(),
        format_status(run.status),
        run.mode,
        style(started).dim()
    )
}

/// Format the execution plan as an indented stage list
pub fn format_plan(plan: &ExecutionPlan) -> String {
    let mut lines = Vec::new();
    for stage in &plan.stages {
        let header = match stage.kind {
            StageKind::Sequential => format!("Stage {} (order {})", stage.index, stage.anchor_order),
            StageKind::Parallel => format!(
                "Stage {} (order {}) parallel group '{}' [{}{}]",
                stage.index,
                stage.anchor_order,
                stage.group.as_deref().unwrap_or(""),
                stage.policy(),
                stage
                    .timeout_secs
                    .map(|t| format!(", timeout {}s", t))
                    .unwrap_or_default()
            ),
        };
        lines.push(style(header).bold().to_string());
        for step in &stage.steps {
            let mut line = format!("  - {} ({})", step.id, step.step_type);
            if step.continue_on_failure {
                line.push_str(" [continue on failure]");
            }
            lines.push(line);
        }
    }
    lines.join("\n")
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::RunStarted {
            run_id,
            pipeline_name,
            mode,
            total_stages,
        } => format!(
            "{} Starting pipeline {} ({}, {} mode, {} stages)",
            ROCKET,
            style(pipeline_name).bold(),
            style(short_id(run_id)).dim(),
            mode,
            total_stages
        ),
        ExecutionEvent::StageStarted {
            stage_index,
            kind,
            group,
            step_count,
            ..
        } => match (kind, group) {
            (StageKind::Parallel, Some(group)) => format!(
                "{} Stage {}: group {} ({} steps)",
                INFO,
                stage_index,
                style(group).cyan(),
                step_count
            ),
            _ => format!("{} Stage {}", INFO, stage_index),
        },
        ExecutionEvent::StepStarted { step_id, .. } => {
            format!("{} {}", SPINNER, style(step_id).cyan())
        }
        ExecutionEvent::StepSucceeded { step_id, .. } => {
            format!("{} {}", CHECK, style(step_id).green())
        }
        ExecutionEvent::StepFailed {
            step_id,
            error,
            tolerated,
            ..
        } => {
            if *tolerated {
                format!(
                    "{} {}: {} (allowed to fail)",
                    WARN,
                    style(step_id).yellow(),
                    style(error).dim()
                )
            } else {
                format!("{} {}: {}", CROSS, style(step_id).red(), style(error).dim())
            }
        }
        ExecutionEvent::StepCancelled {
            step_id, reason, ..
        } => format!("{} {} {}", SKIP, style(step_id).dim(), style(reason).dim()),
        ExecutionEvent::StageCompleted {
            stage_index,
            success,
            ..
        } => {
            if *success {
                format!("{} Stage {} passed", INFO, stage_index)
            } else {
                format!("{} Stage {} {}", CROSS, stage_index, style("failed").red())
            }
        }
        ExecutionEvent::RemoteDispatched {
            tool, external_id, ..
        } => format!(
            "{} Dispatched to {} as {}",
            ROCKET,
            style(tool).bold(),
            style(external_id).cyan()
        ),
        ExecutionEvent::RunCompleted { run_id, status } => format!(
            "{} Run {} {}",
            INFO,
            style(short_id(run_id)).dim(),
            format_status(*status)
        ),
    }
}

/// Print a finished run with its failure and cancellations
pub fn print_run_details(snapshot: &RunSnapshot) {
    println!("{} Run Details", INFO);
    println!("  ID: {}", style(snapshot.run_id).cyan());
    println!("  Pipeline: {}", style(&snapshot.pipeline_name).bold());
    println!("  Mode: {}", snapshot.mode);
    println!("  Status: {}", format_status(snapshot.status));
    if let Some(external_id) = &snapshot.external_id {
        println!("  Remote build: {}", style(external_id).cyan());
    }
    if let (Some(started), Some(completed)) = (snapshot.started_at, snapshot.completed_at) {
        if let Ok(duration) = completed.signed_duration_since(started).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }

    if let Some(failure) = &snapshot.failure {
        let location = match (&failure.step_id, failure.stage_index) {
            (Some(step), Some(stage)) => format!("step '{}' in stage {}", step, stage),
            (Some(step), None) => format!("step '{}'", step),
            (None, Some(stage)) => format!("stage {}", stage),
            (None, None) => "run".to_string(),
        };
        println!("  Failed at: {}", style(location).red());
        println!("  Error: {}", style(&failure.error).dim());
    }

    println!("\n  {}", style("Steps:").bold());
    for step in &snapshot.steps {
        println!("    {} {}", format_status(step.status), step.step_id);
        if let Some(error) = &step.error {
            println!("      {}", style(error).dim());
        }
    }

    if !snapshot.retryable_steps().is_empty() {
        println!(
            "\n  Retryable: {}",
            style(snapshot.retryable_steps().join(", ")).yellow()
        );
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

/// Format step output with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let truncated = lines[..max_lines].join("\n");
        format!(
            "{}\n{}... ({} more lines)",
            truncated,
            style("[truncated]").dim(),
            lines.len() - max_lines
        )
    }
}
