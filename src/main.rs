use anyhow::{Context, Result};
use pipeline_orchestrator::cli::commands::{
    GenerateCommand, HistoryCommand, PlanCommand, RunCommand, ValidateCommand,
};
use pipeline_orchestrator::cli::output::*;
use pipeline_orchestrator::cli::{Cli, Command};
use pipeline_orchestrator::core::config::PipelineConfig;
use pipeline_orchestrator::core::{ExecutionStatus, TriggerMetadata};
use pipeline_orchestrator::execution::{ExecutionEngine, ExecutionEvent, ExecutionPlanner};
use pipeline_orchestrator::persistence::{InMemoryRunStore, RunStore};
use pipeline_orchestrator::runners;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    // Execute command
    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd).await?,
        Command::Plan(cmd) => show_plan(cmd)?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::Generate(cmd) => generate_definition(cmd)?,
        Command::History(cmd) => show_history(cmd).await?,
    }

    Ok(())
}

#[cfg(feature = "sqlite")]
async fn history_store() -> Result<Arc<dyn RunStore>> {
    let store = pipeline_orchestrator::persistence::SqliteRunStore::with_default_path().await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn history_store() -> Result<Arc<dyn RunStore>> {
    Ok(Arc::new(InMemoryRunStore::new()))
}

async fn run_pipeline(cmd: &RunCommand) -> Result<()> {
    let config = PipelineConfig::from_file(&cmd.file).context("Failed to load pipeline config")?;
    let pipeline = config.to_pipeline();

    if !cmd.json {
        println!("{} Loaded pipeline: {}", INFO, style(&pipeline.name).bold());
    }

    let mut trigger = TriggerMetadata::manual(whoami());
    trigger.mode_override = cmd.mode.clone();
    for (key, value) in &cmd.variable {
        trigger.variables.insert(key.clone(), value.clone());
        if !cmd.json {
            println!(
                "{} Variable override: {} = {}",
                INFO,
                style(key).cyan(),
                style(value).dim()
            );
        }
    }

    let store: Arc<dyn RunStore> = if cmd.no_history {
        Arc::new(InMemoryRunStore::new())
    } else {
        history_store().await?
    };

    let engine = ExecutionEngine::new(runners::default_registry()).with_store(store);

    if !cmd.json {
        let progress = create_progress_bar(0);
        let bar = progress.clone();
        engine.subscribe(move |event| {
            match &event {
                ExecutionEvent::RunStarted { total_stages, .. } => {
                    bar.set_length(*total_stages as u64)
                }
                ExecutionEvent::StageCompleted { .. } => bar.inc(1),
                ExecutionEvent::RunCompleted { .. } => bar.finish_and_clear(),
                _ => {}
            }
            bar.suspend(|| println!("{}", format_execution_event(&event)));
        });
        println!();
    }

    let handle = engine.run(&pipeline, trigger).await?;
    let snapshot = handle.wait().await;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else if snapshot.is_success() {
        println!(
            "\n{} {} completed {}",
            CHECK,
            style(&pipeline.name).bold(),
            style("successfully").green()
        );
        if !cmd.no_history {
            println!(
                "{} Run saved to history (ID: {})",
                INFO,
                style(&snapshot.run_id.to_string()[..8]).dim()
            );
        }
    } else {
        println!();
        print_run_details(&snapshot);
    }

    if snapshot.status != ExecutionStatus::Success {
        if let Some(failure) = &snapshot.failure {
            error!("{}", failure.error);
        }
        std::process::exit(1);
    }

    Ok(())
}

fn show_plan(cmd: &PlanCommand) -> Result<()> {
    let config = PipelineConfig::from_file(&cmd.file).context("Failed to load pipeline config")?;
    let plan = ExecutionPlanner::for_pipeline(&config.to_pipeline())?;

    if cmd.json {
        println!("{}", plan.to_json()?);
    } else {
        println!(
            "{} Execution plan for {} ({} stages, {} steps):",
            INFO,
            style(&config.name).bold(),
            plan.total_stages,
            plan.step_count()
        );
        println!("{}", format_plan(&plan));
    }

    Ok(())
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    let checked = PipelineConfig::from_file(&cmd.file).and_then(|config| {
        let pipeline = config.to_pipeline();
        ExecutionEngine::resolve_mode(&pipeline, &TriggerMetadata::default())?;
        let plan = ExecutionPlanner::for_pipeline(&pipeline)?;
        let missing = runners::default_registry().missing_types(&pipeline.steps);
        if !missing.is_empty() {
            anyhow::bail!("no executor registered for step type(s): {}", missing.join(", "));
        }
        Ok((config, plan))
    });

    match checked {
        Ok((config, plan)) => {
            println!("{} Pipeline configuration is valid!", CHECK);
            println!("  Name: {}", style(&config.name).bold());
            println!("  Mode: {}", style(&config.execution.mode).cyan());
            println!("  Steps: {}", style(config.steps.len()).cyan());
            println!("  Stages: {}", style(plan.total_stages).cyan());
            println!("  Variables: {}", style(config.variables.len()).cyan());
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}

fn generate_definition(cmd: &GenerateCommand) -> Result<()> {
    let config = PipelineConfig::from_file(&cmd.file).context("Failed to load pipeline config")?;
    let engine = ExecutionEngine::new(runners::default_registry());
    let definition = engine.generate(&config.to_pipeline(), cmd.tool.as_deref())?;

    eprintln!(
        "{} {} definition ({})",
        INFO,
        style(definition.tool.as_str()).bold(),
        style(&definition.file_name).dim()
    );
    println!("{}", definition.content);

    Ok(())
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = history_store().await?;

    if let Some(run_id) = &cmd.run_id {
        let run_id = uuid::Uuid::parse_str(run_id).context("Invalid run ID format")?;
        match store.load_run(run_id).await? {
            Some(run) if cmd.json => println!("{}", serde_json::to_string_pretty(&run)?),
            Some(run) => print_run_details(&run.snapshot()),
            None => println!("{} Run not found", WARN),
        }
        return Ok(());
    }

    let runs = store.list_runs(cmd.pipeline.as_deref(), cmd.limit).await?;

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(());
    }

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{} Run history (showing latest {}):", INFO, cmd.limit);
        for run in &runs {
            println!("  {}", format_run_summary(run));
        }
    }

    Ok(())
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "cli".to_string())
}
