//! CLI binary for running, inspecting, and reexecuting Lineage pipelines.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use lineage_pipeline::{
    default_registry, resolve_step_states, InstanceConfig, LaunchRequest, LineageInstance,
    Orchestrator, PipelineDefinition, StepDisposition,
};
use lineage_types::{RunId, RunStats, RunStatus, StepEvent, StepEventKind, StepKey, StepState};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "lineage", version, about = "Step pipeline runner with lineage-aware reexecution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Instance directory holding runs, event logs, and step outputs
    #[arg(long, global = true, default_value = ".lineage")]
    root: PathBuf,

    /// Override the instance's step concurrency limit
    #[arg(long, global = true)]
    max_concurrency: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline .json file
    Validate {
        /// Path to the pipeline .json file
        pipeline: PathBuf,
    },

    /// Show which steps a launch would execute and which it would reuse
    Plan {
        /// Path to the pipeline .json file
        pipeline: PathBuf,

        /// Comma-separated step keys to execute
        #[arg(long, value_delimiter = ',')]
        steps: Option<Vec<StepKey>>,

        /// Plan a reexecution of this run
        #[arg(long)]
        parent: Option<String>,

        /// Resume from the parent's failures (requires --parent)
        #[arg(long, requires = "parent")]
        resume: bool,
    },

    /// Launch a pipeline and wait for it to finish
    Run {
        /// Path to the pipeline .json file
        pipeline: PathBuf,

        /// Run config .json file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Comma-separated step keys to execute
        #[arg(long, value_delimiter = ',')]
        steps: Option<Vec<StepKey>>,
    },

    /// Reexecute a previous run, reusing outputs of steps that are not rerun
    Retry {
        /// Path to the pipeline .json file
        pipeline: PathBuf,

        /// Run to reexecute
        run_id: String,

        /// Run config .json file (defaults to the parent's config)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Comma-separated step keys to execute
        #[arg(long, value_delimiter = ',', conflicts_with = "resume")]
        steps: Option<Vec<StepKey>>,

        /// Re-execute only failed and not-run steps plus their dependents
        #[arg(long)]
        resume: bool,
    },

    /// Show a run's status, lineage, and step states
    Info {
        /// Run to inspect
        run_id: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print a run's event log
    Logs {
        /// Run to inspect
        run_id: String,
    },

    /// Mark runs whose launching process has exited as failed
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    match cli.command {
        Commands::Validate { pipeline } => {
            cmd_validate(&pipeline)?;
        }
        Commands::Plan {
            pipeline,
            steps,
            parent,
            resume,
        } => {
            cmd_plan(&cli.root, cli.max_concurrency, &pipeline, steps, parent, resume).await?;
        }
        Commands::Run {
            pipeline,
            config,
            steps,
        } => {
            cmd_run(&cli.root, cli.max_concurrency, &pipeline, config.as_deref(), steps).await?;
        }
        Commands::Retry {
            pipeline,
            run_id,
            config,
            steps,
            resume,
        } => {
            cmd_retry(&cli.root, cli.max_concurrency, &pipeline, &run_id, config.as_deref(), steps, resume).await?;
        }
        Commands::Info { run_id, json } => {
            cmd_info(&cli.root, &run_id, json).await?;
        }
        Commands::Logs { run_id } => {
            cmd_logs(&cli.root, &run_id).await?;
        }
        Commands::Sweep => {
            cmd_sweep(&cli.root).await?;
        }
    }

    Ok(())
}

fn load_pipeline(path: &Path) -> anyhow::Result<PipelineDefinition> {
    let source = std::fs::read_to_string(path)?;
    Ok(PipelineDefinition::from_json(&source)?)
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Option<serde_json::Value>> {
    match path {
        Some(path) => {
            let source = std::fs::read_to_string(path)?;
            Ok(Some(serde_json::from_str(&source)?))
        }
        None => Ok(None),
    }
}

/// Open the instance at `root` with the pipeline at `pipeline` registered.
async fn open(
    root: &Path,
    pipeline: &Path,
    max_concurrency: Option<usize>,
) -> anyhow::Result<(Orchestrator, Arc<PipelineDefinition>)> {
    let definition = load_pipeline(pipeline)?;
    let mut instance = LineageInstance::open_fs(root).await?;
    if let Some(limit) = max_concurrency {
        let mut config: InstanceConfig = instance.config().clone();
        config.max_concurrency = Some(limit);
        instance = instance.with_config(config);
    }
    let mut orchestrator = instance.orchestrator(default_registry());
    let definition = orchestrator.register_pipeline(definition);
    Ok((orchestrator, definition))
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let pipeline = match load_pipeline(path) {
        Ok(p) => p,
        Err(e) => {
            println!("[ERROR] {}", e);
            std::process::exit(1);
        }
    };

    let registry = default_registry();
    let mut has_error = false;
    for step in pipeline.steps() {
        if let Err(e) = registry.resolve(step) {
            has_error = true;
            println!("[ERROR] {}", e);
        }
    }
    if has_error {
        std::process::exit(1);
    }

    println!("Pipeline '{}' is valid ({} steps)", pipeline.name(), pipeline.len());
    Ok(())
}

async fn cmd_plan(
    root: &Path,
    max_concurrency: Option<usize>,
    path: &Path,
    steps: Option<Vec<StepKey>>,
    parent: Option<String>,
    resume: bool,
) -> anyhow::Result<()> {
    let (orchestrator, pipeline) = open(root, path, max_concurrency).await?;

    let mut request = LaunchRequest::new(pipeline.name());
    if let Some(steps) = steps {
        request = request.with_step_keys(steps);
    }
    if let Some(parent) = parent {
        request = request.with_parent(parent);
    }
    if resume {
        request = request.resume();
    }

    let (plan, _) = orchestrator.plan(&request).await?;
    println!("Pipeline: {}", pipeline.name());
    for key in plan.pipeline().steps().iter().map(|s| &s.key) {
        match plan.disposition(key) {
            Some(StepDisposition::Execute) => println!("  {:<24} execute", key),
            Some(StepDisposition::Reuse { source_run_id }) => {
                println!("  {:<24} reuse from {}", key, source_run_id)
            }
            None => println!("  {:<24} -", key),
        }
    }
    Ok(())
}

async fn cmd_run(
    root: &Path,
    max_concurrency: Option<usize>,
    path: &Path,
    config: Option<&Path>,
    steps: Option<Vec<StepKey>>,
) -> anyhow::Result<()> {
    let (orchestrator, pipeline) = open(root, path, max_concurrency).await?;

    let mut request = LaunchRequest::new(pipeline.name());
    if let Some(config) = load_config(config)? {
        request = request.with_run_config(config);
    }
    if let Some(steps) = steps {
        request = request.with_step_keys(steps);
    }

    println!("Running pipeline: {}", pipeline.name());
    let run_id = orchestrator.launch(request).await?;
    finish(&orchestrator, &run_id).await
}

async fn cmd_retry(
    root: &Path,
    max_concurrency: Option<usize>,
    path: &Path,
    parent_id: &str,
    config: Option<&Path>,
    steps: Option<Vec<StepKey>>,
    resume: bool,
) -> anyhow::Result<()> {
    let (orchestrator, _) = open(root, path, max_concurrency).await?;
    // A parent whose process crashed is still STARTED until swept.
    report_swept(&orchestrator.monitor().sweep().await?);
    let parent = orchestrator.get_run(parent_id).await?;

    let run_config = match load_config(config)? {
        Some(config) => config,
        None => parent.run_config.clone(),
    };
    let mut request = LaunchRequest::new(&parent.pipeline_name)
        .with_parent(&parent.run_id)
        .with_run_config(run_config);
    if let Some(steps) = steps {
        request = request.with_step_keys(steps);
    } else if resume {
        request = request.resume();
    }

    println!("Reexecuting {} (root {})", parent.run_id, parent.root_run_id);
    let run_id = orchestrator.reexecute(request).await?;
    let info = orchestrator.reexecution_info(&run_id).await?;
    if let Some(keys) = &info.step_keys_to_execute {
        println!("Executing: {}", keys.join(", "));
    }
    finish(&orchestrator, &run_id).await
}

async fn cmd_sweep(root: &Path) -> anyhow::Result<()> {
    let instance = LineageInstance::open_fs(root).await?;
    let swept = instance.orchestrator(default_registry()).monitor().sweep().await?;
    if swept.is_empty() {
        println!("No abandoned runs");
    }
    report_swept(&swept);
    Ok(())
}

fn report_swept(run_ids: &[RunId]) {
    for run_id in run_ids {
        println!("Marked abandoned run {} as FAILURE", run_id);
    }
}

/// Stream a run's events until it finishes, then print its step summary.
async fn finish(orchestrator: &Orchestrator, run_id: &str) -> anyhow::Result<()> {
    println!("Run: {}", run_id);
    let mut events = orchestrator.subscribe(run_id).await?;
    while let Some(event) = events.next().await {
        print_event(&event);
    }

    let run = orchestrator.get_run(run_id).await?;
    let stats = orchestrator.run_stats(run_id).await?;
    println!(
        "\nRun {} finished: {} ({} succeeded, {} failed, {} skipped)",
        run.run_id, run.status, stats.steps_succeeded, stats.steps_failed, stats.steps_skipped
    );
    if run.status != RunStatus::Success {
        std::process::exit(1);
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunInfo {
    run_id: String,
    pipeline: String,
    status: RunStatus,
    root_run_id: String,
    parent_run_id: Option<String>,
    step_keys_to_execute: Option<Vec<StepKey>>,
    created_at: chrono::DateTime<chrono::Utc>,
    stats: RunStats,
    steps: Vec<(StepKey, StepState)>,
    group: Vec<String>,
}

async fn cmd_info(root: &Path, run_id: &str, json: bool) -> anyhow::Result<()> {
    let instance = LineageInstance::open_fs(root).await?;
    let run = instance
        .runs()
        .get_run(run_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Run {} not found in {}", run_id, root.display()))?;
    let events = instance.event_log().get_events(run_id).await?;

    // Without a recorded subset, report every step the log mentions.
    let keys: Vec<StepKey> = match &run.step_keys_to_execute {
        Some(keys) => keys.clone(),
        None => events
            .iter()
            .filter_map(|e| e.step_key.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
    };
    let states = resolve_step_states(&keys, &events);
    let group = instance
        .runs()
        .get_runs_by_root_id(&run.root_run_id)
        .await?
        .into_iter()
        .map(|r| r.run_id)
        .collect();

    let info = RunInfo {
        stats: RunStats::from_events(&events),
        steps: keys
            .iter()
            .map(|k| (k.clone(), states.get(k).copied().unwrap_or(StepState::NotRun)))
            .collect(),
        run_id: run.run_id,
        pipeline: run.pipeline_name,
        status: run.status,
        root_run_id: run.root_run_id,
        parent_run_id: run.parent_run_id,
        step_keys_to_execute: run.step_keys_to_execute,
        created_at: run.created_at,
        group,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("Run: {}", info.run_id);
    println!("Pipeline: {}", info.pipeline);
    println!("Status: {}", info.status);
    println!("Created: {}", info.created_at.to_rfc3339());
    println!("Root: {}", info.root_run_id);
    if let Some(parent) = &info.parent_run_id {
        println!("Parent: {}", parent);
    }
    match &info.step_keys_to_execute {
        Some(keys) => println!("Steps to execute: [{}]", keys.join(", ")),
        None => println!("Steps to execute: (all)"),
    }

    println!("\nSteps:");
    for (key, state) in &info.steps {
        println!("  {:<24} {:?}", key, state);
    }

    println!("\nRun group ({} runs):", info.group.len());
    for id in &info.group {
        let marker = if id == &info.run_id { "*" } else { " " };
        println!(" {} {}", marker, id);
    }
    Ok(())
}

async fn cmd_logs(root: &Path, run_id: &str) -> anyhow::Result<()> {
    let instance = LineageInstance::open_fs(root).await?;
    if instance.runs().get_run(run_id).await?.is_none() {
        anyhow::bail!("Run {} not found in {}", run_id, root.display());
    }
    for event in instance.event_log().get_events(run_id).await? {
        print_event(&event);
    }
    Ok(())
}

fn print_event(event: &StepEvent) {
    let what = match &event.kind {
        StepEventKind::RunStarted => "RUN_STARTED".to_string(),
        StepEventKind::RunSuccess => "RUN_SUCCESS".to_string(),
        StepEventKind::RunFailure { message } => match message {
            Some(m) => format!("RUN_FAILURE: {}", m),
            None => "RUN_FAILURE".to_string(),
        },
        StepEventKind::RunCanceled => "RUN_CANCELED".to_string(),
        StepEventKind::Started => "STEP_START".to_string(),
        StepEventKind::OutputProduced { output_name } => format!("STEP_OUTPUT {}", output_name),
        StepEventKind::Succeeded => "STEP_SUCCESS".to_string(),
        StepEventKind::Failed { message } => format!("STEP_FAILURE: {}", message),
        StepEventKind::Skipped { reason } => format!("STEP_SKIPPED: {}", reason),
    };
    println!(
        "[{:>4}] {} {:<24} {}",
        event.sequence,
        event.timestamp.format("%H:%M:%S%.3f"),
        event.step_key.as_deref().unwrap_or("-"),
        what
    );
}
