//! Command-line interface
//!
//! Thin wrapper over the execution core: parse arguments, load and
//! validate the spec, run the benchmark, write the report, and map the
//! result onto the process exit code (0 all passed, 1 completed with
//! failures, 2 infrastructure error).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::engine::{DefaultEngineFactory, EngineKind};
use crate::error::WazaError;
use crate::report::ReportStore;
use crate::runner::LifecycleController;
use crate::spec::load_spec;

#[derive(Parser, Debug)]
#[command(name = "waza", version, about = "Evaluate AI agent skills against structured benchmarks")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a benchmark spec and write a JSON report.
    Run(RunArgs),

    /// Load and validate a benchmark spec without running it.
    Validate {
        /// Path to the benchmark spec YAML.
        spec: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the benchmark spec YAML.
    pub spec: PathBuf,

    /// Target model; repeat for multiple models. Defaults to the spec's
    /// configured model.
    #[arg(long = "model")]
    pub models: Vec<String>,

    /// Root directory task fixtures resolve against. Defaults to the spec
    /// file's directory.
    #[arg(long)]
    pub fixtures_root: Option<PathBuf>,

    /// Directory reports are written into.
    #[arg(long, default_value = "results")]
    pub results_dir: PathBuf,

    /// Force parallel task execution.
    #[arg(long)]
    pub parallel: bool,

    /// Override the configured worker count.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Override the configured runs per task.
    #[arg(long)]
    pub runs_per_task: Option<u32>,

    /// Stop scheduling new work after the first failure.
    #[arg(long)]
    pub stop_on_error: bool,

    /// Override the configured engine kind ("mock", "api").
    #[arg(long)]
    pub executor: Option<String>,
}

/// Execute the parsed command and return the process exit code.
pub async fn execute(cli: Cli) -> Result<i32, WazaError> {
    match cli.command {
        Command::Validate { spec } => {
            let spec = load_spec(&spec)?;
            println!(
                "spec '{}' is valid: {} tasks, {} global graders",
                spec.name,
                spec.tasks.len(),
                spec.global_graders.len()
            );
            Ok(0)
        }
        Command::Run(args) => run_benchmark(args).await,
    }
}

async fn run_benchmark(args: RunArgs) -> Result<i32, WazaError> {
    let mut spec = load_spec(&args.spec)?;

    if args.parallel {
        spec.config.parallel = true;
    }
    if args.stop_on_error {
        spec.config.stop_on_error = true;
    }
    if let Some(workers) = args.workers {
        spec.config.workers = workers.max(1);
    }
    if let Some(runs) = args.runs_per_task {
        spec.config.runs_per_task = runs.max(1);
    }
    if let Some(executor) = args.executor {
        spec.config.executor = executor;
    }

    let kind: EngineKind = spec
        .config
        .executor
        .parse()
        .map_err(|e: crate::engine::EngineError| WazaError::Spec(e.to_string()))?;

    let fixtures_root = args.fixtures_root.unwrap_or_else(|| {
        args.spec
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    });

    let controller = LifecycleController::new(
        Arc::new(spec),
        Arc::new(DefaultEngineFactory::new(kind)),
        fixtures_root,
        CancellationToken::new(),
    );
    controller.install_signal_handlers();

    let report = controller.run(&args.models).await?;

    let store = ReportStore::new(&args.results_dir);
    let path = store.save(&report).await?;

    for outcome in &report.outcomes {
        match &outcome.error {
            Some(error) => println!("model {}: failed ({error})", outcome.model),
            None => println!(
                "model {}: {}/{} runs passed (mean score {:.2})",
                outcome.model,
                outcome.aggregate.runs_passed,
                outcome.aggregate.total_runs,
                outcome.aggregate.mean_score
            ),
        }
    }
    println!("report: {}", path.display());

    Ok(report.exit_code())
}
