//! relay - run and inspect workflow definitions.
//!
//! Exit codes: 0 success, 1 usage or internal error, 2 validation error,
//! 3 runtime failure, 4 cancelled.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_agent::audit::verify_chain;
use relay_agent::workflow::{load_definition_from_file, WorkflowValidator};
use relay_core::{Payload, RunId};
use relay_runtime::{ExitStatus, Runtime, RuntimeConfig, RuntimeError};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

const DEFAULT_CONFIG: &str = "relay.toml";

/// relay - phased workflow orchestration
#[derive(Parser)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Runtime configuration file (defaults to ./relay.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow to completion
    ///
    /// WORKFLOW is either the name of a definition in the workflows
    /// directory or a path to a YAML definition. Ctrl-C cancels the run and
    /// rolls it back.
    Run {
        workflow: String,

        /// Argument payload as a JSON document
        #[arg(short, long)]
        args: Option<String>,
    },

    /// Validate a YAML definition without running it
    Validate { file: PathBuf },

    /// List the workflows in the workflows directory
    List,

    /// Show the replayed status of a run
    Status { run_id: RunId },

    /// Print the audit log of a run as JSON lines
    Audit {
        run_id: RunId,

        /// Check the digest chain instead of printing
        #[arg(long)]
        verify: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitStatus::Usage.into();
        }
    };
    init_tracing(cli.verbose, config.log_filter.as_deref());

    match run_command(cli.command, config).await {
        Ok(status) => status.into(),
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<RuntimeError>()
                .map(ExitStatus::from_error)
                .unwrap_or(ExitStatus::Usage)
                .into()
        }
    }
}

/// Initialize tracing subscriber for structured logging
fn init_tracing(verbose: bool, default_filter: Option<&str>) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("relay=debug,relay_runtime=debug,relay_agent=debug,relay_core=debug")
        } else {
            EnvFilter::new(default_filter.unwrap_or("relay=info,relay_runtime=info,relay_agent=info"))
        }
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display())),
        None if Path::new(DEFAULT_CONFIG).is_file() => RuntimeConfig::load(Path::new(DEFAULT_CONFIG))
            .context("Failed to load ./relay.toml"),
        None => Ok(RuntimeConfig::default()),
    }
}

async fn run_command(command: Commands, config: RuntimeConfig) -> Result<ExitStatus> {
    match command {
        Commands::Run { workflow, args } => run_workflow(config, &workflow, args.as_deref()).await,
        Commands::Validate { file } => validate(config, &file).await,
        Commands::List => {
            let runtime = Runtime::new(config);
            runtime.load_workflows_dir().await?;
            for name in runtime.workflows() {
                println!("{name}");
            }
            Ok(ExitStatus::Success)
        }
        Commands::Status { run_id } => {
            let history = Runtime::new(config).history(run_id).await?;
            println!("{}", serde_json::to_string_pretty(&history)?);
            Ok(ExitStatus::Success)
        }
        Commands::Audit { run_id, verify } => audit(config, run_id, verify).await,
    }
}

async fn run_workflow(config: RuntimeConfig, workflow: &str, args: Option<&str>) -> Result<ExitStatus> {
    let args: Payload = match args {
        Some(raw) => serde_json::from_str(raw).context("--args must be a JSON document")?,
        None => Payload::Null,
    };

    let runtime = Arc::new(Runtime::new(config));
    let name = if Path::new(workflow).is_file() {
        runtime.register_file(workflow).await?
    } else {
        runtime.load_workflows_dir().await?;
        workflow.to_string()
    };

    let run_id = runtime.start(&name, args).await?;
    info!("Run {} started", run_id);

    let canceller = Arc::clone(&runtime);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            canceller.cancel_all("interrupted");
        }
    });

    let outcome = runtime.wait(run_id).await;
    interrupt.abort();
    let outcome = outcome?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    let status = ExitStatus::from_outcome(&outcome);
    info!("Run {} ended {} ({})", run_id, outcome.status, status);
    Ok(status)
}

async fn validate(config: RuntimeConfig, file: &Path) -> Result<ExitStatus> {
    let definition = load_definition_from_file(file)
        .await
        .map_err(|source| RuntimeError::Definition {
            path: file.to_path_buf(),
            source,
        })?;

    // Only check worker ids when the configuration declares workers.
    if !config.workers.is_empty() {
        let report = WorkflowValidator::new()
            .with_workers(config.worker_registry().ids())
            .validate(&definition);
        if !report.is_valid() {
            return Err(RuntimeError::Workflow(report.into()).into());
        }
    }

    println!(
        "✔ {}: {} phases, {} tasks, {} criteria, {} rollback steps",
        definition.name,
        definition.phases.len(),
        definition.task_count(),
        definition.criteria.len(),
        definition.rollback_plan.len()
    );
    Ok(ExitStatus::Success)
}

async fn audit(config: RuntimeConfig, run_id: RunId, verify: bool) -> Result<ExitStatus> {
    let records = Runtime::new(config).audit_log(run_id).await?;

    if verify {
        return match verify_chain(&records) {
            Ok(()) => {
                println!("✔ {} records, chain intact", records.len());
                Ok(ExitStatus::Success)
            }
            Err(e) => {
                eprintln!("✘ {e}");
                Ok(ExitStatus::Usage)
            }
        };
    }

    for record in &records {
        println!("{}", serde_json::to_string(record)?);
    }
    Ok(ExitStatus::Success)
}
