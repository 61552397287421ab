use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use foreman::checkpoint::{CheckpointStore, FileCheckpointStore};
use foreman::config::Config;
use foreman::core::{DependencyAnalyzer, TaskId};
use foreman::hosts::{GitHost, VersionControlHost};
use foreman::isolation::IsolationManager;
use foreman::orchestration::{Coordinator, ResultAggregator};
use foreman::report::BatchReport;
use foreman::{batch, Result};

/// Foreman - dependency-aware batch task coordinator
#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    FOREMAN_DEBUG=1  Enable debug logging (alternative to --debug)\n    RUST_LOG         Override the log filter"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.foreman/foreman.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.foreman/foreman.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a batch of tasks (JSON or TOML)
    Run {
        batch: PathBuf,

        /// Maximum tasks in progress at once
        #[arg(short = 'j', long)]
        jobs: Option<usize>,

        /// Write the JSON report here instead of stdout
        #[arg(long)]
        report: Option<PathBuf>,

        /// Treat an already-missing workspace on release as an error
        #[arg(long)]
        strict: bool,

        /// Branch finished tasks are integrated into
        #[arg(long)]
        target: Option<String>,
    },

    /// Show conflict components and execution order without running
    Analyze { batch: PathBuf },

    /// List stored checkpoints
    Status,

    /// Report orphaned execution contexts
    Cleanup {
        /// Actually delete orphans (default: just report)
        #[arg(long)]
        delete: bool,

        /// Contexts belonging to this batch's tasks are not orphans
        #[arg(long)]
        batch: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    foreman::log::init(cli.debug);
    if foreman::log::is_debug() {
        if let Some(path) = foreman::log::log_path() {
            eprintln!("Debug log: {}", path.display());
        }
    }

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, kind = %e.kind(), "Command failed");
            eprintln!("Error: {}", e);
            ExitCode::from(2)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> Result<u8> {
    let mut config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Run {
            batch,
            jobs,
            report,
            strict,
            target,
        } => {
            if let Some(jobs) = jobs {
                config.scheduler.max_concurrent = Some(jobs);
            }
            if strict {
                config.isolation.strict = true;
            }
            if let Some(target) = target {
                config.integration.target_branch = target;
            }
            config.validate()?;
            run_batch(config, &batch, report.as_deref())
        }
        Command::Analyze { batch } => run_analyze(&batch),
        Command::Status => run_status(&config),
        Command::Cleanup { delete, batch } => run_cleanup(&config, delete, batch.as_deref()),
    }
}

fn open_host(config: &Config) -> Result<Arc<dyn VersionControlHost>> {
    let repo = config.integration.repository()?;
    Ok(Arc::new(GitHost::open(&repo)?))
}

fn open_isolation(config: &Config, host: Arc<dyn VersionControlHost>) -> Result<IsolationManager> {
    IsolationManager::new(&config.isolation, config.isolation.workspace_root()?, host)
}

fn run_batch(config: Config, path: &Path, report_path: Option<&Path>) -> Result<u8> {
    let batch = batch::load(path)?;
    info!(batch = %path.display(), tasks = batch.len(), "Run command");

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(async {
        let host = open_host(&config)?;
        let isolation = Arc::new(open_isolation(&config, host.clone())?);
        let aggregator = Arc::new(ResultAggregator::new(
            host,
            config.integration.target_branch.clone(),
        ));
        let store = Arc::new(FileCheckpointStore::new(config.checkpoints.dir()?));
        let coordinator = Coordinator::new(&config, isolation, aggregator, store);

        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling batch");
                eprintln!("Cancelling: tasks stop at their next phase boundary");
                on_signal.cancel();
            }
        });

        coordinator.run(&batch, cancel).await
    });

    let report = match outcome {
        Ok(report) => report,
        Err(e) => {
            if let Some(partial) = e.partial_report() {
                emit_report(partial, report_path)?;
            }
            return Err(e);
        }
    };
    emit_report(&report, report_path)?;
    Ok(report.exit_code())
}

fn emit_report(report: &BatchReport, report_path: Option<&Path>) -> Result<()> {
    match report_path {
        Some(path) => {
            report.write_to(path)?;
            print_summary(report);
            println!("Report written to {}", path.display());
        }
        None => println!("{}", report.to_json()?),
    }
    Ok(())
}

fn print_summary(report: &BatchReport) {
    let counts = report.counts();
    println!(
        "{} completed, {} failed, {} blocked, {} abandoned (peak concurrency {}, {} ms)",
        counts.completed,
        counts.failed,
        counts.blocked,
        counts.abandoned,
        report.peak_concurrency,
        report.duration_ms()
    );
    for task in report.tasks.iter().filter(|t| t.status.is_failure()) {
        let kind = task
            .error_kind
            .map(|k| k.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("  {:<24} {:<28} {}", task.task_id, kind, task.status);
    }
}

fn run_analyze(path: &Path) -> Result<u8> {
    let batch = batch::load(path)?;
    let analysis = DependencyAnalyzer::new().analyze(&batch)?;
    let components: Vec<serde_json::Value> = analysis
        .components
        .iter()
        .map(|c| {
            serde_json::json!({
                "index": c.index,
                "sequential": c.is_sequential(),
                "tasks": c.tasks,
                "resources": c.resources,
            })
        })
        .collect();
    let output = serde_json::json!({
        "tasks": analysis.graph.task_count(),
        "edges": analysis.graph.dependency_count(),
        "components": components,
        "order": analysis.order,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(0)
}

fn run_status(config: &Config) -> Result<u8> {
    let store = FileCheckpointStore::new(config.checkpoints.dir()?);
    let rt = tokio::runtime::Runtime::new()?;
    let checkpoints = rt.block_on(store.list())?;

    if checkpoints.is_empty() {
        println!("No stored checkpoints in {}", store.dir().display());
        return Ok(0);
    }
    println!("{:<28} {:<16} {:>7}  WRITTEN", "TASK", "LAST PHASE", "ATTEMPT");
    for checkpoint in &checkpoints {
        let last = checkpoint
            .last_completed
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<28} {:<16} {:>7}  {}",
            checkpoint.task_id,
            last,
            checkpoint.attempt,
            checkpoint.written_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(0)
}

fn run_cleanup(config: &Config, delete: bool, batch_path: Option<&Path>) -> Result<u8> {
    let known: HashSet<TaskId> = match batch_path {
        Some(path) => batch::load(path)?.tasks.into_iter().map(|t| t.id).collect(),
        None => HashSet::new(),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let isolation = open_isolation(config, open_host(config)?)?;
        let report = isolation.detect_orphans(&known).await?;

        if report.orphaned.is_empty() {
            println!("No orphaned contexts under {}", isolation.root().display());
            return Ok(0);
        }
        println!("Orphaned contexts ({}):", report.orphaned_count());
        for context in &report.orphaned {
            println!(
                "  {:<28} {:<36} {}",
                context.task_id,
                context.branch,
                context.workspace.display()
            );
        }
        if !delete {
            println!();
            println!("Run with --delete to remove them.");
            return Ok(0);
        }

        let removed = isolation.remove_orphans(&report.orphaned).await;
        println!("Removed {} context(s).", removed.removed_count());
        for (path, reason) in &removed.failed {
            println!("  failed: {}: {}", path.display(), reason);
        }
        Ok(if removed.is_success() { 0 } else { 1 })
    })
}
