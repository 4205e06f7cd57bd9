//! Stimforge command-line entry point.
//!
//! Runs or resumes a batch from a unit manifest, reports per-unit status,
//! re-runs single stages and estimates the remaining cost of a batch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stimforge::config::{PipelineConfig, UnitManifest};
use stimforge::context::PipelineContext;
use stimforge::core::{StageId, StimulusUnit};
use stimforge::events::LoggingEventSink;
use stimforge::pipeline::{plan_batch, Orchestrator};
use stimforge::providers::Services;
use stimforge::store::{FsArtifactStore, FsStateStore, StateStore};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for stimforge
#[derive(Parser, Debug)]
#[command(name = "stimforge")]
#[command(about = "Orchestrator for paired Pain/Control stimulus videos")]
#[command(version)]
struct Cli {
    /// Pipeline configuration file (TOML)
    #[arg(long, global = true, env = "STIMFORGE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding unit records and artifacts
    #[arg(long, global = true, default_value = "stimforge-state", env = "STIMFORGE_STATE_DIR")]
    state_dir: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or resume every unit of a manifest and run the batch
    Run {
        /// Unit manifest (TOML)
        #[arg(long)]
        manifest: PathBuf,

        /// Overrides concurrency.max_in_flight
        #[arg(long)]
        max_concurrency: Option<usize>,
    },
    /// Show per-stage status of persisted units
    Status {
        /// Only this unit
        #[arg(long)]
        unit: Option<String>,
    },
    /// Reset one stage and its downstream stages, then drive the unit
    Rerun {
        /// Unit id
        #[arg(long)]
        unit: String,

        /// Stage name, e.g. master-anchor
        #[arg(long)]
        stage: StageId,

        /// Also regenerate a stage that is already done
        #[arg(long)]
        force: bool,

        /// Unit manifest whose entry refreshes the mask source first
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Count the external calls still required and their estimated cost
    Plan {
        /// Unit manifest (TOML)
        #[arg(long)]
        manifest: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "stimforge=info".into());
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => {
            let config = PipelineConfig::default();
            config.validate().context("Invalid default configuration")?;
            Ok(config)
        }
    }
}

fn load_manifest(path: &Path) -> Result<UnitManifest> {
    UnitManifest::load(path).with_context(|| format!("Failed to load manifest {}", path.display()))
}

/// Wires the HTTP services and file stores into an orchestrator whose batch
/// token is cancelled on Ctrl+C.
fn build_orchestrator(state_dir: &Path, config: PipelineConfig) -> Result<Arc<Orchestrator>> {
    let services = Services::from_env(config.concurrency.call_timeout())
        .context("Failed to configure external services")?;
    let artifacts = Arc::new(FsArtifactStore::new(state_dir));
    let state = Arc::new(FsStateStore::new(state_dir));
    let pipeline = Arc::new(
        PipelineContext::new(Arc::new(config), services, artifacts)
            .with_sink(Arc::new(LoggingEventSink::default())),
    );
    let orchestrator = Arc::new(
        Orchestrator::new(pipeline, state).context("Failed to initialize orchestrator")?,
    );

    let token = orchestrator.cancellation().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, finishing in-flight calls");
            token.cancel("interrupted by operator");
        }
    });
    Ok(orchestrator)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize output")?);
    Ok(())
}

fn print_status(unit: &StimulusUnit) {
    println!("{} (seed {})", unit.id, unit.seed);
    for stage in StageId::ALL {
        let record = unit.record(stage);
        let failure = record
            .last_failure
            .as_ref()
            .map(|reason| format!("  last failure: {reason}: {}", reason.message))
            .unwrap_or_default();
        println!(
            "  {:<16} {:<8} attempts={} retries={}{failure}",
            stage.as_str(),
            record.status.label(),
            record.attempts,
            record.retry_count,
        );
    }
}

async fn run(cli: &Cli, manifest: &Path, max_concurrency: Option<usize>) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(max) = max_concurrency {
        config = config.with_max_in_flight(max);
    }
    let manifest = load_manifest(manifest)?;
    let default_seed = config.default_seed;
    let orchestrator = build_orchestrator(&cli.state_dir, config)?;

    let mut units = Vec::with_capacity(manifest.units.len());
    for spec in &manifest.units {
        let unit = spec.to_unit(default_seed)?;
        units.push(orchestrator.load_or_create(unit).await?);
    }
    info!(units = units.len(), "Manifest loaded");

    let report = orchestrator.run(units).await?;
    print_json(&report)
}

async fn status(cli: &Cli, unit: Option<&str>) -> Result<()> {
    let state = FsStateStore::new(&cli.state_dir);
    let ids = match unit {
        Some(id) => vec![id.to_string()],
        None => state.list().await?,
    };
    for id in ids {
        let unit = state
            .load(&id)
            .await?
            .with_context(|| format!("Unknown unit '{id}'"))?;
        print_status(&unit);
    }
    Ok(())
}

async fn rerun(
    cli: &Cli,
    unit: &str,
    stage: StageId,
    force: bool,
    manifest: Option<&Path>,
) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let default_seed = config.default_seed;
    let orchestrator = build_orchestrator(&cli.state_dir, config)?;
    if let Some(path) = manifest {
        let manifest = load_manifest(path)?;
        let spec = manifest
            .units
            .iter()
            .find(|spec| spec.id == unit)
            .with_context(|| format!("Unit '{unit}' not in manifest {}", path.display()))?;
        orchestrator.load_or_create(spec.to_unit(default_seed)?).await?;
    }
    let reset = orchestrator.rerun_stage(unit, stage, force).await?;
    let report = orchestrator.run(vec![reset]).await?;
    print_json(&report)
}

async fn plan(cli: &Cli, manifest: &Path) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let manifest = load_manifest(manifest)?;
    let state = FsStateStore::new(&cli.state_dir);

    let mut units = Vec::with_capacity(manifest.units.len());
    for spec in &manifest.units {
        let unit = match state.load(&spec.id).await? {
            Some(unit) => unit,
            None => spec.to_unit(config.default_seed)?,
        };
        units.push(unit);
    }
    print_json(&plan_batch(&units, &config.models))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match &cli.command {
        Command::Run {
            manifest,
            max_concurrency,
        } => run(&cli, manifest, *max_concurrency).await,
        Command::Status { unit } => status(&cli, unit.as_deref()).await,
        Command::Rerun {
            unit,
            stage,
            force,
            manifest,
        } => rerun(&cli, unit, *stage, *force, manifest.as_deref()).await,
        Command::Plan { manifest } => plan(&cli, manifest).await,
    }
}
