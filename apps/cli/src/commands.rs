//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use regwatch_core::{
    CoordinatorBuilder, FeedbackAggregator, IngestionCoordinator, ProgressReporter,
};
use regwatch_shared::{
    AppConfig, InteractionEvent, InteractionKind, PipelineRun, RunId, RunKind, RunStatus, Stage,
    init_config, load_config, load_config_from,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// regwatch: watch regulators, keep what matters.
#[derive(Parser)]
#[command(
    name = "regwatch",
    version,
    about = "Ingest regulatory announcements, enrich them, and score them per firm profile.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.regwatch/regwatch.toml).
    #[arg(long, global = true, env = "REGWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the pipeline once over every configured source.
    Run {
        /// Ignore the age cutoff and reprocess everything the sources return.
        #[arg(long)]
        full: bool,
    },

    /// Replay one stage (enrich or score) over stored records.
    Backfill {
        /// Stage to replay.
        stage: Stage,

        /// Only records without a valid insight (enrich only).
        #[arg(long)]
        missing_only: bool,
    },

    /// Serve the HTTP control API.
    Serve {
        /// Listen address (defaults to [server].bind).
        #[arg(long)]
        bind: Option<String>,
    },

    /// List recorded runs, newest first.
    Jobs,

    /// Aggregate counters across all runs.
    Stats,

    /// Show one run (the latest by default).
    Status {
        #[arg(long)]
        run_id: Option<RunId>,
    },

    /// Record interactions and fold them into scoring weights.
    Feedback {
        #[command(subcommand)]
        action: FeedbackAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Feedback subcommands.
#[derive(Subcommand)]
pub(crate) enum FeedbackAction {
    /// Record one interaction event.
    Record {
        /// Profile the interaction belongs to.
        #[arg(long)]
        profile: String,

        #[arg(long, value_enum)]
        kind: KindArg,

        #[arg(long)]
        authority: Option<String>,

        /// Theme or sector tag (repeatable).
        #[arg(long = "theme")]
        themes: Vec<String>,

        #[arg(long)]
        persona: Option<String>,

        #[arg(long)]
        workflow_template: Option<String>,
    },
    /// Aggregate interactions recorded since the last pass.
    Aggregate,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum KindArg {
    Pin,
    Dismiss,
    WorkflowStart,
    WorkflowComplete,
    PersonaSwitch,
}

impl From<KindArg> for InteractionKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Pin => Self::Pin,
            KindArg::Dismiss => Self::Dismiss,
            KindArg::WorkflowStart => Self::WorkflowStart,
            KindArg::WorkflowComplete => Self::WorkflowComplete,
            KindArg::PersonaSwitch => Self::PersonaSwitch,
        }
    }
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "regwatch=info",
        1 => "regwatch=debug",
        _ => "regwatch=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Command::Run { full } => {
            let kind = if full { RunKind::Full } else { RunKind::Incremental };
            cmd_run(config_path, kind).await
        }
        Command::Backfill {
            stage,
            missing_only,
        } => {
            cmd_run(
                config_path,
                RunKind::Backfill {
                    stage,
                    missing_only,
                },
            )
            .await
        }
        Command::Serve { bind } => cmd_serve(config_path, bind).await,
        Command::Jobs => cmd_jobs(config_path).await,
        Command::Stats => cmd_stats(config_path).await,
        Command::Status { run_id } => cmd_status(config_path, run_id).await,
        Command::Feedback { action } => match action {
            FeedbackAction::Record {
                profile,
                kind,
                authority,
                themes,
                persona,
                workflow_template,
            } => {
                let mut event = InteractionEvent::new(profile, kind.into(), Utc::now());
                event.authority = authority;
                event.themes = themes;
                event.persona = persona;
                event.workflow_template = workflow_template;
                cmd_feedback_record(config_path, event).await
            }
            FeedbackAction::Aggregate => cmd_feedback_aggregate(config_path).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
    }
}

fn resolve_config(path: Option<PathBuf>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(&path)?,
        None => load_config()?,
    };
    Ok(config)
}

async fn builder(path: Option<PathBuf>) -> Result<CoordinatorBuilder> {
    let config = resolve_config(path)?;
    Ok(IngestionCoordinator::from_config(config).await?)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(path: Option<PathBuf>, kind: RunKind) -> Result<()> {
    let coordinator = builder(path).await?.progress(Arc::new(CliProgress::new())).build();
    info!(?kind, sources = coordinator.config().sources.len(), "starting run");

    let run = coordinator.run(kind).await?;
    print_run(&run);

    match run.status {
        RunStatus::Completed => Ok(()),
        status => Err(eyre!(
            "run {} ended {status}: {}",
            run.run_id,
            run.last_error.as_deref().unwrap_or("no error recorded")
        )),
    }
}

async fn cmd_serve(path: Option<PathBuf>, bind: Option<String>) -> Result<()> {
    let coordinator = builder(path).await?.build();
    let addr = bind.unwrap_or_else(|| coordinator.config().server.bind.clone());
    regwatch_api::serve(coordinator, &addr).await?;
    Ok(())
}

async fn cmd_jobs(path: Option<PathBuf>) -> Result<()> {
    let coordinator = builder(path).await?.build();
    let runs = coordinator.jobs().await?;
    if runs.is_empty() {
        println!("No runs recorded yet.");
        return Ok(());
    }
    for run in &runs {
        let totals = run.totals();
        println!(
            "{}  {:<10} {:<28} {}  new={} updated={} unchanged={} errors={}",
            run.run_id,
            run.status,
            kind_label(&run.kind),
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            totals.new,
            totals.updated,
            totals.unchanged,
            totals.errors,
        );
    }
    Ok(())
}

async fn cmd_stats(path: Option<PathBuf>) -> Result<()> {
    let coordinator = builder(path).await?.build();
    let stats = coordinator.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn cmd_status(path: Option<PathBuf>, run_id: Option<RunId>) -> Result<()> {
    let coordinator = builder(path).await?.build();
    let report = coordinator.status(run_id).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_feedback_record(path: Option<PathBuf>, event: InteractionEvent) -> Result<()> {
    let coordinator = builder(path).await?.build();
    if !coordinator.config().profiles.iter().any(|p| p.id == event.profile_id) {
        return Err(eyre!("unknown profile '{}'", event.profile_id));
    }
    let aggregator = FeedbackAggregator::new(
        coordinator.store().clone(),
        coordinator.config().feedback.clone(),
    );
    let seq = aggregator.record(&event).await?;
    info!(profile = %event.profile_id, kind = ?event.kind, seq, "interaction recorded");
    Ok(())
}

async fn cmd_feedback_aggregate(path: Option<PathBuf>) -> Result<()> {
    let coordinator = builder(path).await?.build();
    let aggregator = FeedbackAggregator::new(
        coordinator.store().clone(),
        coordinator.config().feedback.clone(),
    );
    let report = aggregator.run().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(path: Option<PathBuf>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn kind_label(kind: &RunKind) -> String {
    match kind {
        RunKind::Incremental => "incremental".into(),
        RunKind::Full => "full".into(),
        RunKind::Backfill {
            stage,
            missing_only: true,
        } => format!("backfill:{stage} (missing)"),
        RunKind::Backfill { stage, .. } => format!("backfill:{stage}"),
    }
}

fn print_run(run: &PipelineRun) {
    let elapsed = run.elapsed(Utc::now());
    println!();
    println!("  Run {}  {}", run.run_id, kind_label(&run.kind));
    println!("  Status: {}", run.status);
    for (source, c) in &run.per_source_counts {
        println!(
            "  {source:<12} fetched={:<4} new={:<4} updated={:<4} unchanged={:<4} errors={:<3} enrich_failed={}",
            c.fetched, c.new, c.updated, c.unchanged, c.errors, c.enrichment_failures
        );
    }
    println!("  Time:   {:.1}s", elapsed.num_milliseconds() as f64 / 1000.0);
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, stage: Stage) {
        self.spinner.set_message(stage.to_string());
    }

    fn source_fetched(&self, source: &str, items: usize) {
        self.spinner.set_message(format!("{source}: {items} candidates"));
    }

    fn item_done(&self, source: &str, current: usize, total: usize) {
        self.spinner.set_message(format!("{source} [{current}/{total}]"));
    }

    fn done(&self, _run: &PipelineRun) {
        self.spinner.finish_and_clear();
    }
}
