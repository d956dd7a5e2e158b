//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use riskwatch_analyzer::{ClaudeAnalyzer, RiskAnalyzer};
use riskwatch_core::{
    JobPatch, JobService, NewJob, RECONCILE_INTERVAL, RunOrchestrator, RunOutcome, Scheduler,
    WebhookNotifier,
};
use riskwatch_fetcher::PageFetcher;
use riskwatch_shared::{
    AppConfig, Job, JobId, JobMode, JobStatus, expand_home, init_config, load_config,
    validate_api_key,
};
use riskwatch_storage::Storage;

use crate::api::{self, AppState};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// riskwatch — scheduled risk monitoring for web pages.
#[derive(Parser)]
#[command(
    name = "riskwatch",
    version,
    about = "Periodically fetch web pages, classify their risk, and notify webhooks on risky content.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Database path (overrides `storage.db_path`).
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

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
    /// Start the HTTP API and the scheduler.
    Serve {
        /// Socket address to bind (overrides `server.bind`).
        #[arg(long)]
        bind: Option<String>,
    },

    /// Manage monitoring jobs directly in the database.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Run one check of a job in the foreground.
    Run {
        /// Job ID.
        job_id: String,
    },

    /// Receive and log webhook deliveries (local testing).
    Listen {
        /// Port to listen on.
        #[arg(long, default_value = "8001")]
        port: u16,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Job management subcommands.
#[derive(Subcommand)]
pub(crate) enum JobsAction {
    /// Create a job.
    Add {
        /// Page URL to monitor.
        url: String,

        /// Seconds between checks (30 to 86400).
        #[arg(short, long, default_value = "300")]
        interval: u32,

        /// Fetch mode: static, dynamic, or auto.
        #[arg(short, long, default_value = "auto")]
        mode: String,

        /// Webhook for risk notifications (defaults to `notifier.default_webhook_url`).
        #[arg(short, long)]
        webhook: Option<String>,
    },
    /// List jobs.
    List {
        /// Only jobs with this status: active or paused.
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one job with its latest runs.
    Show {
        /// Job ID.
        id: String,
    },
    /// Stop scheduling a job.
    Pause {
        /// Job ID.
        id: String,
    },
    /// Resume a paused job.
    Resume {
        /// Job ID.
        id: String,
    },
    /// Delete a job with its runs and state.
    Delete {
        /// Job ID.
        id: String,
    },
    /// List a job's runs, newest first.
    Runs {
        /// Job ID.
        id: String,

        /// Maximum number of runs.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
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
        0 => "riskwatch=info,tower_http=info",
        1 => "riskwatch=debug,tower_http=debug",
        _ => "riskwatch=trace,tower_http=trace",
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
    let db = cli.db;
    match cli.command {
        Command::Serve { bind } => cmd_serve(db.as_deref(), bind).await,
        Command::Jobs { action } => match action {
            JobsAction::Add {
                url,
                interval,
                mode,
                webhook,
            } => cmd_jobs_add(db.as_deref(), url, interval, &mode, webhook).await,
            JobsAction::List { status } => cmd_jobs_list(db.as_deref(), status.as_deref()).await,
            JobsAction::Show { id } => cmd_jobs_show(db.as_deref(), &id).await,
            JobsAction::Pause { id } => {
                cmd_jobs_set_status(db.as_deref(), &id, JobStatus::Paused).await
            }
            JobsAction::Resume { id } => {
                cmd_jobs_set_status(db.as_deref(), &id, JobStatus::Active).await
            }
            JobsAction::Delete { id } => cmd_jobs_delete(db.as_deref(), &id).await,
            JobsAction::Runs { id, limit } => cmd_jobs_runs(db.as_deref(), &id, limit).await,
        },
        Command::Run { job_id } => cmd_run(db.as_deref(), &job_id).await,
        Command::Listen { port } => cmd_listen(port).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

/// `--db` wins over the configured path.
fn resolve_db_path(flag: Option<&Path>, config: &AppConfig) -> Result<PathBuf> {
    match flag {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(expand_home(&config.storage.db_path)?),
    }
}

async fn open_storage(flag: Option<&Path>, config: &AppConfig) -> Result<Arc<Storage>> {
    open_storage_with(flag, config, false).await
}

/// A read-only handle when the database already exists; a missing one is
/// created so inspection commands see an empty schema.
async fn open_storage_with(
    flag: Option<&Path>,
    config: &AppConfig,
    readonly: bool,
) -> Result<Arc<Storage>> {
    let path = resolve_db_path(flag, config)?;
    let storage = if readonly && path.exists() {
        Storage::open_readonly(&path).await
    } else {
        Storage::open(&path).await
    }
    .map_err(|e| eyre!("cannot open database {}: {e}", path.display()))?;
    Ok(Arc::new(storage))
}

/// Job service without a scheduler, for management while no server runs.
async fn offline_jobs(
    flag: Option<&Path>,
    config: &AppConfig,
    readonly: bool,
) -> Result<JobService> {
    let storage = open_storage_with(flag, config, readonly).await?;
    Ok(JobService::new(
        storage,
        None,
        config.notifier.default_webhook_url.clone(),
    ))
}

fn build_orchestrator(
    config: &AppConfig,
    storage: Arc<Storage>,
    analyzer: Arc<dyn RiskAnalyzer>,
) -> Result<RunOrchestrator> {
    let fetcher = Arc::new(PageFetcher::new(&config.fetcher)?);
    let notifier = Arc::new(WebhookNotifier::new(&config.notifier)?);
    Ok(RunOrchestrator::new(storage, fetcher, analyzer, notifier))
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    raw.parse()
        .map_err(|e| eyre!("invalid job id '{raw}': {e}"))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_serve(db: Option<&Path>, bind: Option<String>) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(db, &config).await?;

    let analyzer = Arc::new(ClaudeAnalyzer::from_env(config.analyzer.clone())?);
    let orchestrator = Arc::new(build_orchestrator(&config, storage.clone(), analyzer)?);
    let scheduler = Arc::new(Scheduler::new(orchestrator));
    let scheduled = scheduler.start(&storage).await?;
    scheduler.watch(storage.clone(), RECONCILE_INTERVAL);

    let jobs = Arc::new(JobService::new(
        storage,
        Some(scheduler.clone()),
        config.notifier.default_webhook_url.clone(),
    ));

    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| eyre!("failed to bind {bind}: {e}"))?;

    info!(%bind, scheduled, "serving riskwatch API");
    axum::serve(listener, api::router(AppState { jobs }))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("stopping scheduler");
    scheduler.shutdown().await;
    Ok(())
}

async fn cmd_jobs_add(
    db: Option<&Path>,
    url: String,
    interval_secs: u32,
    mode: &str,
    webhook_url: Option<String>,
) -> Result<()> {
    let config = load_config()?;
    let jobs = offline_jobs(db, &config, false).await?;
    let mode: JobMode = mode.parse()?;

    let job = jobs
        .create(NewJob {
            url,
            interval_secs,
            mode,
            webhook_url,
        })
        .await?;

    println!();
    println!("  Job created.");
    print_job(&job);
    println!(
        "  A running server schedules it within {}s.",
        RECONCILE_INTERVAL.as_secs()
    );
    println!();
    Ok(())
}

async fn cmd_jobs_list(db: Option<&Path>, status: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let jobs = offline_jobs(db, &config, true).await?;
    let status = status.map(str::parse::<JobStatus>).transpose()?;

    let list = jobs.list(status).await?;
    if list.is_empty() {
        println!("No jobs registered. Use `riskwatch jobs add <url>` to create one.");
        return Ok(());
    }

    println!("{:<38} {:<7} {:>8} {:<8} URL", "ID", "STATUS", "INTERVAL", "MODE");
    for job in &list {
        println!(
            "{:<38} {:<7} {:>7}s {:<8} {}",
            job.id, job.status, job.interval_secs, job.mode, job.url
        );
    }
    Ok(())
}

async fn cmd_jobs_show(db: Option<&Path>, id: &str) -> Result<()> {
    let config = load_config()?;
    let jobs = offline_jobs(db, &config, true).await?;
    let id = parse_job_id(id)?;

    let job = jobs.get(&id).await?;
    let runs = jobs.list_runs(&id, 5).await?;

    println!();
    print_job(&job);
    if runs.is_empty() {
        println!("  Runs:     none yet");
    } else {
        println!("  Latest runs:");
        for run in &runs {
            let level = run.risk_level.map(|l| l.to_string()).unwrap_or_else(|| "-".into());
            println!("    {}  {:<9} {:<7} {}", run.started_at, run.status, level, run.id);
        }
    }
    println!();
    Ok(())
}

async fn cmd_jobs_set_status(db: Option<&Path>, id: &str, status: JobStatus) -> Result<()> {
    let config = load_config()?;
    let jobs = offline_jobs(db, &config, false).await?;
    let id = parse_job_id(id)?;

    let job = jobs
        .update(
            &id,
            JobPatch {
                status: Some(status),
                ..JobPatch::default()
            },
        )
        .await?;
    println!("Job {} is now {}.", job.id, job.status);
    Ok(())
}

async fn cmd_jobs_delete(db: Option<&Path>, id: &str) -> Result<()> {
    let config = load_config()?;
    let jobs = offline_jobs(db, &config, false).await?;
    let id = parse_job_id(id)?;

    jobs.delete(&id).await?;
    println!("Deleted job {id}.");
    Ok(())
}

async fn cmd_jobs_runs(db: Option<&Path>, id: &str, limit: u32) -> Result<()> {
    let config = load_config()?;
    let jobs = offline_jobs(db, &config, true).await?;
    let id = parse_job_id(id)?;

    let runs = jobs.list_runs(&id, limit).await?;
    println!("{}", serde_json::to_string_pretty(&runs)?);
    Ok(())
}

async fn cmd_run(db: Option<&Path>, job_id: &str) -> Result<()> {
    let config = load_config()?;
    let api_key = validate_api_key(&config)?;
    let id = parse_job_id(job_id)?;

    let storage = open_storage(db, &config).await?;
    let job = storage
        .get_job(&id)
        .await?
        .ok_or_else(|| eyre!("job not found: {id}"))?;

    let analyzer = Arc::new(ClaudeAnalyzer::new(config.analyzer.clone(), Some(api_key))?);
    let orchestrator = build_orchestrator(&config, storage, analyzer)?;

    let progress = CliProgress::new();
    progress.set_message(format!("Checking {}", job.url));
    let outcome = orchestrator.execute(&id).await;
    progress.finish();

    println!();
    match outcome? {
        RunOutcome::Skipped => {
            println!("  Job {id} is paused; nothing was run.");
        }
        RunOutcome::Succeeded { run_id, risk_level } => {
            println!("  Run succeeded.");
            println!("  Run:    {run_id}");
            println!("  Risk:   {risk_level}");
        }
        RunOutcome::Failed { run_id, error } => {
            println!("  Run failed.");
            println!("  Run:    {run_id}");
            println!("  Error:  {error}");
        }
    }
    println!();
    Ok(())
}

async fn cmd_listen(port: u16) -> Result<()> {
    let addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| eyre!("failed to bind {addr}: {e}"))?;

    info!(%addr, "listening for webhook deliveries");
    axum::serve(listener, api::echo_router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

fn print_job(job: &Job) {
    println!("  ID:       {}", job.id);
    println!("  URL:      {}", job.url);
    println!("  Status:   {}", job.status);
    println!("  Interval: {}s", job.interval_secs);
    println!("  Mode:     {}", job.mode);
    println!(
        "  Webhook:  {}",
        job.webhook_url.as_deref().unwrap_or("(none)")
    );
}

/// Resolves on Ctrl-C.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

// ---------------------------------------------------------------------------
// CLI progress spinner
// ---------------------------------------------------------------------------

/// Foreground spinner shown while a check runs.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .expect("valid progress template")
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn set_message(&self, msg: String) {
        self.spinner.set_message(msg);
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}
