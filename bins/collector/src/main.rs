mod backend;
mod cron;
mod events;
mod integrity;
mod module;
mod monitor;
mod runner;
mod scheduler;
mod snapshot;
mod status;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pelo_core::cfg::{self, AppId, Config, JobsConfig};
use pelo_core::extract::SchemaHint;
use pelo_core::fetch::{FetchOptions, RateLimitedFetcher};
use pelo_core::logx;
use pelo_core::recovery::ErrorRecoveryManager;
use pelo_core::store::{open_default, DefaultKv};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::SchedulerEvent;
use crate::integrity::IntegrityMonitor;
use crate::module::{Module, ModuleCtx};
use crate::runner::{Pipeline, ScrapeJob, ScrapeOptions};
use crate::scheduler::DataCollectionScheduler;
use crate::snapshot::SnapshotWriter;

const APP: AppId = AppId {
    qualifier: "com",
    organization: "pelotoniq",
    application: env!("CARGO_PKG_NAME"),
};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Scheduled cycling data collector")]
struct Cli {
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted.
    Start {
        /// Serve the live status over HTTP (needs the `web-api` feature).
        #[arg(long)]
        status_addr: Option<SocketAddr>,
        /// Seconds between status snapshots.
        #[arg(long, default_value_t = 30)]
        snapshot_secs: u64,
    },
    /// Scrape one target now and print the outcome as JSON.
    Scrape {
        /// race-result, rider-profile or team-roster.
        kind: SchemaHint,
        /// Slug under the site, or an absolute URL.
        target: String,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        retries: Option<u32>,
        #[arg(long)]
        no_robots: bool,
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Do not send the record to the backend.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the last status snapshot written by `start` as JSON.
    Status {
        /// Human-readable summary instead of JSON.
        #[arg(long)]
        text: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut cfg = match cfg::load_or_init(&APP) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: cannot load config: {e:#}", APP.application);
            return ExitCode::FAILURE;
        }
    };
    let ignored = cfg.apply_env_overrides();
    let level = match cli.verbose {
        0 => cfg.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    logx::init_with(&level, cfg.log_format);
    for msg in ignored {
        warn!("{msg}");
    }
    install_panic_hook();

    let rt = match build_runtime() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            return ExitCode::FAILURE;
        }
    };
    match rt.block_on(run(cli.cmd, cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "fatal");
            ExitCode::FAILURE
        }
    }
}

fn install_panic_hook() {
    let default = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!(panic = %info, "fatal panic");
        default(info);
    }));
}

#[cfg(feature = "rt-single")]
fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

#[cfg(not(feature = "rt-single"))]
fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}

async fn run(cmd: Command, mut cfg: Config) -> Result<()> {
    match cmd {
        Command::Start { status_addr, snapshot_secs } => start(cfg, status_addr, snapshot_secs).await,
        Command::Scrape { kind, target, base_url, retries, no_robots, timeout_secs, dry_run } => {
            if let Some(url) = base_url {
                cfg.fetch.base_url = url;
            }
            let svc = Services::open(&cfg)?;
            let opts = ScrapeOptions {
                fetch: FetchOptions {
                    max_retries: retries,
                    check_robots: no_robots.then_some(false),
                    timeout: timeout_secs.map(Duration::from_secs),
                    ..FetchOptions::default()
                },
                dry_run,
                session: Some(Uuid::new_v4().to_string()),
            };
            let outcome = svc.pipeline.scrape(kind, &target, &opts).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Command::Status { text } => {
            let kv = open_default(cfg.resolve_data_dir(&APP)?)?;
            print_status(&kv, text)
        }
    }
}

struct Services {
    kv: DefaultKv,
    recovery: Arc<ErrorRecoveryManager>,
    fetcher: Arc<RateLimitedFetcher>,
    pipeline: Arc<Pipeline>,
}

impl Services {
    fn open(cfg: &Config) -> Result<Self> {
        let data_dir = cfg.resolve_data_dir(&APP)?;
        let kv = open_default(&data_dir).with_context(|| format!("open store at {}", data_dir.display()))?;
        info!(data_dir = %data_dir.display(), "store opened");
        let recovery = Arc::new(ErrorRecoveryManager::new(cfg.recovery.clone(), kv.clone()));
        let fetcher = Arc::new(RateLimitedFetcher::with_reqwest(cfg.fetch.clone())?);
        let sink = backend::sink_from_config(&cfg.backend, recovery.clone())?;
        let pipeline = Arc::new(Pipeline::new(fetcher.clone(), recovery.clone(), sink));
        Ok(Self { kv, recovery, fetcher, pipeline })
    }
}

async fn register_jobs(scheduler: &DataCollectionScheduler, pipeline: &Arc<Pipeline>, jobs: &JobsConfig) -> Result<usize> {
    let mut registered = 0;
    for (name, kind, entry) in [
        ("race-results", SchemaHint::RaceResult, &jobs.race_results),
        ("rider-profiles", SchemaHint::RiderProfile, &jobs.rider_profiles),
        ("team-rosters", SchemaHint::TeamRoster, &jobs.team_rosters),
    ] {
        if !entry.enabled {
            info!(job = name, "job disabled");
            continue;
        }
        if entry.targets.is_empty() {
            warn!(job = name, "no targets configured; not scheduled");
            continue;
        }
        let handler = ScrapeJob::new(pipeline.clone(), kind, entry.targets.clone(), ScrapeOptions::default());
        scheduler
            .schedule(name, &entry.cron, entry.priority, Arc::new(handler))
            .await
            .with_context(|| format!("register {name}"))?;
        registered += 1;
    }
    Ok(registered)
}

async fn start(cfg: Config, status_addr: Option<SocketAddr>, snapshot_secs: u64) -> Result<()> {
    let svc = Services::open(&cfg)?;
    let scheduler = DataCollectionScheduler::new(cfg.scheduler.clone());
    scheduler.subscribe(Arc::new(|e: &SchedulerEvent| debug!(event = ?e, "scheduler event")));

    let registered = register_jobs(&scheduler, &svc.pipeline, &cfg.jobs).await?;
    if registered == 0 {
        warn!("no scrape jobs registered; only housekeeping will run");
    }
    scheduler.start().await?;
    info!(jobs = registered, "{} started", APP.application);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = ModuleCtx {
        kv: svc.kv.clone(),
        scheduler: scheduler.clone(),
        recovery: svc.recovery.clone(),
        fetcher: svc.fetcher.clone(),
        shutdown: shutdown_rx,
    };

    #[cfg_attr(not(feature = "web-api"), allow(unused_mut))]
    let mut modules: Vec<Box<dyn Module>> = vec![
        Box::new(SnapshotWriter::new(Duration::from_secs(snapshot_secs.max(1)))),
        Box::new(IntegrityMonitor::new(Duration::from_secs(cfg.recovery.integrity_check_interval_secs.max(1)))),
    ];
    #[cfg(feature = "web-api")]
    if let Some(addr) = status_addr {
        modules.push(Box::new(status::StatusServer::new(addr)));
    }
    #[cfg(not(feature = "web-api"))]
    if status_addr.is_some() {
        warn!("built without the web-api feature; --status-addr ignored");
    }

    let handles: Vec<_> = modules
        .into_iter()
        .map(|m| {
            let name = m.name();
            info!(module = name, "starting module");
            (name, m.spawn(ctx.clone()))
        })
        .collect();

    shutdown_signal().await?;
    info!("shutdown requested");
    let terminated = scheduler.stop().await;
    if terminated > 0 {
        warn!(terminated, "in-flight executions were terminated");
    }
    let _ = shutdown_tx.send(true);

    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(module = name, error = %format!("{e:#}"), "module exited with error"),
            Err(e) => warn!(module = name, error = %e, "module task panicked"),
        }
    }
    info!("{} stopped", APP.application);
    Ok(())
}

/// Resolves on ctrl-c, or on SIGTERM where signals exist.
#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("listen for SIGTERM")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("listen for ctrl-c")?,
        _ = term.recv() => info!("SIGTERM received"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("listen for ctrl-c")
}

fn print_status(kv: &DefaultKv, text: bool) -> Result<()> {
    let snapshot = snapshot::read_snapshot(kv)?;
    let integrity = integrity::read_report(kv)?;
    if !text {
        println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "scheduler": snapshot, "integrity": integrity }))?);
        return Ok(());
    }
    let Some(s) = snapshot else {
        println!("no status recorded yet");
        return Ok(());
    };
    let taken = s.taken_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into());
    println!("running:        {}", s.running);
    println!("taken at:       {taken}");
    println!("jobs:           {}", s.jobs.join(", "));
    println!("active:         {}", s.active_jobs);
    println!("failed backlog: {}", s.failed_backlog);
    println!(
        "executions:     {} total, {} ok, {} failed, {} timed out",
        s.stats.total_executions, s.stats.successful_executions, s.stats.failed_executions, s.stats.timed_out_executions
    );
    println!("avg duration:   {:.0} ms", s.stats.average_duration_ms);
    println!(
        "requests:       {} sent, {} ok, {} failed, {} retried",
        s.fetch.total_requests, s.fetch.successful, s.fetch.failed, s.fetch.retries
    );
    if let Some(r) = integrity {
        println!("integrity:      {:?} ({} issues, {})", r.overall_status, r.issues_found, r.checked_at.to_rfc3339());
    }
    Ok(())
}
