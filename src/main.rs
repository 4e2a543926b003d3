//! cronbat daemon entry point.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use clap::Parser;
use mimalloc::MiMalloc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cronbat::config::{self, Config};
use cronbat::events::EventBroker;
use cronbat::orchestrator::Orchestrator;
use cronbat::registry::JobRegistry;
use cronbat::runlog;
use cronbat::scheduler::Scheduler;
use cronbat::store::{RunStore, SqliteRunStore};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "cronbat")]
#[command(about = "Cron-style job daemon with durable run history")]
#[command(version)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, env = "CRONBAT_CONFIG", default_value = "cronbat.yaml")]
    config: PathBuf,

    /// Log level when RUST_LOG is unset.
    #[arg(long, env = "CRONBAT_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let cfg = Config::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting cronbat");

    std::fs::create_dir_all(cfg.data_dir())
        .with_context(|| format!("creating data directory {}", cfg.data_dir))?;
    std::fs::create_dir_all(cfg.jobs_dir())
        .with_context(|| format!("creating jobs directory {}", cfg.jobs_dir))?;

    let db_path = cfg.data_dir().join("cronbat.db");
    let store: Arc<dyn RunStore> = Arc::new(
        SqliteRunStore::open(&db_path)
            .await
            .with_context(|| format!("opening run store at {}", db_path.display()))?,
    );
    tracing::info!(path = %db_path.display(), "run store opened");

    let jobs = config::load_jobs(&cfg.jobs_dir())
        .with_context(|| format!("loading jobs from {}", cfg.jobs_dir))?;
    tracing::info!(count = jobs.len(), "jobs loaded");

    let broker = Arc::new(EventBroker::new());

    let run_logs = if cfg.run_logs.is_enabled() {
        let manager = Arc::new(runlog::Manager::new(
            cfg.run_logs_dir(),
            cfg.run_logs.max_bytes_per_stream,
            cfg.run_logs.retention_days,
            cfg.run_logs.max_total_bytes(),
        ));
        std::fs::create_dir_all(manager.base_dir())
            .with_context(|| format!("creating run logs directory {}", cfg.run_logs.dir))?;
        if let Err(err) = manager.cleanup() {
            tracing::warn!(error = %err, "startup run log cleanup failed");
        }
        tracing::info!(
            dir = %cfg.run_logs.dir,
            max_bytes_per_stream = cfg.run_logs.max_bytes_per_stream,
            retention_days = cfg.run_logs.retention_days,
            max_total_mb = cfg.run_logs.max_total_mb,
            "run log storage enabled"
        );
        Some(manager)
    } else {
        tracing::info!("run log storage disabled");
        None
    };

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&broker),
        run_logs.clone(),
    ));

    // The registry holds the scheduler and the scheduler's callback needs
    // the registry, so the callback resolves it through a cell filled once
    // both exist. Nothing fires before `schedule_all` below.
    let registry_cell: Arc<OnceLock<Arc<JobRegistry>>> = Arc::new(OnceLock::new());
    let scheduler = Arc::new(Scheduler::new(
        orchestrator.fire_callback(Arc::clone(&registry_cell)),
    ));
    let registry = Arc::new(JobRegistry::new(
        cfg.jobs_dir(),
        Arc::clone(&scheduler),
        Arc::clone(&broker),
        jobs,
    ));
    registry_cell.set(Arc::clone(&registry)).ok();

    registry.schedule_all();
    scheduler.start();

    // Periodic run-log cleanup, scoped to the shutdown signal.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut cleanup_task = None;
    if let Some(manager) = run_logs {
        cleanup_task = Some(tokio::spawn(runlog::run_cleanup_loop(
            manager,
            cfg.run_logs.cleanup_interval_duration(),
            shutdown_rx,
        )));
    }

    tracing::info!(jobs_dir = %cfg.jobs_dir, "cronbat started");
    shutdown_signal().await;
    tracing::info!("shutting down");

    // Cancel the cleanup ticker, then stop the scheduler; in-flight runs are
    // left to finish on their own.
    let _ = shutdown_tx.send(true);
    if let Some(task) = cleanup_task {
        let _ = task.await;
    }
    scheduler.stop().await;

    tracing::info!("cronbat stopped");
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM");
        }
    }
}
