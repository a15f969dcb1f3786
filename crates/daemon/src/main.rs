//! ldapsync daemon entry point.
//!
//! Loads configuration, opens the destination database, runs the session
//! scheduler in refreshAndPersist mode, and handles graceful shutdown.

mod scheduler;
mod signals;

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use ldapsync_core::config::AppConfig;
use ldapsync_core::db::Database;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// ldapsync synchronization daemon.
#[derive(Parser, Debug)]
#[command(
    name = "ldapsync-daemon",
    version,
    about = "Continuously synchronize LDAP users and groups into a SQL database"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load and resolve configuration
    let config =
        AppConfig::load_and_resolve(&args.config).context("failed to load configuration file")?;
    config
        .require_secrets()
        .context("missing LDAP credentials")?;

    // Initialize tracing; the guard flushes the file writer on exit.
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    let _guard = init_tracing(log_level, config.daemon.log_file.as_deref())?;

    // Startup banner
    info!("========================================");
    info!("  ldapsync daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", args.config.display());
    info!("LDAP URL      : {}", config.ldap.url);
    info!("Search base   : {}", config.ldap.base_dn());
    info!("Flavor        : {}", config.ldap.flavor);
    info!("Database      : {}", config.database.path.display());
    info!("Strict        : {}", config.sync.strict);
    info!("Delete        : {}", config.sync.delete);
    info!("Log level     : {}", log_level);
    info!("========================================");

    // Initialize database
    let db = Database::new(&config.database.path).context("failed to open database")?;
    db.initialize()
        .context("failed to initialize database schema")?;
    info!("Database initialized at {}", config.database.path.display());

    // Start the scheduler in a background task
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut sched = scheduler::Scheduler::new(config, db);
    let stats = sched.stats();
    let scheduler_handle = tokio::spawn(async move {
        sched.run(shutdown_rx).await;
    });

    // Wait for shutdown signal
    signals::wait_for_shutdown().await;

    info!("Shutdown signal received, stopping...");
    if shutdown_tx.send(true).is_err() {
        warn!("scheduler already stopped");
    }

    // Uncommitted work is rolled back; wait for that (up to 10s)
    match tokio::time::timeout(Duration::from_secs(10), scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped gracefully"),
        Ok(Err(e)) => warn!("scheduler task error: {}", e),
        Err(_) => warn!("scheduler did not stop within 10s, forcing shutdown"),
    }

    info!(
        sessions = stats.total_sessions.load(Ordering::SeqCst),
        commits = stats.total_commits.load(Ordering::SeqCst),
        errors = stats.total_errors.load(Ordering::SeqCst),
        "ldapsync daemon stopped."
    );
    Ok(())
}

/// Install the global subscriber, writing to `log_file` (rotated daily)
/// when set and to stdout otherwise.
fn init_tracing(log_level: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false);

    let Some(path) = log_file else {
        builder.init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = path
        .file_name()
        .with_context(|| format!("log file path has no file name: {}", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;

    let appender = tracing_appender::rolling::daily(dir, prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    builder.with_writer(writer).with_ansi(false).init();
    Ok(Some(guard))
}
