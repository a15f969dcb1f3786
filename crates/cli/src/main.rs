//! ldapsync command-line tool.
//!
//! Provides subcommands for running a one-shot synchronization, recording
//! raw protocol traces, replaying traces into the destination, inspecting
//! the destination state, and generating / validating configuration files.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ldapsync_core::config::{AppConfig, SAMPLE_CONFIG};
use ldapsync_core::db::Database;
use ldapsync_core::ldap::{
    EventStream, LdapDirectory, RefreshMode, ReplaySource, Watcher,
};
use ldapsync_core::models::{EntryKind, Event};
use ldapsync_core::store::{Destination, StateStore};
use ldapsync_core::sync_engine::{stored_cookie, Reconciler, SyncOptions, SyncSummary};
use ldapsync_core::trace::{self, CookieFile, TracingSource};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// ldapsync command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "ldapsync",
    version,
    about = "Synchronize LDAP users and groups into a SQL database"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(
        short,
        long,
        global = true,
        default_value = "/etc/ldapsync/config.toml"
    )]
    config: PathBuf,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Decrease log verbosity (repeatable).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    quiet: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one refresh cycle against the directory.
    Synchronize {
        #[command(flatten)]
        flags: SyncFlags,
    },

    /// Record raw directory responses to a trace file.
    Trace {
        /// Trace output file (stdout when absent).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Cookie file to resume from and append to.
        #[arg(long)]
        cookie: Option<PathBuf>,

        /// Keep listening for changes after the refresh phase (default).
        #[arg(long, overrides_with = "no_persist")]
        persist: bool,

        /// Stop after the refresh phase.
        #[arg(long, overrides_with = "persist")]
        no_persist: bool,
    },

    /// Reconcile from a recorded trace instead of a live server.
    Replay {
        /// Trace file to replay.
        trace: PathBuf,

        /// The trace was recorded from an incremental search.
        #[arg(long)]
        incremental: bool,

        /// The trace was recorded in refreshAndPersist mode.
        #[arg(long)]
        persistent: bool,

        #[command(flatten)]
        flags: SyncFlags,
    },

    /// Show the stored cookie and destination row counts.
    Status,

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./ldapsync.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,
}

/// Reconciler policy switches. The last of each pair wins.
#[derive(Args, Debug, Clone, Copy)]
struct SyncFlags {
    /// Commit changes and the cookie (default).
    #[arg(long, overrides_with = "no_persist")]
    persist: bool,

    /// Dry run: roll back every change.
    #[arg(long, overrides_with = "persist")]
    no_persist: bool,

    /// Match destination rows by permanent identifier only.
    #[arg(long, overrides_with = "no_strict")]
    strict: bool,

    /// Also adopt unmatched rows by name (default).
    #[arg(long, overrides_with = "strict")]
    no_strict: bool,

    /// Remove deleted entries from the destination.
    #[arg(long, overrides_with = "no_delete")]
    delete: bool,

    /// Disable deleted entries instead of removing them (default).
    #[arg(long, overrides_with = "delete")]
    no_delete: bool,
}

impl SyncFlags {
    fn options(&self) -> SyncOptions {
        SyncOptions {
            persist: !self.no_persist,
            strict: self.strict,
            delete: self.delete,
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level(cli.verbose, cli.quiet)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Level name for the net verbosity, starting from `info`.
fn log_level(verbose: u8, quiet: u8) -> &'static str {
    const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    let index = (2 + i32::from(verbose) - i32::from(quiet)).clamp(0, 4);
    LEVELS[index as usize]
}

async fn run(cli: Cli) -> Result<()> {
    let path = cli.config;
    match cli.command {
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(&path),
        Commands::Status => cmd_status(&load_config(&path)?),
        Commands::Synchronize { flags } => {
            cmd_synchronize(&load_config(&path)?, flags.options()).await
        }
        Commands::Trace {
            output,
            cookie,
            no_persist,
            ..
        } => {
            let config = load_config(&path)?;
            cmd_trace(&config, output.as_deref(), cookie.as_deref(), !no_persist).await
        }
        Commands::Replay {
            trace,
            incremental,
            persistent,
            flags,
        } => {
            let config = load_config(&path)?;
            cmd_replay(&config, &trace, incremental, persistent, flags.options()).await
        }
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<AppConfig> {
    let mut config =
        AppConfig::load_from_file(path).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn open_database(config: &AppConfig) -> Result<Database> {
    let db = Database::new(&config.database.path).context("failed to open database")?;
    db.initialize().context("failed to initialize database")?;
    Ok(db)
}

async fn connect(config: &AppConfig) -> Result<LdapDirectory> {
    config
        .require_secrets()
        .context("missing LDAP credentials")?;
    LdapDirectory::connect(&config.ldap)
        .await
        .with_context(|| format!("failed to connect to {}", config.ldap.url))
}

fn reconciler<'a>(
    config: &AppConfig,
    db: &'a mut Database,
    options: SyncOptions,
) -> Reconciler<'a, Database> {
    let reconciler = Reconciler::new(db, config.ldap.directory_model(), options);
    match &config.sync.cookie_file {
        Some(path) => reconciler.with_cookie_file(CookieFile::new(path)),
        None => reconciler,
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn cmd_synchronize(config: &AppConfig, options: SyncOptions) -> Result<()> {
    let mut db = open_database(config)?;
    let cookie = stored_cookie(&db).context("failed to read stored cookie")?;
    info!(resume = cookie.is_some(), "starting one-shot synchronization");

    let mut directory = connect(config).await?;
    let mut watcher = directory
        .watch(cookie.as_ref(), RefreshMode::RefreshOnly)
        .await
        .context("failed to start sync search")?;

    let summary = reconciler(config, &mut db, options)
        .synchronize(&mut watcher)
        .await
        .context("synchronization failed")?;
    drop(watcher);
    if let Err(e) = directory.unbind().await {
        tracing::debug!(error = %e, "unbind failed");
    }

    print_summary(&summary, options);
    Ok(())
}

async fn cmd_trace(
    config: &AppConfig,
    output: Option<&Path>,
    cookie_path: Option<&Path>,
    persist: bool,
) -> Result<()> {
    let cookie_file = cookie_path.map(CookieFile::new);
    let cookie = match &cookie_file {
        Some(file) => file.last().context("failed to read cookie file")?,
        None => None,
    };
    let mode = if persist {
        RefreshMode::RefreshAndPersist
    } else {
        RefreshMode::RefreshOnly
    };

    let writer = trace_output(output)?;

    let mut directory = connect(config).await?;
    let search = directory
        .sync_search(cookie.as_ref(), mode)
        .await
        .context("failed to start sync search")?;
    let mut watcher = Watcher::new(
        TracingSource::new(search, writer),
        directory.model().clone(),
        mode,
        cookie.is_some(),
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut events = 0usize;
    loop {
        let next = tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("interrupted");
                break;
            }
            next = watcher.next_event() => next,
        };
        match next.context("trace aborted")? {
            Some(Event::SyncCookie(cookie)) => {
                if let Some(file) = &cookie_file {
                    file.append(&cookie).context("failed to append cookie")?;
                }
                events += 1;
            }
            Some(_) => events += 1,
            None => break,
        }
    }

    let recorded = watcher.into_source().recorded();
    info!(responses = recorded, events, "trace complete");
    Ok(())
}

/// Trace destination: `path` truncated, or stdout.
fn trace_output(path: Option<&Path>) -> Result<Box<dyn Write + Send>> {
    Ok(match path {
        Some(path) => Box::new(
            File::create(path)
                .with_context(|| format!("failed to create trace file {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout()),
    })
}

async fn cmd_replay(
    config: &AppConfig,
    trace_path: &Path,
    incremental: bool,
    persistent: bool,
    options: SyncOptions,
) -> Result<()> {
    let text = std::fs::read_to_string(trace_path)
        .with_context(|| format!("failed to read trace {}", trace_path.display()))?;
    let responses = trace::decode(&text).context("failed to decode trace")?;
    info!(responses = responses.len(), "replaying trace");

    let mode = if persistent {
        RefreshMode::RefreshAndPersist
    } else {
        RefreshMode::RefreshOnly
    };
    let mut watcher = Watcher::new(
        ReplaySource::new(responses),
        config.ldap.directory_model(),
        mode,
        incremental,
    );

    let mut db = open_database(config)?;
    let engine = reconciler(config, &mut db, options);
    let summary = if persistent {
        engine.watch(&mut watcher, shutdown_signal()).await
    } else {
        engine.synchronize(&mut watcher).await
    }
    .context("replay failed")?;

    print_summary(&summary, options);
    Ok(())
}

fn cmd_status(config: &AppConfig) -> Result<()> {
    let db = open_database(config)?;
    let cookie = stored_cookie(&db).context("failed to read stored cookie")?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Item", "Value"]);
    table.add_row(vec![
        Cell::new("Database"),
        Cell::new(config.database.path.display()),
    ]);
    table.add_row(vec![
        Cell::new("Cookie"),
        match cookie {
            Some(cookie) => Cell::new(cookie.to_token()),
            None => Cell::new("none (next run is a full refresh)").fg(comfy_table::Color::Yellow),
        },
    ]);
    for kind in EntryKind::ALL {
        let count = db
            .count(kind)
            .with_context(|| format!("failed to count {kind} rows"))?;
        table.add_row(vec![Cell::new(format!("{kind} rows")), Cell::new(count)]);
    }
    table.add_row(vec![
        Cell::new("State entries"),
        Cell::new(db.state_count().context("failed to count state entries")?),
    ]);

    println!("{table}");
    Ok(())
}

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    let mut file = File::create(output).context("failed to create config file")?;
    file.write_all(SAMPLE_CONFIG.as_bytes())
        .context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit the config file with your directory and database details");
    println!("  2. Set the referenced environment variable (LDAP_PASSWORD)");
    println!(
        "  3. Validate with: ldapsync validate --config {}",
        output.display()
    );
    println!(
        "  4. Run a first refresh: ldapsync synchronize --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    println!("  [OK] Environment variable references processed");

    if let Err(e) = config.validate() {
        println!("  [FAIL] Validation error: {}", e);
        anyhow::bail!("configuration validation failed");
    }
    println!("  [OK] All required fields are valid");

    let model = config.ldap.directory_model();
    println!();
    println!("Configuration summary:");
    println!("  LDAP URL      : {}", config.ldap.url);
    println!("  Search base   : {}", config.ldap.base_dn());
    println!("  Bind          : {:?}", config.ldap.bind);
    println!(
        "  Bind password : {}",
        if config.ldap.bind_password.is_some() {
            "set"
        } else {
            "NOT SET"
        }
    );
    println!("  Flavor        : {}", model.flavor);
    println!("  Search filter : {}", model.search_filter());
    println!("  Database      : {}", config.database.path.display());
    if let Some(ref path) = config.sync.cookie_file {
        println!("  Cookie file   : {}", path.display());
    }
    println!();
    println!("Configuration is valid.");

    Ok(())
}

fn print_summary(summary: &SyncSummary, options: SyncOptions) {
    println!(
        "Synchronization {}:",
        if options.persist { "completed" } else { "dry run completed" }
    );
    println!("  Created   : {}", summary.created);
    println!("  Updated   : {}", summary.updated);
    println!("  Matched   : {}", summary.matched);
    println!("  Unchanged : {}", summary.unchanged);
    if options.delete {
        println!("  Deleted   : {}", summary.deleted);
    } else {
        println!("  Disabled  : {}", summary.disabled);
    }
    println!(
        "  Cookie    : {}",
        summary
            .cookie
            .as_ref()
            .map(|c| c.to_token())
            .unwrap_or_else(|| "none".to_string())
    );
    if let Some(ref started) = summary.started_at {
        println!("  Started at: {}", started);
    }
    if let Some(ref completed) = summary.completed_at {
        println!("  Completed : {}", completed);
    }
}
