//! Session scheduler: keeps one refreshAndPersist session running and
//! reconnects with exponential backoff when it fails.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info, warn};

use ldapsync_core::config::AppConfig;
use ldapsync_core::db::Database;
use ldapsync_core::ldap::{LdapDirectory, RefreshMode};
use ldapsync_core::sync_engine::{stored_cookie, Reconciler, SyncOptions, SyncSummary};
use ldapsync_core::trace::CookieFile;

/// Tracks aggregate statistics across sessions.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub total_sessions: AtomicU64,
    pub total_commits: AtomicU64,
    pub total_errors: AtomicU64,
    pub consecutive_errors: AtomicU64,
}

/// Exponential reconnect delay, doubling from `initial` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The delay to wait now; the following one doubles.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// The session scheduler.
///
/// Each session connects, resumes from the stored cookie and follows the
/// directory until the server ends the search, an error occurs, or
/// shutdown is requested. Only shutdown ends the loop.
pub struct Scheduler {
    config: AppConfig,
    db: Database,
    backoff: Backoff,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(config: AppConfig, db: Database) -> Self {
        let backoff = Backoff::new(
            Duration::from_secs(config.daemon.retry_initial_secs),
            Duration::from_secs(config.daemon.retry_max_secs),
        );
        Self {
            config,
            db,
            backoff,
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Main scheduler loop; returns once `shutdown` is set.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) {
        info!(
            retry_initial_secs = self.config.daemon.retry_initial_secs,
            retry_max_secs = self.config.daemon.retry_max_secs,
            "scheduler started"
        );

        while !*shutdown.borrow() {
            let session = self.stats.total_sessions.fetch_add(1, Ordering::SeqCst) + 1;
            info!(session, "starting sync session");

            let delay = match self.run_session(shutdown.clone()).await {
                Ok(summary) => {
                    self.stats.consecutive_errors.store(0, Ordering::SeqCst);
                    self.stats
                        .total_commits
                        .fetch_add(summary.commits as u64, Ordering::SeqCst);
                    info!(
                        session,
                        created = summary.created,
                        updated = summary.updated,
                        deleted = summary.deleted,
                        disabled = summary.disabled,
                        commits = summary.commits,
                        "sync session ended"
                    );
                    if *shutdown.borrow() {
                        break;
                    }
                    warn!(session, "server ended the persistent search, reconnecting");
                    self.backoff.next_delay()
                }
                Err(e) => {
                    let errors = self.stats.total_errors.fetch_add(1, Ordering::SeqCst) + 1;
                    let consecutive =
                        self.stats.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                    let delay = self.backoff.next_delay();
                    error!(
                        session,
                        error = %format!("{e:#}"),
                        total_errors = errors,
                        consecutive_errors = consecutive,
                        retry_in_secs = delay.as_secs(),
                        "sync session failed"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = wait_for(shutdown.clone()) => break,
            }
        }

        info!("scheduler stopped");
    }

    /// One connect / resume / follow session.
    async fn run_session(&mut self, shutdown: watch::Receiver<bool>) -> Result<SyncSummary> {
        let cookie = stored_cookie(&self.db).context("failed to read stored cookie")?;
        let mut directory = LdapDirectory::connect(&self.config.ldap)
            .await
            .with_context(|| format!("failed to connect to {}", self.config.ldap.url))?;
        let mut watcher = directory
            .watch(cookie.as_ref(), RefreshMode::RefreshAndPersist)
            .await
            .context("failed to start persistent sync search")?;
        info!(resume = cookie.is_some(), "persistent search started");
        self.backoff.reset();

        let options = SyncOptions {
            persist: true,
            strict: self.config.sync.strict,
            delete: self.config.sync.delete,
        };
        let mut reconciler =
            Reconciler::new(&mut self.db, self.config.ldap.directory_model(), options);
        if let Some(ref path) = self.config.sync.cookie_file {
            reconciler = reconciler.with_cookie_file(CookieFile::new(path));
        }
        let summary = reconciler
            .watch(&mut watcher, wait_for(shutdown))
            .await
            .context("synchronization failed")?;

        drop(watcher);
        if let Err(e) = directory.unbind().await {
            warn!(error = %e, "unbind failed");
        }
        Ok(summary)
    }
}

/// Resolves once the shutdown flag is set or its sender is gone.
async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
