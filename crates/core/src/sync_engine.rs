//! Reconciliation engine: directory events in, destination mutations out.
//!
//! The [`Reconciler`] consumes the watcher's [`Event`] stream and applies
//! each event to a [`Destination`]:
//!
//! 1. `ChangedEntry` upserts the row carrying the entry's permanent
//!    identifier (in guess mode an unmatched row with the same name is
//!    adopted first).
//! 2. `UnchangedSyncIds` only marks identifiers as seen.
//! 3. `DeletedSyncIds` removes (or disables) the named rows.
//! 4. `RefreshComplete { autodelete: true }` sweeps every identified row
//!    not seen during the refresh phase.
//! 5. `SyncCookie` is held until the cycle commits.
//!
//! The cookie is written through the [`StateStore`] inside the same
//! transaction as the row changes, so it is never durable unless the
//! mutations it covers are.

use std::collections::BTreeSet;
use std::future::Future;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::errors::{DatabaseError, SyncError};
use crate::ldap::{DirectoryModel, EventStream};
use crate::models::{Cookie, DirectoryEntry, EntryKind, Event, SyncId};
use crate::schema::{Projection, Schema};
use crate::store::{Destination, DestinationRow, StateStore, COOKIE_KEY};
use crate::trace::CookieFile;

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

/// Per-run policy switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Commit mutations and the cookie; otherwise roll everything back.
    pub persist: bool,
    /// Match rows by permanent identifier only, never by name.
    pub strict: bool,
    /// Remove deleted rows; otherwise only disable them.
    pub delete: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            persist: true,
            strict: false,
            delete: false,
        }
    }
}

/// Statistics from one synchronization run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncSummary {
    pub created: usize,
    pub updated: usize,
    /// Pre-existing rows adopted by name (guess mode).
    pub matched: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub disabled: usize,
    /// Deleted identifiers with no destination row.
    pub missing: usize,
    /// Latest cookie received.
    pub cookie: Option<Cookie>,
    /// Number of successful commits.
    pub commits: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncSummary {
    /// Whether the run changed (or would change) any row.
    pub fn has_changes(&self) -> bool {
        self.created + self.updated + self.matched + self.deleted + self.disabled > 0
    }
}

/// Read the stored resumption cookie.
pub fn stored_cookie<S: StateStore + ?Sized>(store: &S) -> Result<Option<Cookie>, DatabaseError> {
    match store.get_state(COOKIE_KEY)? {
        Some(token) => Cookie::from_token(&token)
            .map(Some)
            .ok_or_else(|| DatabaseError::Corrupt {
                column: COOKIE_KEY.into(),
                detail: format!("undecodable cookie token '{token}'"),
            }),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Applies one event stream to one destination.
pub struct Reconciler<'a, D> {
    dest: &'a mut D,
    model: DirectoryModel,
    users: Schema,
    groups: Schema,
    options: SyncOptions,
    cookie_file: Option<CookieFile>,
    /// Identifiers confirmed present during the current refresh phase.
    seen: BTreeSet<SyncId>,
    refreshing: bool,
    summary: SyncSummary,
}

impl<'a, D> Reconciler<'a, D>
where
    D: Destination + StateStore + Send,
{
    pub fn new(dest: &'a mut D, model: DirectoryModel, options: SyncOptions) -> Self {
        let users = model.schema(EntryKind::User);
        let groups = model.schema(EntryKind::Group);
        Self {
            dest,
            model,
            users,
            groups,
            options,
            cookie_file: None,
            seen: BTreeSet::new(),
            refreshing: true,
            summary: SyncSummary::default(),
        }
    }

    /// Also append each committed cookie to `file`.
    pub fn with_cookie_file(mut self, file: CookieFile) -> Self {
        self.cookie_file = Some(file);
        self
    }

    pub fn summary(&self) -> &SyncSummary {
        &self.summary
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Run one refresh cycle to completion.
    pub async fn synchronize<E: EventStream + Send>(
        mut self,
        events: &mut E,
    ) -> Result<SyncSummary, SyncError> {
        self.start()?;
        let outcome = self.drain(events).await;
        self.settle(outcome)?;
        Ok(self.complete())
    }

    async fn drain<E: EventStream + Send>(&mut self, events: &mut E) -> Result<(), SyncError> {
        while let Some(event) = events.next_event().await? {
            self.apply(event)?;
        }
        self.finish()
    }

    /// Follow a persistent stream until it ends or `shutdown` resolves.
    ///
    /// Commits at the end of the refresh phase and then at every cookie.
    /// Uncommitted work is rolled back on shutdown.
    pub async fn watch<E, F>(mut self, events: &mut E, shutdown: F) -> Result<SyncSummary, SyncError>
    where
        E: EventStream + Send,
        F: Future<Output = ()> + Send,
    {
        self.start()?;
        tokio::pin!(shutdown);
        loop {
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested, discarding uncommitted changes");
                    self.dest.rollback()?;
                    return Ok(self.complete());
                }
                next = events.next_event() => next,
            };
            let step = match next {
                Ok(Some(event)) => {
                    let checkpoint = match event {
                        Event::RefreshComplete { .. } => true,
                        Event::SyncCookie(_) => !self.refreshing,
                        _ => false,
                    };
                    self.apply(event).and_then(|()| {
                        if checkpoint {
                            self.finish()?;
                            self.dest.begin()?;
                        }
                        Ok(())
                    })
                }
                Ok(None) => {
                    let outcome = self.finish();
                    self.settle(outcome)?;
                    return Ok(self.complete());
                }
                Err(e) => Err(e.into()),
            };
            self.settle(step)?;
        }
    }

    // -----------------------------------------------------------------------
    // Transaction handling
    // -----------------------------------------------------------------------

    fn start(&mut self) -> Result<(), SyncError> {
        info!(
            persist = self.options.persist,
            strict = self.options.strict,
            delete = self.options.delete,
            flavor = %self.model.flavor,
            "starting synchronization"
        );
        self.summary.started_at = Some(Utc::now());
        self.dest.begin()?;
        Ok(())
    }

    /// Roll back if `outcome` is an error, keeping the original error.
    fn settle(&mut self, outcome: Result<(), SyncError>) -> Result<(), SyncError> {
        if outcome.is_err() {
            if let Err(e) = self.dest.rollback() {
                warn!(error = %e, "rollback after failure also failed");
            }
        }
        outcome
    }

    /// Commit point: cookie, then commit; or roll back in dry-run mode.
    fn finish(&mut self) -> Result<(), SyncError> {
        if !self.options.persist {
            debug!("dry run, rolling back");
            self.dest.rollback()?;
            return Ok(());
        }
        if let Some(cookie) = &self.summary.cookie {
            self.dest.set_state(COOKIE_KEY, &cookie.to_token())?;
        }
        self.dest.commit()?;
        self.summary.commits += 1;
        debug!(cookie = ?self.summary.cookie.as_ref().map(Cookie::to_token), "committed");

        // The cookie is already durable in the state store.
        if let (Some(file), Some(cookie)) = (&self.cookie_file, &self.summary.cookie) {
            if let Err(e) = file.append(cookie) {
                warn!(path = %file.path().display(), error = %e, "failed to append cookie file");
            }
        }
        Ok(())
    }

    fn complete(mut self) -> SyncSummary {
        self.summary.completed_at = Some(Utc::now());
        let s = &self.summary;
        info!(
            created = s.created,
            updated = s.updated,
            matched = s.matched,
            unchanged = s.unchanged,
            deleted = s.deleted,
            disabled = s.disabled,
            commits = s.commits,
            "synchronization finished"
        );
        self.summary
    }

    // -----------------------------------------------------------------------
    // Event handling
    // -----------------------------------------------------------------------

    /// Apply one event inside the open transaction.
    pub fn apply(&mut self, event: Event) -> Result<(), SyncError> {
        debug!(event = event.label(), "applying event");
        match event {
            Event::ChangedEntry(entry) => self.changed(entry)?,
            Event::UnchangedSyncIds(ids) => {
                self.summary.unchanged += ids.len();
                if self.refreshing {
                    self.seen.extend(ids);
                }
            }
            Event::DeletedSyncIds(ids) => self.deleted(&ids)?,
            Event::RefreshComplete { autodelete } => self.refresh_complete(autodelete)?,
            Event::SyncCookie(cookie) => self.summary.cookie = Some(cookie),
        }
        Ok(())
    }

    fn changed(&mut self, entry: DirectoryEntry) -> Result<(), SyncError> {
        let schema = match entry.kind {
            EntryKind::User => &self.users,
            EntryKind::Group => &self.groups,
        };
        let attributes = schema
            .project(&entry.attrs)
            .map_err(|e| SyncError::InvalidAttribute {
                dn: entry.dn.clone(),
                attribute: e.attribute,
                detail: e.detail,
            })?;
        let key = &self.model.model(entry.kind).key;
        let name = entry.attrs.first_str(key).unwrap_or_default().to_string();
        if self.refreshing {
            self.seen.insert(entry.syncid);
        }

        if let Some(mut row) = self.dest.find_by_syncid(entry.kind, entry.syncid)? {
            if row.name == name && row.attributes == attributes && row.enabled {
                self.summary.unchanged += 1;
                return Ok(());
            }
            if !row.enabled {
                info!(dn = %entry.dn, syncid = %entry.syncid, "re-enabling entry");
            }
            fill(&mut row, entry.syncid, name, attributes);
            self.dest.save(&row)?;
            debug!(dn = %entry.dn, id = row.id, "updated row");
            self.summary.updated += 1;
            return Ok(());
        }

        if !self.options.strict && !name.is_empty() {
            if let Some(mut row) = self.dest.find_unmatched(entry.kind, &name)? {
                info!(dn = %entry.dn, syncid = %entry.syncid, id = row.id, "matched existing row by name");
                fill(&mut row, entry.syncid, name, attributes);
                self.dest.save(&row)?;
                self.summary.matched += 1;
                return Ok(());
            }
        }

        let mut row = self.dest.create(entry.kind)?;
        fill(&mut row, entry.syncid, name, attributes);
        self.dest.save(&row)?;
        debug!(dn = %entry.dn, syncid = %entry.syncid, id = row.id, "created row");
        self.summary.created += 1;
        Ok(())
    }

    fn deleted(&mut self, ids: &BTreeSet<SyncId>) -> Result<(), SyncError> {
        let mut found = BTreeSet::new();
        for kind in EntryKind::ALL {
            for row in self.dest.find_by_syncids(kind, ids, false)? {
                found.extend(row.syncid);
                self.remove(row)?;
            }
        }
        for id in ids.difference(&found) {
            debug!(syncid = %id, "deleted entry has no destination row");
            self.summary.missing += 1;
        }
        for id in ids {
            self.seen.remove(id);
        }
        Ok(())
    }

    fn refresh_complete(&mut self, autodelete: bool) -> Result<(), SyncError> {
        if autodelete {
            let mut swept = 0;
            for kind in EntryKind::ALL {
                for row in self.dest.find_by_syncids(kind, &self.seen, true)? {
                    self.remove(row)?;
                    swept += 1;
                }
            }
            info!(seen = self.seen.len(), swept, "refresh complete, swept unseen rows");
        } else {
            info!(seen = self.seen.len(), "refresh complete");
        }
        self.seen.clear();
        self.refreshing = false;
        Ok(())
    }

    /// Delete or disable a row according to the delete policy.
    fn remove(&mut self, mut row: DestinationRow) -> Result<(), SyncError> {
        if self.options.delete {
            self.dest.delete(&row)?;
            info!(kind = %row.kind, name = %row.name, id = row.id, "deleted row");
            self.summary.deleted += 1;
        } else if row.enabled {
            row.enabled = false;
            row.updated_at = Utc::now();
            self.dest.save(&row)?;
            info!(kind = %row.kind, name = %row.name, id = row.id, "disabled row");
            self.summary.disabled += 1;
        }
        Ok(())
    }
}

fn fill(row: &mut DestinationRow, syncid: SyncId, name: String, attributes: Projection) {
    row.syncid = Some(syncid);
    row.name = name;
    row.attributes = attributes;
    row.enabled = true;
    row.updated_at = Utc::now();
}

/// Run one refresh cycle of `events` against `dest`.
pub async fn synchronize<E, D>(
    events: &mut E,
    dest: &mut D,
    model: &DirectoryModel,
    options: SyncOptions,
) -> Result<SyncSummary, SyncError>
where
    E: EventStream + Send,
    D: Destination + StateStore + Send,
{
    Reconciler::new(dest, model.clone(), options)
        .synchronize(events)
        .await
}

/// Follow a refreshAndPersist stream of `events` until `shutdown`.
pub async fn watch<E, D, F>(
    events: &mut E,
    dest: &mut D,
    model: &DirectoryModel,
    options: SyncOptions,
    shutdown: F,
) -> Result<SyncSummary, SyncError>
where
    E: EventStream + Send,
    D: Destination + StateStore + Send,
    F: Future<Output = ()> + Send,
{
    Reconciler::new(dest, model.clone(), options)
        .watch(events, shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use super::*;
    use crate::errors::WatchError;
    use crate::ldap::Flavor;
    use crate::models::Attributes;
    use crate::store::{FailPoint, MemoryDestination};
    use uuid::Uuid;

    fn id(n: u8) -> SyncId {
        SyncId(Uuid::from_bytes([n; 16]))
    }

    fn model() -> DirectoryModel {
        DirectoryModel::new(Flavor::Rfc4519)
    }

    fn entry(kind: EntryKind, cn: &str, syncid: SyncId, extra: &[(&str, &str)]) -> Event {
        let mut attrs: Attributes = extra
            .iter()
            .map(|(k, v)| (*k, vec![v.as_bytes().to_vec()]))
            .collect();
        attrs.set("cn", vec![cn.as_bytes().to_vec()]);
        Event::ChangedEntry(DirectoryEntry {
            dn: format!("cn={cn},dc=example,dc=com"),
            kind,
            syncid,
            attrs,
        })
    }

    fn user(cn: &str, n: u8) -> Event {
        entry(EntryKind::User, cn, id(n), &[])
    }

    fn group(cn: &str, n: u8, member: &str) -> Event {
        entry(EntryKind::Group, cn, id(n), &[("member", member)])
    }

    fn deleted(ns: &[u8]) -> Event {
        Event::DeletedSyncIds(ns.iter().map(|n| id(*n)).collect())
    }

    fn present(ns: &[u8]) -> Event {
        Event::UnchangedSyncIds(ns.iter().map(|n| id(*n)).collect())
    }

    fn complete(autodelete: bool) -> Event {
        Event::RefreshComplete { autodelete }
    }

    fn cookie(c: &str) -> Event {
        Event::SyncCookie(Cookie::from(c))
    }

    fn opts(persist: bool, strict: bool, delete: bool) -> SyncOptions {
        SyncOptions {
            persist,
            strict,
            delete,
        }
    }

    async fn run(
        dest: &mut MemoryDestination,
        events: Vec<Event>,
        options: SyncOptions,
    ) -> Result<SyncSummary, SyncError> {
        let mut stream: VecDeque<Event> = events.into();
        synchronize(&mut stream, dest, &model(), options).await
    }

    fn names(dest: &MemoryDestination, kind: EntryKind) -> Vec<String> {
        dest.rows(kind).into_iter().map(|r| r.name).collect()
    }

    #[tokio::test]
    async fn test_scenario_create_then_delete() {
        let mut dest = MemoryDestination::new();
        let first = vec![
            user("A", 1),
            group("G", 2, "cn=A,dc=example,dc=com"),
            complete(true),
            cookie("c1"),
        ];
        let summary = run(&mut dest, first.clone(), opts(true, true, true)).await.unwrap();
        assert_eq!(summary.created, 2);
        assert_eq!(summary.commits, 1);
        let users = dest.rows(EntryKind::User);
        let groups = dest.rows(EntryKind::Group);
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].syncid, Some(id(1)));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].syncid, Some(id(2)));
        assert_eq!(
            groups[0].attributes["member"],
            serde_json::json!(["cn=A,dc=example,dc=com"])
        );
        assert_eq!(stored_cookie(&dest).unwrap(), Some(Cookie::from("c1")));

        // G vanishes from the destination out of band.
        let g = dest.rows(EntryKind::Group).remove(0);
        dest.begin().unwrap();
        dest.delete(&g).unwrap();
        dest.commit().unwrap();

        let mut second = first;
        second.insert(2, deleted(&[1]));
        run(&mut dest, second, opts(true, true, true)).await.unwrap();
        assert!(dest.rows(EntryKind::User).is_empty());
        let groups = dest.rows(EntryKind::Group);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].syncid, Some(id(2)));
    }

    #[tokio::test]
    async fn test_idempotent_refresh() {
        let events = vec![
            user("alice", 1),
            user("bob", 2),
            group("staff", 3, "cn=alice,dc=example,dc=com"),
            complete(true),
            cookie("c1"),
        ];
        let mut dest = MemoryDestination::new();
        run(&mut dest, events.clone(), opts(true, true, true)).await.unwrap();
        let once = (dest.rows(EntryKind::User), dest.rows(EntryKind::Group));

        let summary = run(&mut dest, events, opts(true, true, true)).await.unwrap();
        assert!(!summary.has_changes());
        assert_eq!(summary.unchanged, 3);
        assert_eq!((dest.rows(EntryKind::User), dest.rows(EntryKind::Group)), once);
    }

    #[tokio::test]
    async fn test_strict_never_duplicates_or_matches_by_name() {
        let mut dest = MemoryDestination::new();
        dest.insert(EntryKind::User, "alice", None);
        for _ in 0..3 {
            run(&mut dest, vec![user("alice", 1), complete(false)], opts(true, true, true))
                .await
                .unwrap();
        }
        let rows = dest.rows(EntryKind::User);
        assert_eq!(rows.iter().filter(|r| r.syncid == Some(id(1))).count(), 1);
        // The legacy row was neither adopted nor swept.
        assert_eq!(rows.iter().filter(|r| r.syncid.is_none()).count(), 1);
    }

    #[tokio::test]
    async fn test_guess_adopts_unmatched_row() {
        let mut dest = MemoryDestination::new();
        let legacy = dest.insert(EntryKind::User, "alice", None);
        let summary = run(&mut dest, vec![user("alice", 1), complete(false)], opts(true, false, false))
            .await
            .unwrap();
        assert_eq!(summary.matched, 1);
        assert_eq!(summary.created, 0);
        let rows = dest.rows(EntryKind::User);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, legacy.id);
        assert_eq!(rows[0].syncid, Some(id(1)));
    }

    #[tokio::test]
    async fn test_no_delete_only_disables() {
        let mut dest = MemoryDestination::new();
        run(
            &mut dest,
            vec![user("a", 1), user("b", 2), user("c", 3), complete(false)],
            opts(true, true, true),
        )
        .await
        .unwrap();

        let summary = run(
            &mut dest,
            vec![user("a", 1), deleted(&[2]), complete(true)],
            opts(true, true, false),
        )
        .await
        .unwrap();
        assert_eq!(summary.deleted, 0);
        assert_eq!(summary.disabled, 2);
        let rows = dest.rows(EntryKind::User);
        assert_eq!(rows.len(), 3);
        let enabled: Vec<_> = rows.iter().filter(|r| r.enabled).map(|r| r.name.as_str()).collect();
        assert_eq!(enabled, vec!["a"]);

        // Reappearing entries are re-enabled.
        run(&mut dest, vec![user("b", 2), complete(false)], opts(true, true, false))
            .await
            .unwrap();
        assert!(dest.rows(EntryKind::User).iter().find(|r| r.name == "b").unwrap().enabled);
    }

    #[tokio::test]
    async fn test_delete_exactness() {
        let mut dest = MemoryDestination::new();
        let setup = vec![user("a", 1), user("b", 2), user("c", 3), complete(false)];
        run(&mut dest, setup, opts(true, true, true)).await.unwrap();
        dest.insert(EntryKind::User, "legacy", None);

        // Without autodelete only the named identifiers go.
        run(&mut dest, vec![deleted(&[2, 9]), complete(false)], opts(true, true, true))
            .await
            .unwrap();
        assert_eq!(names(&dest, EntryKind::User), vec!["a", "c", "legacy"]);

        // With autodelete exactly the unseen identified rows go.
        let summary = run(&mut dest, vec![present(&[1]), complete(true)], opts(true, true, true))
            .await
            .unwrap();
        assert_eq!(summary.deleted, 1);
        assert_eq!(names(&dest, EntryKind::User), vec!["a", "legacy"]);
    }

    #[tokio::test]
    async fn test_unknown_deleted_id_is_noop() {
        let mut dest = MemoryDestination::new();
        let summary = run(&mut dest, vec![deleted(&[7]), complete(false)], opts(true, true, true))
            .await
            .unwrap();
        assert_eq!(summary.missing, 1);
        assert_eq!(summary.deleted, 0);
    }

    #[tokio::test]
    async fn test_dry_run_discards_everything() {
        let mut dest = MemoryDestination::new();
        let summary = run(
            &mut dest,
            vec![user("a", 1), complete(true), cookie("c1")],
            opts(false, true, true),
        )
        .await
        .unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.commits, 0);
        assert_eq!(dest.count(EntryKind::User).unwrap(), 0);
        assert_eq!(stored_cookie(&dest).unwrap(), None);
        assert!(!dest.in_transaction());
    }

    #[tokio::test]
    async fn test_cookie_failure_rolls_back_and_rerun_converges() {
        let events = vec![user("a", 1), group("g", 2, "cn=a"), complete(true), cookie("c1")];
        let mut reference = MemoryDestination::new();
        run(&mut reference, events.clone(), opts(true, true, true)).await.unwrap();

        for point in [FailPoint::SetState, FailPoint::Commit] {
            let mut dest = MemoryDestination::new();
            dest.fail_at(point);
            let err = run(&mut dest, events.clone(), opts(true, true, true)).await.unwrap_err();
            assert!(matches!(err, SyncError::DatabaseError(_)));
            assert_eq!(dest.count(EntryKind::User).unwrap(), 0);
            assert_eq!(stored_cookie(&dest).unwrap(), None);
            assert!(!dest.in_transaction());

            run(&mut dest, events.clone(), opts(true, true, true)).await.unwrap();
            assert_eq!(names(&dest, EntryKind::User), names(&reference, EntryKind::User));
            assert_eq!(names(&dest, EntryKind::Group), names(&reference, EntryKind::Group));
            assert_eq!(stored_cookie(&dest).unwrap(), Some(Cookie::from("c1")));
        }
    }

    /// Yields its events, then a fatal error.
    struct Failing(VecDeque<Event>);

    impl EventStream for Failing {
        async fn next_event(&mut self) -> Result<Option<Event>, WatchError> {
            match self.0.pop_front() {
                Some(event) => Ok(Some(event)),
                None => Err(WatchError::Protocol("Missing syncStateControl".into())),
            }
        }
    }

    #[tokio::test]
    async fn test_watch_error_aborts_before_cookie() {
        let mut dest = MemoryDestination::new();
        let mut stream = Failing(vec![user("a", 1), cookie("c1")].into());
        let err = synchronize(&mut stream, &mut dest, &model(), opts(true, true, true))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Watch(WatchError::Protocol(_))));
        assert_eq!(dest.count(EntryKind::User).unwrap(), 0);
        assert_eq!(stored_cookie(&dest).unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_attribute_is_reported() {
        let mut dest = MemoryDestination::new();
        let model = DirectoryModel::new(Flavor::Rfc2307);
        let bad = entry(EntryKind::Group, "g", id(1), &[("gidNumber", "lots")]);
        let mut stream: VecDeque<Event> = vec![bad, complete(false)].into();
        let err = synchronize(&mut stream, &mut dest, &model, opts(true, true, true))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::InvalidAttribute { ref attribute, .. } if attribute == "gidNumber"
        ));
        assert!(!dest.in_transaction());
    }

    /// Yields its events, then never completes.
    struct Persistent(VecDeque<Event>);

    impl EventStream for Persistent {
        async fn next_event(&mut self) -> Result<Option<Event>, WatchError> {
            match self.0.pop_front() {
                Some(event) => Ok(Some(event)),
                None => std::future::pending().await,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_commits_at_checkpoints_and_discards_tail() {
        let mut dest = MemoryDestination::new();
        let mut stream = Persistent(
            vec![
                user("a", 1),
                complete(true),
                cookie("c1"),
                user("b", 2),
                cookie("c2"),
                // Applied but never followed by a cookie: rolled back.
                user("c", 3),
            ]
            .into(),
        );
        let summary = Reconciler::new(&mut dest, model(), opts(true, true, true))
            .watch(&mut stream, tokio::time::sleep(Duration::from_secs(1)))
            .await
            .unwrap();

        assert_eq!(summary.created, 3);
        assert_eq!(summary.commits, 3);
        assert_eq!(names(&dest, EntryKind::User), vec!["a", "b"]);
        assert_eq!(stored_cookie(&dest).unwrap(), Some(Cookie::from("c2")));
        assert!(!dest.in_transaction());
    }

    #[tokio::test]
    async fn test_cookie_file_appended_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let file = CookieFile::new(dir.path().join("cookies.txt"));
        let mut dest = MemoryDestination::new();
        let mut stream: VecDeque<Event> = vec![user("a", 1), complete(true), cookie("c1")].into();
        Reconciler::new(&mut dest, model(), opts(true, true, true))
            .with_cookie_file(file.clone())
            .synchronize(&mut stream)
            .await
            .unwrap();
        assert_eq!(file.last().unwrap(), Some(Cookie::from("c1")));
    }

    #[tokio::test]
    async fn test_cookie_file_failure_keeps_commit() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending.
        let file = CookieFile::new(dir.path());
        let mut dest = MemoryDestination::new();
        let mut stream: VecDeque<Event> = vec![user("a", 1), complete(true), cookie("c1")].into();
        let summary = Reconciler::new(&mut dest, model(), opts(true, true, true))
            .with_cookie_file(file)
            .synchronize(&mut stream)
            .await
            .unwrap();
        assert_eq!(summary.commits, 1);
        assert_eq!(stored_cookie(&dest).unwrap(), Some(Cookie::from("c1")));
    }

    #[test]
    fn test_seen_only_tracks_refresh_phase() {
        let mut dest = MemoryDestination::new();
        let mut reconciler = Reconciler::new(&mut dest, model(), opts(true, true, true));
        reconciler.start().unwrap();
        reconciler.apply(user("a", 1)).unwrap();
        assert_eq!(reconciler.seen.len(), 1);

        reconciler.apply(complete(true)).unwrap();
        reconciler.apply(user("b", 2)).unwrap();
        reconciler.apply(present(&[3, 4])).unwrap();
        assert!(reconciler.seen.is_empty());
        assert!(!reconciler.refreshing);
    }
}
