//! Destination and state store contracts, with in-memory implementations.
//!
//! The reconciler talks to the destination only through [`Destination`]
//! and [`StateStore`]. Both traits are synchronous: every call is a short
//! local operation, and a whole refresh cycle is bracketed by
//! [`Destination::begin`] and [`Destination::commit`] (or
//! [`Destination::rollback`]). Writes through the state store take part in
//! the same transaction as destination writes.
//!
//! [`MemoryDestination`] is the transactional in-memory variant used by
//! tests and dry runs; [`crate::db::Database`] is the durable one.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DatabaseError;
use crate::models::{EntryKind, SyncId};
use crate::schema::Projection;

/// State store key under which the resumption cookie is kept.
pub const COOKIE_KEY: &str = "cookie";

// ---------------------------------------------------------------------------
// Destination rows
// ---------------------------------------------------------------------------

/// One user or group row in the destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationRow {
    pub kind: EntryKind,
    /// Native key assigned by the destination.
    pub id: i64,
    /// Permanent identifier of the source entry, once matched.
    pub syncid: Option<SyncId>,
    /// Value of the naming attribute, used for guess matching.
    pub name: String,
    pub enabled: bool,
    pub attributes: Projection,
    pub updated_at: DateTime<Utc>,
}

impl DestinationRow {
    /// A blank row as returned by [`Destination::create`].
    pub fn blank(kind: EntryKind, id: i64) -> Self {
        Self {
            kind,
            id,
            syncid: None,
            name: String::new(),
            enabled: true,
            attributes: Projection::new(),
            updated_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// Destination identity store.
///
/// Invariant: at most one row per permanent identifier per kind.
pub trait Destination {
    /// Open the transaction covering one refresh cycle.
    fn begin(&mut self) -> Result<(), DatabaseError>;

    /// Look up the row of `kind` carrying `syncid`.
    fn find_by_syncid(
        &self,
        kind: EntryKind,
        syncid: SyncId,
    ) -> Result<Option<DestinationRow>, DatabaseError>;

    /// Rows of `kind` whose identifier is in `syncids`, or with `invert`,
    /// rows that carry an identifier outside `syncids`. Rows with no
    /// identifier never match either way.
    fn find_by_syncids(
        &self,
        kind: EntryKind,
        syncids: &BTreeSet<SyncId>,
        invert: bool,
    ) -> Result<Vec<DestinationRow>, DatabaseError>;

    /// A row of `kind` with no identifier whose name is exactly `name`.
    fn find_unmatched(
        &self,
        kind: EntryKind,
        name: &str,
    ) -> Result<Option<DestinationRow>, DatabaseError>;

    /// Insert a blank row and return it.
    fn create(&mut self, kind: EntryKind) -> Result<DestinationRow, DatabaseError>;

    /// Write back every field of `row`.
    fn save(&mut self, row: &DestinationRow) -> Result<(), DatabaseError>;

    fn delete(&mut self, row: &DestinationRow) -> Result<(), DatabaseError>;

    /// Make every change since [`begin`](Self::begin) durable.
    fn commit(&mut self) -> Result<(), DatabaseError>;

    /// Discard every change since [`begin`](Self::begin).
    fn rollback(&mut self) -> Result<(), DatabaseError>;

    /// Number of rows of `kind`.
    fn count(&self, kind: EntryKind) -> Result<usize, DatabaseError>;
}

/// Small string key/value store for synchronization state.
pub trait StateStore {
    fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError>;

    fn set_state(&mut self, key: &str, value: &str) -> Result<(), DatabaseError>;

    /// Remove `key`, returning whether it existed.
    fn delete_state(&mut self, key: &str) -> Result<bool, DatabaseError>;

    /// All entries, ordered by key.
    fn state_entries(&self) -> Result<Vec<(String, String)>, DatabaseError>;

    fn state_count(&self) -> Result<usize, DatabaseError> {
        Ok(self.state_entries()?.len())
    }
}

// ---------------------------------------------------------------------------
// In-memory state store
// ---------------------------------------------------------------------------

/// In-memory [`StateStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStateStore {
    entries: BTreeMap<String, String>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set_state(&mut self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete_state(&mut self, key: &str) -> Result<bool, DatabaseError> {
        Ok(self.entries.remove(key).is_some())
    }

    fn state_entries(&self) -> Result<Vec<(String, String)>, DatabaseError> {
        Ok(self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// In-memory destination
// ---------------------------------------------------------------------------

/// Operation at which a [`MemoryDestination`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// Writing any state store key.
    SetState,
    /// Committing the transaction.
    Commit,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Snapshot {
    rows: BTreeMap<(EntryKind, i64), DestinationRow>,
    state: MemoryStateStore,
    next_id: i64,
}

/// Transactional in-memory destination and state store.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    current: Snapshot,
    /// State at `begin`, restored by `rollback`.
    saved: Option<Snapshot>,
    fail_at: Option<FailPoint>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next operation of the given kind fail once.
    pub fn fail_at(&mut self, point: FailPoint) {
        self.fail_at = Some(point);
    }

    /// Whether a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.saved.is_some()
    }

    /// All rows of `kind`, ordered by native key.
    pub fn rows(&self, kind: EntryKind) -> Vec<DestinationRow> {
        self.current
            .rows
            .values()
            .filter(|row| row.kind == kind)
            .cloned()
            .collect()
    }

    /// Insert a pre-existing row outside any transaction.
    pub fn insert(&mut self, kind: EntryKind, name: &str, syncid: Option<SyncId>) -> DestinationRow {
        self.current.next_id += 1;
        let mut row = DestinationRow::blank(kind, self.current.next_id);
        row.name = name.to_string();
        row.syncid = syncid;
        self.current.rows.insert((kind, row.id), row.clone());
        row
    }

    fn trip(&mut self, point: FailPoint) -> Result<(), DatabaseError> {
        if self.fail_at == Some(point) {
            self.fail_at = None;
            return Err(DatabaseError::Store(format!("injected failure at {point:?}")));
        }
        Ok(())
    }
}

impl Destination for MemoryDestination {
    fn begin(&mut self) -> Result<(), DatabaseError> {
        if self.saved.is_some() {
            return Err(DatabaseError::Store("transaction already open".into()));
        }
        self.saved = Some(self.current.clone());
        Ok(())
    }

    fn find_by_syncid(
        &self,
        kind: EntryKind,
        syncid: SyncId,
    ) -> Result<Option<DestinationRow>, DatabaseError> {
        Ok(self
            .current
            .rows
            .values()
            .find(|row| row.kind == kind && row.syncid == Some(syncid))
            .cloned())
    }

    fn find_by_syncids(
        &self,
        kind: EntryKind,
        syncids: &BTreeSet<SyncId>,
        invert: bool,
    ) -> Result<Vec<DestinationRow>, DatabaseError> {
        Ok(self
            .current
            .rows
            .values()
            .filter(|row| row.kind == kind)
            .filter(|row| match row.syncid {
                Some(id) => syncids.contains(&id) != invert,
                None => false,
            })
            .cloned()
            .collect())
    }

    fn find_unmatched(
        &self,
        kind: EntryKind,
        name: &str,
    ) -> Result<Option<DestinationRow>, DatabaseError> {
        Ok(self
            .current
            .rows
            .values()
            .find(|row| row.kind == kind && row.syncid.is_none() && row.name == name)
            .cloned())
    }

    fn create(&mut self, kind: EntryKind) -> Result<DestinationRow, DatabaseError> {
        self.current.next_id += 1;
        let row = DestinationRow::blank(kind, self.current.next_id);
        self.current.rows.insert((kind, row.id), row.clone());
        Ok(row)
    }

    fn save(&mut self, row: &DestinationRow) -> Result<(), DatabaseError> {
        if let Some(id) = row.syncid {
            let clash = self
                .current
                .rows
                .values()
                .any(|other| other.kind == row.kind && other.id != row.id && other.syncid == Some(id));
            if clash {
                return Err(DatabaseError::Store(format!(
                    "duplicate {} syncid {id}",
                    row.kind
                )));
            }
        }
        match self.current.rows.get_mut(&(row.kind, row.id)) {
            Some(existing) => {
                *existing = row.clone();
                Ok(())
            }
            None => Err(DatabaseError::NotFound {
                entity: row.kind.to_string(),
                id: row.id.to_string(),
            }),
        }
    }

    fn delete(&mut self, row: &DestinationRow) -> Result<(), DatabaseError> {
        self.current.rows.remove(&(row.kind, row.id));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DatabaseError> {
        self.trip(FailPoint::Commit)?;
        if self.saved.take().is_none() {
            return Err(DatabaseError::Store("no transaction open".into()));
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DatabaseError> {
        if let Some(saved) = self.saved.take() {
            self.current = saved;
        }
        Ok(())
    }

    fn count(&self, kind: EntryKind) -> Result<usize, DatabaseError> {
        Ok(self.current.rows.keys().filter(|(k, _)| *k == kind).count())
    }
}

impl StateStore for MemoryDestination {
    fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        self.current.state.get_state(key)
    }

    fn set_state(&mut self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.trip(FailPoint::SetState)?;
        self.current.state.set_state(key, value)
    }

    fn delete_state(&mut self, key: &str) -> Result<bool, DatabaseError> {
        self.current.state.delete_state(key)
    }

    fn state_entries(&self) -> Result<Vec<(String, String)>, DatabaseError> {
        self.current.state.state_entries()
    }
}
