//! [`Destination`] and [`StateStore`] over the SQLite database.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use super::schema::table;
use super::Database;
use crate::errors::DatabaseError;
use crate::models::{EntryKind, SyncId};
use crate::schema::Projection;
use crate::store::{Destination, DestinationRow, StateStore};

const ROW_COLUMNS: &str = "id, syncid, name, enabled, attributes, updated_at";

/// Raw column values of one row, before decoding.
type RawRow = (i64, Option<String>, String, bool, String, String);

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_row(kind: EntryKind, raw: RawRow) -> Result<DestinationRow, DatabaseError> {
    let (id, syncid, name, enabled, attributes, updated_at) = raw;
    let syncid = syncid
        .map(|text| {
            text.parse::<SyncId>().map_err(|e| DatabaseError::Corrupt {
                column: "syncid".into(),
                detail: format!("{text}: {e}"),
            })
        })
        .transpose()?;
    let attributes: Projection = serde_json::from_str(&attributes)?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map_err(|e| DatabaseError::Corrupt {
            column: "updated_at".into(),
            detail: format!("{updated_at}: {e}"),
        })?
        .with_timezone(&Utc);
    Ok(DestinationRow {
        kind,
        id,
        syncid,
        name,
        enabled,
        attributes,
        updated_at,
    })
}

impl Database {
    fn select_rows(
        &self,
        kind: EntryKind,
        clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<DestinationRow>, DatabaseError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM {} WHERE {clause} ORDER BY id",
            table(kind)
        );
        let mut stmt = conn.prepare(&sql)?;
        let raw = stmt
            .query_map(params, read_raw)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(|r| decode_row(kind, r)).collect()
    }

    fn select_one(
        &self,
        kind: EntryKind,
        clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<DestinationRow>, DatabaseError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM {} WHERE {clause} ORDER BY id LIMIT 1",
            table(kind)
        );
        let raw = conn.query_row(&sql, params, read_raw).optional()?;
        raw.map(|r| decode_row(kind, r)).transpose()
    }
}

// ---------------------------------------------------------------------------
// Destination
// ---------------------------------------------------------------------------

impl Destination for Database {
    fn begin(&mut self) -> Result<(), DatabaseError> {
        // IMMEDIATE takes the write lock up front so that concurrent runs
        // serialize on the cookie key.
        self.conn().execute_batch("BEGIN IMMEDIATE")?;
        debug!("transaction started");
        Ok(())
    }

    fn find_by_syncid(
        &self,
        kind: EntryKind,
        syncid: SyncId,
    ) -> Result<Option<DestinationRow>, DatabaseError> {
        self.select_one(kind, "syncid = ?1", &[&syncid.to_string()])
    }

    fn find_by_syncids(
        &self,
        kind: EntryKind,
        syncids: &BTreeSet<SyncId>,
        invert: bool,
    ) -> Result<Vec<DestinationRow>, DatabaseError> {
        if invert {
            // The sweep set is the whole directory; filtering here avoids
            // SQLite's bound-parameter limit.
            let rows = self.select_rows(kind, "syncid IS NOT NULL", &[])?;
            return Ok(rows
                .into_iter()
                .filter(|row| row.syncid.is_some_and(|id| !syncids.contains(&id)))
                .collect());
        }
        let mut rows = Vec::new();
        for syncid in syncids {
            rows.extend(self.find_by_syncid(kind, *syncid)?);
        }
        Ok(rows)
    }

    fn find_unmatched(
        &self,
        kind: EntryKind,
        name: &str,
    ) -> Result<Option<DestinationRow>, DatabaseError> {
        self.select_one(kind, "syncid IS NULL AND name = ?1", &[&name])
    }

    fn create(&mut self, kind: EntryKind) -> Result<DestinationRow, DatabaseError> {
        let row = {
            let conn = self.conn();
            let now = Utc::now();
            conn.execute(
                &format!("INSERT INTO {} (updated_at) VALUES (?1)", table(kind)),
                params![now.to_rfc3339()],
            )?;
            let mut row = DestinationRow::blank(kind, conn.last_insert_rowid());
            row.updated_at = now;
            row
        };
        debug!(%kind, id = row.id, "created row");
        Ok(row)
    }

    fn save(&mut self, row: &DestinationRow) -> Result<(), DatabaseError> {
        let attributes = serde_json::to_string(&row.attributes)?;
        let changed = self.conn().execute(
            &format!(
                "UPDATE {} SET syncid = ?1, name = ?2, enabled = ?3, attributes = ?4, updated_at = ?5
                 WHERE id = ?6",
                table(row.kind)
            ),
            params![
                row.syncid.map(|id| id.to_string()),
                row.name,
                row.enabled,
                attributes,
                row.updated_at.to_rfc3339(),
                row.id,
            ],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: row.kind.to_string(),
                id: row.id.to_string(),
            });
        }
        Ok(())
    }

    fn delete(&mut self, row: &DestinationRow) -> Result<(), DatabaseError> {
        self.conn().execute(
            &format!("DELETE FROM {} WHERE id = ?1", table(row.kind)),
            params![row.id],
        )?;
        debug!(kind = %row.kind, id = row.id, "deleted row");
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DatabaseError> {
        self.conn().execute_batch("COMMIT")?;
        debug!("transaction committed");
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DatabaseError> {
        let conn = self.conn();
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK")?;
            debug!("transaction rolled back");
        }
        Ok(())
    }

    fn count(&self, kind: EntryKind) -> Result<usize, DatabaseError> {
        let count: i64 = self.conn().query_row(
            &format!("SELECT COUNT(*) FROM {}", table(kind)),
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// State store (kv_state)
// ---------------------------------------------------------------------------

impl StateStore for Database {
    fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM kv_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_state(&mut self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        debug!(key, value, "set kv_state");
        Ok(())
    }

    fn delete_state(&mut self, key: &str) -> Result<bool, DatabaseError> {
        let removed = self
            .conn()
            .execute("DELETE FROM kv_state WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    fn state_entries(&self) -> Result<Vec<(String, String)>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT key, value FROM kv_state ORDER BY key")?;
        let entries = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::COOKIE_KEY;
    use uuid::Uuid;

    fn db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn id(n: u8) -> SyncId {
        SyncId(Uuid::from_bytes([n; 16]))
    }

    #[test]
    fn test_create_save_find() {
        let mut db = db();
        let mut row = db.create(EntryKind::User).unwrap();
        row.syncid = Some(id(1));
        row.name = "alice".into();
        row.attributes
            .insert("mail".into(), serde_json::json!(["alice@example.com"]));
        db.save(&row).unwrap();

        let found = db.find_by_syncid(EntryKind::User, id(1)).unwrap().unwrap();
        assert_eq!(found.id, row.id);
        assert_eq!(found.name, "alice");
        assert_eq!(found.attributes["mail"], serde_json::json!(["alice@example.com"]));
        assert!(db.find_by_syncid(EntryKind::Group, id(1)).unwrap().is_none());
    }

    #[test]
    fn test_find_by_syncids_and_unmatched() {
        let mut db = db();
        for (n, name) in [(Some(1u8), "a"), (Some(2), "b"), (None, "legacy")] {
            let mut row = db.create(EntryKind::Group).unwrap();
            row.syncid = n.map(id);
            row.name = name.into();
            db.save(&row).unwrap();
        }
        let seen = BTreeSet::from([id(1), id(9)]);
        let hits = db.find_by_syncids(EntryKind::Group, &seen, false).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "a");
        let missing = db.find_by_syncids(EntryKind::Group, &seen, true).unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].name, "b");

        assert!(db.find_unmatched(EntryKind::Group, "legacy").unwrap().is_some());
        assert!(db.find_unmatched(EntryKind::Group, "a").unwrap().is_none());
    }

    #[test]
    fn test_rollback_discards_rows_and_cookie() {
        let mut db = db();
        db.begin().unwrap();
        db.create(EntryKind::User).unwrap();
        db.set_state(COOKIE_KEY, "c1").unwrap();
        assert!(db.in_transaction());
        db.rollback().unwrap();

        assert_eq!(db.count(EntryKind::User).unwrap(), 0);
        assert_eq!(db.get_state(COOKIE_KEY).unwrap(), None);
        // Rolling back with nothing open is harmless.
        db.rollback().unwrap();
    }

    #[test]
    fn test_commit_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ldapsync.db");
        {
            let mut db = Database::new(&path).unwrap();
            db.initialize().unwrap();
            db.begin().unwrap();
            let row = db.create(EntryKind::User).unwrap();
            db.delete(&row).unwrap();
            db.create(EntryKind::Group).unwrap();
            db.set_state(COOKIE_KEY, "c1").unwrap();
            db.commit().unwrap();
        }
        let db = Database::new(&path).unwrap();
        assert_eq!(db.count(EntryKind::User).unwrap(), 0);
        assert_eq!(db.count(EntryKind::Group).unwrap(), 1);
        assert_eq!(db.get_state(COOKIE_KEY).unwrap().as_deref(), Some("c1"));
    }

    #[test]
    fn test_state_entries_and_delete() {
        let mut db = db();
        db.set_state("b", "2").unwrap();
        db.set_state("a", "1").unwrap();
        db.set_state("a", "3").unwrap();
        assert_eq!(
            db.state_entries().unwrap(),
            vec![("a".into(), "3".into()), ("b".into(), "2".into())]
        );
        assert_eq!(db.state_count().unwrap(), 2);
        assert!(db.delete_state("a").unwrap());
        assert!(!db.delete_state("a").unwrap());
    }

    #[test]
    fn test_duplicate_syncid_rejected() {
        let mut db = db();
        let mut first = db.create(EntryKind::User).unwrap();
        first.syncid = Some(id(1));
        db.save(&first).unwrap();
        let mut second = db.create(EntryKind::User).unwrap();
        second.syncid = Some(id(1));
        assert!(db.save(&second).is_err());
    }
}
