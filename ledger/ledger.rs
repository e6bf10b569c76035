// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Durable record of backed-up and permanently-ignored events.
//!
//! The schema (see `schema.sql`) has two tables: `events` (one row per event
//! the system has finished with, successfully or not) and `backups` (one row
//! per remote object written for an event; zero rows means the event was
//! ignored rather than backed up). A row existing in `events` at all, with
//! or without `backups` rows, means "do not re-enqueue this event" — callers
//! must not distinguish the two cases except when iterating backups to
//! delete them.
//!
//! All mutating operations serialize through a single [`parking_lot::Mutex`]
//! guarding the connection; SQLite permits concurrent readers, but we don't
//! expose a separate read-only handle since every operation here is cheap.

use std::collections::HashSet;

use base::{bail, err, strutil::human_size, Error};
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};

fn ts_to_f64(ts: jiff::Timestamp) -> f64 {
    ts.as_nanosecond() as f64 / 1_000_000_000.0
}

fn f64_to_ts(secs: f64) -> jiff::Timestamp {
    jiff::Timestamp::from_nanosecond((secs * 1_000_000_000.0).round() as i128)
        .unwrap_or(jiff::Timestamp::UNIX_EPOCH)
}

/// A single remote object a backed-up event was written to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupRecord {
    pub remote: String,
    pub path: String,
}

/// An event past the retention cutoff, with its backup rows. The ledger row
/// itself is not yet gone: the caller must delete every backup remotely
/// first, then call [`Ledger::delete_event`] -- never the reverse, or a
/// crash in between would lose track of an object still sitting in storage.
#[derive(Clone, Debug)]
pub struct ExpiredEvent {
    pub id: String,
    pub backups: Vec<BackupRecord>,
}

pub(crate) fn set_integrity_pragmas(conn: &rusqlite::Connection) -> Result<(), Error> {
    for pragma in ["pragma foreign_keys = on", "pragma synchronous = 1"] {
        conn.execute(pragma, params![])?;
    }
    Ok(())
}

pub struct Ledger {
    conn: Mutex<rusqlite::Connection>,
}

impl Ledger {
    /// Opens (creating if absent) the ledger database at `path`.
    pub fn open(path: &std::path::Path) -> Result<Self, Error> {
        let mut conn = rusqlite::Connection::open(path)?;
        Self::init(&mut conn)?;
        Ok(Ledger {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory ledger, for tests.
    pub fn open_in_memory() -> Result<Self, Error> {
        let mut conn = rusqlite::Connection::open_in_memory()?;
        Self::init(&mut conn)?;
        Ok(Ledger {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &mut rusqlite::Connection) -> Result<(), Error> {
        set_integrity_pragmas(conn)?;
        let tx = conn.transaction()?;
        tx.execute_batch(include_str!("schema.sql"))
            .map_err(|e| err!(e, msg("unable to create ledger schema")))?;
        tx.commit()?;
        Ok(())
    }

    /// Returns whether `id` already has a terminal `events` row (backed up
    /// or ignored).
    pub fn has(&self, id: &str) -> Result<bool, Error> {
        let conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row("select 1 from events where id = ?", params![id], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(exists.is_some())
    }

    /// Returns every event id with a terminal `events` row, for the
    /// reconciler's in-flight-or-done check.
    pub fn all_ids(&self) -> Result<HashSet<String>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("select id from events")?;
        let rows = stmt.query_map(params![], |r| r.get::<_, String>(0))?;
        let mut out = HashSet::new();
        for row in rows {
            out.insert(row?);
        }
        Ok(out)
    }

    /// Records that `id` was backed up to `remote:path`, creating the
    /// `events` row if this is the first (and typically only) remote.
    #[allow(clippy::too_many_arguments)]
    pub fn record_success(
        &self,
        id: &str,
        event_type: &str,
        camera_id: &str,
        start: jiff::Timestamp,
        end: jiff::Timestamp,
        remote: &str,
        path: &str,
    ) -> Result<(), Error> {
        let conn = self.conn.lock();
        conn.execute(
            "insert or ignore into events (id, type, camera_id, start, end)
             values (?, ?, ?, ?, ?)",
            params![id, event_type, camera_id, ts_to_f64(start), ts_to_f64(end)],
        )?;
        conn.execute(
            "insert or replace into backups (id, remote, path) values (?, ?, ?)",
            params![id, remote, path],
        )?;
        Ok(())
    }

    /// Records that `id` will never be backed up (oversized, or exceeded
    /// the download failure tally): an `events` row with no `backups`.
    pub fn record_ignored(
        &self,
        id: &str,
        event_type: &str,
        camera_id: &str,
        start: jiff::Timestamp,
        end: jiff::Timestamp,
    ) -> Result<(), Error> {
        let conn = self.conn.lock();
        conn.execute(
            "insert or ignore into events (id, type, camera_id, start, end)
             values (?, ?, ?, ?, ?)",
            params![id, event_type, camera_id, ts_to_f64(start), ts_to_f64(end)],
        )?;
        Ok(())
    }

    /// Lists every event whose `end` predates `cutoff`, with its backup
    /// rows, without deleting anything. The retention purger deletes the
    /// remote objects first and calls [`Ledger::delete_event`] afterward.
    pub fn expired_before(&self, cutoff: jiff::Timestamp) -> Result<Vec<ExpiredEvent>, Error> {
        let conn = self.conn.lock();
        let mut event_stmt = conn.prepare("select id from events where end < ? order by end asc")?;
        let mut backup_stmt = conn.prepare("select remote, path from backups where id = ?")?;
        let ids = event_stmt
            .query_map(params![ts_to_f64(cutoff)], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut expired = Vec::new();
        for id in ids {
            let backups = backup_stmt
                .query_map(params![id], |r| {
                    Ok(BackupRecord {
                        remote: r.get(0)?,
                        path: r.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            expired.push(ExpiredEvent { id, backups });
        }
        Ok(expired)
    }

    /// Removes a single terminal event row (cascading to its backups). A
    /// no-op if the row is already gone, so a retry after a partial failure
    /// is never an error.
    pub fn delete_event(&self, id: &str) -> Result<(), Error> {
        let conn = self.conn.lock();
        let n = conn.execute("delete from events where id = ?", params![id])?;
        if n > 1 {
            bail!(Internal, msg("expected to delete at most one row for {id}"));
        }
        Ok(())
    }

    /// Total size on disk of the ledger file itself, for startup logging.
    pub fn describe_size(&self) -> String {
        let conn = self.conn.lock();
        let page_count: i64 = conn
            .query_row("pragma page_count", params![], |r| r.get(0))
            .unwrap_or(0);
        let page_size: i64 = conn
            .query_row("pragma page_size", params![], |r| r.get(0))
            .unwrap_or(0);
        human_size((page_count * page_size).max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> jiff::Timestamp {
        jiff::Timestamp::from_second(secs).unwrap()
    }

    #[test]
    fn round_trip_timestamp() {
        let t = ts(1_700_000_000);
        assert_eq!(f64_to_ts(ts_to_f64(t)), t);
    }

    #[test]
    fn unknown_event_not_present() {
        let ledger = Ledger::open_in_memory().unwrap();
        assert!(!ledger.has("a").unwrap());
        assert!(ledger.all_ids().unwrap().is_empty());
    }

    #[test]
    fn record_success_is_queryable_and_idempotent() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger
            .record_success("a", "motion", "cam1", ts(0), ts(5), "remote1", "a.mp4")
            .unwrap();
        assert!(ledger.has("a").unwrap());
        assert_eq!(ledger.all_ids().unwrap().len(), 1);

        // A second call (e.g. a second configured remote) must not fail the
        // unique event-id constraint.
        ledger
            .record_success("a", "motion", "cam1", ts(0), ts(5), "remote2", "a.mp4")
            .unwrap();
        assert_eq!(ledger.all_ids().unwrap().len(), 1);
    }

    #[test]
    fn record_ignored_blocks_future_enqueue_without_a_backup_row() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger
            .record_ignored("bad", "motion", "cam1", ts(0), ts(5))
            .unwrap();
        assert!(ledger.has("bad").unwrap());
    }

    #[test]
    fn expired_before_lists_only_events_older_than_cutoff() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger
            .record_success("old", "motion", "cam1", ts(0), ts(10), "r", "old.mp4")
            .unwrap();
        ledger
            .record_success("new", "motion", "cam1", ts(1_000_000), ts(1_000_010), "r", "new.mp4")
            .unwrap();

        let expired = ledger.expired_before(ts(500_000)).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "old");
        assert_eq!(expired[0].backups, vec![BackupRecord {
            remote: "r".to_string(),
            path: "old.mp4".to_string(),
        }]);

        // Listing never deletes; the row is still there until delete_event.
        assert!(ledger.has("old").unwrap());
        assert!(ledger.has("new").unwrap());

        ledger.delete_event("old").unwrap();
        assert!(!ledger.has("old").unwrap());
        assert!(ledger.has("new").unwrap());
    }

    #[test]
    fn delete_event_is_idempotent() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.delete_event("never-existed").unwrap();
    }

    #[test]
    fn expired_ignored_event_has_no_backups() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger
            .record_ignored("bad", "motion", "cam1", ts(0), ts(10))
            .unwrap();
        let expired = ledger.expired_before(ts(500_000)).unwrap();
        assert_eq!(expired.len(), 1);
        assert!(expired[0].backups.is_empty());
    }
}
