use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument};

use super::db::{Database, StoreError};
use crate::models::{Change, Upsert};

/// What an apply did to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Row inserted or overwritten
    Upserted,
    /// Upsert older than a delete already applied for the same uri
    Stale,
    Deleted,
    /// Delete for a uri that has no row
    Missing,
}

/// Sole writer of the `status` table.
///
/// Upserts overwrite by arrival order. A stream delete leaves a sequence
/// tombstone so that a replayed create with a lower or equal sequence does
/// not bring the row back.
#[derive(Clone)]
pub struct Materializer {
    conn: Arc<Mutex<Connection>>,
}

impl Materializer {
    pub fn new(db: &Database) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    #[instrument(skip(self, change), fields(uri = change.uri(), seq = ?change.sequence()))]
    pub fn apply(&self, change: &Change) -> Result<ApplyOutcome, StoreError> {
        match change {
            Change::Upsert(upsert) => self.upsert(upsert),
            Change::Delete { uri, sequence } => self.delete(uri, *sequence),
        }
    }

    fn upsert(&self, upsert: &Upsert) -> Result<ApplyOutcome, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if let Some(seq) = upsert.sequence {
            let tombstone: Option<i64> = tx
                .query_row(
                    "SELECT seq FROM status_tombstone WHERE uri = ?1",
                    [&upsert.uri],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(deleted_at) = tombstone {
                if seq <= deleted_at {
                    debug!(deleted_at, "Skipping upsert replayed before its delete");
                    return Ok(ApplyOutcome::Stale);
                }
                tx.execute("DELETE FROM status_tombstone WHERE uri = ?1", [&upsert.uri])?;
            }
        }

        tx.execute(
            r#"
            INSERT INTO status (uri, author_did, status, created_at, indexed_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(uri) DO UPDATE SET
                author_did = excluded.author_did,
                status = excluded.status,
                created_at = excluded.created_at,
                indexed_at = MAX(status.indexed_at, excluded.indexed_at)
            "#,
            params![
                upsert.uri,
                upsert.author_did,
                upsert.fields.status,
                upsert.fields.created_at,
                upsert.indexed_at,
            ],
        )?;
        tx.commit()?;
        Ok(ApplyOutcome::Upserted)
    }

    fn delete(&self, uri: &str, sequence: Option<i64>) -> Result<ApplyOutcome, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let removed = tx.execute("DELETE FROM status WHERE uri = ?1", [uri])?;
        if let Some(seq) = sequence {
            tx.execute(
                r#"
                INSERT INTO status_tombstone (uri, seq) VALUES (?1, ?2)
                ON CONFLICT(uri) DO UPDATE SET seq = MAX(status_tombstone.seq, excluded.seq)
                "#,
                params![uri, seq],
            )?;
        }
        tx.commit()?;

        if removed == 0 {
            debug!("Delete for unknown uri");
            Ok(ApplyOutcome::Missing)
        } else {
            Ok(ApplyOutcome::Deleted)
        }
    }

    /// Drop tombstones that replay can no longer reach.
    pub fn prune_tombstones(&self, below_seq: i64) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let pruned = conn.execute("DELETE FROM status_tombstone WHERE seq < ?1", [below_seq])?;
        Ok(pruned)
    }
}
