use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::db::{Database, StoreError};
use crate::constants::CURSOR_WRITE_INTERVAL;

#[derive(Debug, Default)]
struct StreamCheckpoint {
    last_write: Option<Instant>,
    last_offered: Option<i64>,
}

/// Durable stream positions with throttled writes.
///
/// Throttle state is kept per stream name, so independent streams never
/// delay each other's checkpoints.
#[derive(Clone)]
pub struct CursorStore {
    conn: Arc<Mutex<Connection>>,
    interval: Duration,
    checkpoints: Arc<Mutex<HashMap<String, StreamCheckpoint>>>,
}

impl CursorStore {
    pub fn new(db: &Database) -> Self {
        Self::with_interval(db, CURSOR_WRITE_INTERVAL)
    }

    pub fn with_interval(db: &Database, interval: Duration) -> Self {
        Self {
            conn: db.connection(),
            interval,
            checkpoints: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Last durably stored sequence for `stream`.
    pub fn read(&self, stream: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.conn.lock();
        let seq = conn
            .query_row("SELECT seq FROM cursor WHERE stream = ?1", [stream], |row| row.get(0))
            .optional()?;
        Ok(seq)
    }

    /// Persist `seq` if the interval has passed since the last durable write
    /// for `stream`. Returns whether a write happened.
    pub fn write_throttled(&self, stream: &str, seq: i64) -> Result<bool, StoreError> {
        self.write_throttled_at(stream, seq, Instant::now())
    }

    pub(crate) fn write_throttled_at(
        &self,
        stream: &str,
        seq: i64,
        now: Instant,
    ) -> Result<bool, StoreError> {
        {
            let mut checkpoints = self.checkpoints.lock();
            let checkpoint = checkpoints.entry(stream.to_string()).or_default();
            checkpoint.last_offered = Some(seq);
            if let Some(last) = checkpoint.last_write {
                if now.saturating_duration_since(last) < self.interval {
                    return Ok(false);
                }
            }
            checkpoint.last_write = Some(now);
        }

        info!(stream, seq, "Writing cursor");
        if let Err(e) = self.persist(stream, seq) {
            // let the next offer retry instead of waiting a full interval
            if let Some(checkpoint) = self.checkpoints.lock().get_mut(stream) {
                checkpoint.last_write = None;
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Unconditional durable write, used on graceful shutdown.
    pub fn force_write(&self, stream: &str, seq: i64) -> Result<(), StoreError> {
        self.persist(stream, seq)?;
        let mut checkpoints = self.checkpoints.lock();
        let checkpoint = checkpoints.entry(stream.to_string()).or_default();
        checkpoint.last_write = Some(Instant::now());
        checkpoint.last_offered = Some(seq);
        debug!(stream, seq, "Forced cursor write");
        Ok(())
    }

    /// Most recent sequence offered for `stream`, durable or not.
    pub fn last_offered(&self, stream: &str) -> Option<i64> {
        self.checkpoints
            .lock()
            .get(stream)
            .and_then(|checkpoint| checkpoint.last_offered)
    }

    fn persist(&self, stream: &str, seq: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO cursor (stream, seq) VALUES (?1, ?2)
            ON CONFLICT(stream) DO UPDATE SET seq = excluded.seq
            "#,
            params![stream, seq],
        )?;
        Ok(())
    }
}
