use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// SQLite handle shared by the materializer, the cursor store and the
/// read queries.
///
/// The connection itself stays crate-private: writes to the `status` table go
/// through [`Materializer`](super::Materializer) only.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        info!(path = %path.display(), "Opened status cache");
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS status (
                uri TEXT PRIMARY KEY,
                author_did TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                indexed_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_status_indexed_at ON status(indexed_at);
            CREATE INDEX IF NOT EXISTS idx_status_author ON status(author_did, indexed_at);

            CREATE TABLE IF NOT EXISTS status_tombstone (
                uri TEXT PRIMARY KEY,
                seq INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cursor (
                stream TEXT PRIMARY KEY,
                seq INTEGER NOT NULL
            );
            "#,
        )
        .context("Failed to initialize schema")?;
        Ok(())
    }

    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}
