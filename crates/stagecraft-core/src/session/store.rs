//! Pipeline run persistence using SQLite

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::pipeline::{PipelineResult, RunSink};
use crate::{Error, Result};

/// Summary row of a stored run
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub command: Option<String>,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// SQLite-based store of pipeline results
pub struct RunStore {
    conn: Mutex<Connection>,
}

impl RunStore {
    /// Open (or create) the database at `db_path`, creating parent
    /// directories as needed
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::config("Run store connection lock poisoned"))
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                command TEXT,
                success INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                result TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_command ON runs(command)",
            [],
        )?;

        Ok(())
    }

    /// Save a run, replacing any earlier row with the same id
    pub fn save(&self, result: &PipelineResult) -> Result<()> {
        let json = serde_json::to_string(result)?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO runs (id, command, success, started_at, duration_ms, result)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                result.run_id,
                result.command,
                result.success,
                result.started_at.to_rfc3339(),
                result.duration_ms as i64,
                json,
            ],
        )?;
        debug!(run_id = %result.run_id, "Saved pipeline run");
        Ok(())
    }

    /// Load the full result of a run
    pub fn load(&self, run_id: &str) -> Result<Option<PipelineResult>> {
        let conn = self.conn()?;
        let found = conn.query_row(
            "SELECT result FROM runs WHERE id = ?1",
            params![run_id],
            |row| row.get::<_, String>(0),
        );

        match found {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::from(e)),
        }
    }

    /// Runs of a command, newest first
    pub fn list_by_command(&self, command: &str) -> Result<Vec<RunRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, command, success, started_at, duration_ms FROM runs
             WHERE command = ?1 ORDER BY started_at DESC, id DESC",
        )?;

        let rows = stmt.query_map(params![command], record_from_row)?;

        let mut records = Vec::new();
        for record in rows {
            records.push(record?);
        }
        Ok(records)
    }

    /// Delete a run; returns whether a row was removed
    pub fn delete(&self, run_id: &str) -> Result<bool> {
        let affected = self
            .conn()?
            .execute("DELETE FROM runs WHERE id = ?1", params![run_id])?;
        Ok(affected > 0)
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let started_at: String = row.get(3)?;
    let started_at = DateTime::parse_from_rfc3339(&started_at)
        .map_err(|_| rusqlite::Error::InvalidQuery)?
        .with_timezone(&Utc);
    let duration_ms: i64 = row.get(4)?;

    Ok(RunRecord {
        run_id: row.get(0)?,
        command: row.get(1)?,
        success: row.get(2)?,
        started_at,
        duration_ms: duration_ms.max(0) as u64,
    })
}

#[async_trait]
impl RunSink for RunStore {
    async fn record(&self, result: &PipelineResult) -> Result<()> {
        self.save(result)
    }
}
