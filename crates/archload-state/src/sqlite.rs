//! `SQLite`-backed implementation of [`RunLedger`].
//!
//! Uses a single `Mutex<Connection>` for thread safety.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use archload_types::dataset::DatasetId;
use archload_types::state::{RunRecord, RunState, RunStats};
use chrono::NaiveDateTime;
use rusqlite::Connection;

use crate::backend::RunLedger;
use crate::error::{self, StateError};

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Idempotent DDL for ledger tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS dataset_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dataset TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    finished_at TEXT,
    rows_read INTEGER DEFAULT 0,
    rows_written INTEGER DEFAULT 0,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_dataset_runs_dataset ON dataset_runs (dataset, id);
";

type RunRow = (i64, String, String, String, Option<String>, i64, i64, Option<String>);

/// `SQLite`-backed run history.
///
/// Create with [`SqliteRunLedger::open`] for file-backed persistence
/// or [`SqliteRunLedger::in_memory`] for tests and one-shot runs.
pub struct SqliteRunLedger {
    conn: Mutex<Connection>,
}

impl SqliteRunLedger {
    /// Open or create a `SQLite` ledger database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Backend`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(StateError::backend)?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(StateError::backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory `SQLite` ledger.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Backend`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StateError::backend)?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(StateError::backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Convert a `SQLite` datetime string to ISO-8601.
    fn sqlite_to_iso8601(raw: &str) -> String {
        NaiveDateTime::parse_from_str(raw, SQLITE_DATETIME_FMT).map_or_else(
            |_| raw.to_string(),
            |ndt| format!("{}Z", ndt.format("%Y-%m-%dT%H:%M:%S")),
        )
    }

    fn parse_state(raw: &str) -> error::Result<RunState> {
        RunState::parse(raw).ok_or_else(|| StateError::UnknownState(raw.to_string()))
    }

    #[cfg(test)]
    fn get_run_row(&self, run_id: i64) -> error::Result<(String, i64, Option<String>)> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT status, rows_written, error_message FROM dataset_runs WHERE id = ?1",
            [run_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(StateError::backend)
    }
}

impl RunLedger for SqliteRunLedger {
    fn start_run(&self, dataset: &DatasetId) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO dataset_runs (dataset, status) VALUES (?1, ?2)",
            rusqlite::params![dataset.as_str(), RunState::Pending.as_str()],
        )
        .map_err(StateError::backend)?;
        Ok(conn.last_insert_rowid())
    }

    fn set_run_state(&self, run_id: i64, state: RunState) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE dataset_runs SET status = ?1 WHERE id = ?2",
            rusqlite::params![state.as_str(), run_id],
        )
        .map_err(StateError::backend)?;
        Ok(())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn complete_run(&self, run_id: i64, state: RunState, stats: &RunStats) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE dataset_runs SET status = ?1, finished_at = datetime('now'), \
             rows_read = ?2, rows_written = ?3, error_message = ?4 \
             WHERE id = ?5",
            rusqlite::params![
                state.as_str(),
                stats.rows_read as i64,
                stats.rows_written as i64,
                stats.error_message,
                run_id,
            ],
        )
        .map_err(StateError::backend)?;
        Ok(())
    }

    fn latest_run_state(&self, dataset: &DatasetId) -> error::Result<Option<RunState>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT status FROM dataset_runs WHERE dataset = ?1 ORDER BY id DESC LIMIT 1",
            [dataset.as_str()],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(raw) => Self::parse_state(&raw).map(Some),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StateError::backend_context("latest_run_state", e)),
        }
    }

    fn recent_runs(&self, limit: usize) -> error::Result<Vec<RunRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, dataset, status, started_at, finished_at, rows_read, rows_written, \
                 error_message FROM dataset_runs ORDER BY id DESC LIMIT ?1",
            )
            .map_err(|e| StateError::backend_context("recent_runs: prepare", e))?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<RunRow> = stmt
            .query_map([limit], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            })
            .map_err(|e| StateError::backend_context("recent_runs: query", e))?
            .collect::<Result<_, _>>()
            .map_err(|e| StateError::backend_context("recent_runs: row", e))?;

        rows.into_iter()
            .map(
                |(run_id, dataset, status, started, finished, read, written, error_message)| {
                    Ok(RunRecord {
                        run_id,
                        dataset: DatasetId::new(dataset),
                        state: Self::parse_state(&status)?,
                        started_at: Self::sqlite_to_iso8601(&started),
                        finished_at: finished.as_deref().map(Self::sqlite_to_iso8601),
                        stats: RunStats {
                            rows_read: u64::try_from(read).unwrap_or_default(),
                            rows_written: u64::try_from(written).unwrap_or_default(),
                            error_message,
                        },
                    })
                },
            )
            .collect()
    }
}
