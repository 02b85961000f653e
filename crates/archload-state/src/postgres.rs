//! `PostgreSQL`-backed implementation of [`RunLedger`].
//!
//! Uses the sync `postgres` crate with a single `Mutex<Client>` for
//! thread safety. The `postgres` crate manages its own internal tokio
//! runtime, so this works from any thread.

use std::sync::{Mutex, MutexGuard};

use archload_types::dataset::DatasetId;
use archload_types::state::{RunRecord, RunState, RunStats};
use chrono::{SecondsFormat, Utc};
use postgres::{Client, NoTls};

use crate::backend::RunLedger;
use crate::error::{self, StateError};

/// Idempotent DDL for ledger tables (`PostgreSQL` dialect).
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS dataset_runs (
    id BIGSERIAL PRIMARY KEY,
    dataset TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    rows_read BIGINT DEFAULT 0,
    rows_written BIGINT DEFAULT 0,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_dataset_runs_dataset ON dataset_runs (dataset, id);
";

/// `PostgreSQL`-backed run history.
///
/// Create with [`PostgresRunLedger::open`] providing a libpq-style
/// connection string (e.g. `"host=localhost dbname=archload user=postgres"`).
pub struct PostgresRunLedger {
    client: Mutex<Client>,
}

impl PostgresRunLedger {
    /// Connect to a `PostgreSQL` database and initialize ledger tables.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Backend`] if connection or DDL execution fails.
    pub fn open(connstr: &str) -> error::Result<Self> {
        let mut client = Client::connect(connstr, NoTls).map_err(StateError::backend)?;
        client
            .batch_execute(CREATE_TABLES)
            .map_err(StateError::backend)?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Acquire the client lock.
    fn lock_client(&self) -> error::Result<MutexGuard<'_, Client>> {
        self.client.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Current UTC time as ISO-8601 string.
    fn now_iso() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    fn parse_state(raw: &str) -> error::Result<RunState> {
        RunState::parse(raw).ok_or_else(|| StateError::UnknownState(raw.to_string()))
    }
}

impl RunLedger for PostgresRunLedger {
    fn start_run(&self, dataset: &DatasetId) -> error::Result<i64> {
        let mut client = self.lock_client()?;
        let row = client
            .query_one(
                "INSERT INTO dataset_runs (dataset, status, started_at) \
                 VALUES ($1, $2, $3) RETURNING id",
                &[
                    &dataset.as_str(),
                    &RunState::Pending.as_str(),
                    &Self::now_iso(),
                ],
            )
            .map_err(StateError::backend)?;
        Ok(row.get(0))
    }

    fn set_run_state(&self, run_id: i64, state: RunState) -> error::Result<()> {
        let mut client = self.lock_client()?;
        client
            .execute(
                "UPDATE dataset_runs SET status = $1 WHERE id = $2",
                &[&state.as_str(), &run_id],
            )
            .map_err(StateError::backend)?;
        Ok(())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn complete_run(&self, run_id: i64, state: RunState, stats: &RunStats) -> error::Result<()> {
        let mut client = self.lock_client()?;
        client
            .execute(
                "UPDATE dataset_runs SET status = $1, finished_at = $2, \
                 rows_read = $3, rows_written = $4, error_message = $5 \
                 WHERE id = $6",
                &[
                    &state.as_str(),
                    &Self::now_iso(),
                    &(stats.rows_read as i64),
                    &(stats.rows_written as i64),
                    &stats.error_message,
                    &run_id,
                ],
            )
            .map_err(StateError::backend)?;
        Ok(())
    }

    fn latest_run_state(&self, dataset: &DatasetId) -> error::Result<Option<RunState>> {
        let mut client = self.lock_client()?;
        let rows = client
            .query(
                "SELECT status FROM dataset_runs WHERE dataset = $1 ORDER BY id DESC LIMIT 1",
                &[&dataset.as_str()],
            )
            .map_err(|e| StateError::backend_context("latest_run_state", e))?;

        match rows.first() {
            Some(row) => {
                let raw: String = row.get(0);
                Self::parse_state(&raw).map(Some)
            }
            None => Ok(None),
        }
    }

    fn recent_runs(&self, limit: usize) -> error::Result<Vec<RunRecord>> {
        let mut client = self.lock_client()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = client
            .query(
                "SELECT id, dataset, status, started_at, finished_at, rows_read, rows_written, \
                 error_message FROM dataset_runs ORDER BY id DESC LIMIT $1",
                &[&limit],
            )
            .map_err(|e| StateError::backend_context("recent_runs", e))?;

        rows.iter()
            .map(|row| {
                let dataset: String = row.get(1);
                let status: String = row.get(2);
                let read: Option<i64> = row.get(5);
                let written: Option<i64> = row.get(6);
                Ok(RunRecord {
                    run_id: row.get(0),
                    dataset: DatasetId::new(dataset),
                    state: Self::parse_state(&status)?,
                    started_at: row.get(3),
                    finished_at: row.get(4),
                    stats: RunStats {
                        rows_read: u64::try_from(read.unwrap_or_default()).unwrap_or_default(),
                        rows_written: u64::try_from(written.unwrap_or_default())
                            .unwrap_or_default(),
                        error_message: row.get(7),
                    },
                })
            })
            .collect()
    }
}
