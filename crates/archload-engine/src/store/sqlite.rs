use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use pg_escape::quote_identifier;
use rusqlite::Connection;

use super::{DestinationStore, StoreError, StoreSession};

/// Bundled `SQLite` allows 32766 bound variables per statement.
const SQLITE_MAX_PARAMETERS: usize = 32_766;

/// `SQLite` destination. Sessions are serialized behind one connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    location: String,
}

impl SqliteStore {
    /// Open or create a database file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or database cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        Ok(Self {
            conn: Mutex::new(conn),
            location: PathBuf::from(path).display().to_string(),
        })
    }

    /// In-memory database, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if `SQLite` cannot allocate the database.
    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            location: ":memory:".to_string(),
        })
    }
}

#[cfg(test)]
impl SqliteStore {
    /// Run a read query, returning every column of every row as text.
    pub(crate) fn query_rows(&self, sql: &str) -> Vec<Vec<Option<String>>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql).unwrap();
        let width = stmt.column_count();
        let rows = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get::<_, Option<String>>(i))
                    .collect::<Result<Vec<_>, _>>()
            })
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        rows
    }
}

impl DestinationStore for SqliteStore {
    fn session(&self) -> Result<Box<dyn StoreSession + '_>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(Box::new(SqliteSession {
            conn,
            in_transaction: false,
        }))
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.location)
    }
}

struct SqliteSession<'a> {
    conn: MutexGuard<'a, Connection>,
    in_transaction: bool,
}

impl StoreSession for SqliteSession<'_> {
    fn execute(&mut self, sql: &str, params: &[&str]) -> Result<u64, StoreError> {
        let changed = self
            .conn
            .execute(sql, rusqlite::params_from_iter(params.iter().copied()))?;
        Ok(changed as u64)
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.in_transaction = false;
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.in_transaction = false;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn table_columns(&mut self, table: &str) -> Result<Option<Vec<String>>, StoreError> {
        let sql = format!("PRAGMA table_info({})", quote_identifier(table));
        let mut stmt = self.conn.prepare(&sql)?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(if columns.is_empty() { None } else { Some(columns) })
    }

    fn placeholder(&self, n: usize) -> String {
        format!("?{n}")
    }

    fn max_parameters(&self) -> usize {
        SQLITE_MAX_PARAMETERS
    }
}

impl Drop for SqliteSession<'_> {
    fn drop(&mut self) {
        if self.in_transaction && !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, "Rollback of abandoned sqlite transaction failed");
            }
        }
    }
}
