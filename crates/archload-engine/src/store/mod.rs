//! Destination store contract and its `SQLite` and Postgres implementations.
//!
//! The loader sees a store only through [`StoreSession`]: statement
//! execution with text parameters, explicit transaction control, and column
//! introspection for schema reconciliation.

mod postgres;
mod sqlite;

use std::sync::Arc;

use crate::config::types::{DestinationConfig, StoreBackendKind};

pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

/// Errors raised by destination stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("postgres: {0}")]
    Postgres(#[from] ::postgres::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("store connection lock poisoned")]
    LockPoisoned,
}

/// A relational store that rows are appended to.
pub trait DestinationStore: Send + Sync {
    /// Open a session. Sessions may block and must be used from a blocking
    /// context (e.g. `spawn_blocking`).
    ///
    /// # Errors
    ///
    /// Returns an error if a connection cannot be obtained.
    fn session(&self) -> Result<Box<dyn StoreSession + '_>, StoreError>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// One connection's worth of statement execution.
///
/// Dropping a session with an open transaction rolls it back.
pub trait StoreSession {
    /// Execute `sql` with positional text parameters, returning rows affected.
    ///
    /// # Errors
    ///
    /// Returns the store's error for the statement.
    fn execute(&mut self, sql: &str, params: &[&str]) -> Result<u64, StoreError>;

    /// # Errors
    ///
    /// Returns an error if a transaction cannot be started.
    fn begin(&mut self) -> Result<(), StoreError>;

    /// # Errors
    ///
    /// Returns an error if the commit fails; the transaction is then gone.
    fn commit(&mut self) -> Result<(), StoreError>;

    /// # Errors
    ///
    /// Returns an error if the rollback statement fails.
    fn rollback(&mut self) -> Result<(), StoreError>;

    /// Column names of `table` in table order, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog query fails.
    fn table_columns(&mut self, table: &str) -> Result<Option<Vec<String>>, StoreError>;

    /// Placeholder for the `n`th (1-based) statement parameter.
    fn placeholder(&self, n: usize) -> String;

    /// Most bound parameters one statement may carry.
    fn max_parameters(&self) -> usize;

    /// Serialize schema changes and appends to `table` with other sessions
    /// until the current transaction ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken.
    fn lock_table(&mut self, _table: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Open the destination store described by `config`.
///
/// # Errors
///
/// Returns an error if the `SQLite` file cannot be opened or the Postgres
/// connection string is malformed.
pub fn open_store(config: &DestinationConfig) -> Result<Arc<dyn DestinationStore>, StoreError> {
    let store: Arc<dyn DestinationStore> = match config.backend {
        StoreBackendKind::Sqlite => Arc::new(SqliteStore::open(&config.connection)?),
        StoreBackendKind::Postgres => Arc::new(PostgresStore::new(&config.connection)?),
    };
    tracing::debug!(store = %store.describe(), "Destination store opened");
    Ok(store)
}
