use postgres::types::ToSql;
use postgres::{Client, Config, NoTls};

use super::{DestinationStore, StoreError, StoreSession};

const POSTGRES_MAX_PARAMETERS: usize = 65_535;

/// Postgres destination. Each session opens its own connection.
///
/// Uses the synchronous client, which drives its own runtime; sessions must
/// not be opened on an async worker thread.
pub struct PostgresStore {
    config: Config,
    describe: String,
}

impl PostgresStore {
    /// # Errors
    ///
    /// Returns an error if `connection` is not a valid connection string.
    pub fn new(connection: &str) -> Result<Self, StoreError> {
        let config: Config = connection.parse()?;
        let host = config
            .get_hosts()
            .first()
            .map(|host| format!("{host:?}"))
            .unwrap_or_default();
        let dbname = config.get_dbname().unwrap_or_default().to_string();
        Ok(Self {
            config,
            describe: format!("postgres:{host}/{dbname}"),
        })
    }
}

impl DestinationStore for PostgresStore {
    fn session(&self) -> Result<Box<dyn StoreSession + '_>, StoreError> {
        let client = self.config.connect(NoTls)?;
        Ok(Box::new(PostgresSession {
            client,
            in_transaction: false,
        }))
    }

    fn describe(&self) -> String {
        self.describe.clone()
    }
}

struct PostgresSession {
    client: Client,
    in_transaction: bool,
}

impl StoreSession for PostgresSession {
    fn execute(&mut self, sql: &str, params: &[&str]) -> Result<u64, StoreError> {
        let values: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p as &(dyn ToSql + Sync))
            .collect();
        Ok(self.client.execute(sql, &values)?)
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        self.client.batch_execute("BEGIN")?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.in_transaction = false;
        self.client.batch_execute("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.in_transaction = false;
        self.client.batch_execute("ROLLBACK")?;
        Ok(())
    }

    fn table_columns(&mut self, table: &str) -> Result<Option<Vec<String>>, StoreError> {
        let rows = self.client.query(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 \
             ORDER BY ordinal_position",
            &[&table],
        )?;
        let columns: Vec<String> = rows.iter().map(|row| row.get(0)).collect();
        Ok(if columns.is_empty() { None } else { Some(columns) })
    }

    fn placeholder(&self, n: usize) -> String {
        format!("${n}")
    }

    fn max_parameters(&self) -> usize {
        POSTGRES_MAX_PARAMETERS
    }

    fn lock_table(&mut self, table: &str) -> Result<(), StoreError> {
        self.client.execute(
            "SELECT pg_advisory_xact_lock(hashtext($1)::bigint)",
            &[&table],
        )?;
        Ok(())
    }
}

impl Drop for PostgresSession {
    fn drop(&mut self) {
        if self.in_transaction {
            if let Err(e) = self.client.batch_execute("ROLLBACK") {
                tracing::warn!(error = %e, "Rollback of abandoned postgres transaction failed");
            }
        }
    }
}
