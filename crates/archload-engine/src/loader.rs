//! Loader: reconcile the target table and append projected rows atomically.

use std::collections::HashSet;

use pg_escape::quote_identifier;

use crate::config::types::SchemaPolicy;
use crate::errors::IngestError;
use crate::project::ProjectedRow;
use crate::store::{DestinationStore, StoreSession};

/// Upper bound on rows per multi-row INSERT.
const INSERT_CHUNK_SIZE: usize = 500;

/// Create `table` if absent and reconcile its columns with `columns`.
///
/// # Errors
///
/// Returns [`IngestError::SchemaMismatch`] under [`SchemaPolicy::Exact`]
/// when the existing column set differs, or a load error from the store.
pub fn ensure_table(
    session: &mut dyn StoreSession,
    table: &str,
    columns: &[String],
    policy: SchemaPolicy,
) -> Result<(), IngestError> {
    let table_ident = quote_identifier(table);
    let column_defs = columns
        .iter()
        .map(|c| format!("{} TEXT", quote_identifier(c)))
        .collect::<Vec<_>>()
        .join(", ");
    session.execute(
        &format!("CREATE TABLE IF NOT EXISTS {table_ident} ({column_defs})"),
        &[],
    )?;

    let existing = session.table_columns(table)?.unwrap_or_default();
    let existing_set: HashSet<&str> = existing.iter().map(String::as_str).collect();
    let missing: Vec<&String> = columns
        .iter()
        .filter(|c| !existing_set.contains(c.as_str()))
        .collect();

    match policy {
        SchemaPolicy::Exact => {
            if !missing.is_empty() || existing.len() != columns.len() {
                return Err(IngestError::SchemaMismatch {
                    table: table.to_string(),
                    table_columns: existing,
                    dataset_columns: columns.to_vec(),
                });
            }
        }
        SchemaPolicy::Additive => {
            for column in missing {
                session.execute(
                    &format!(
                        "ALTER TABLE {table_ident} ADD COLUMN {} TEXT",
                        quote_identifier(column)
                    ),
                    &[],
                )?;
                tracing::info!(table, column = %column, "Added column to target table");
            }
        }
    }
    Ok(())
}

/// Append `rows` with batched multi-row INSERTs naming `columns` explicitly.
///
/// Runs inside the caller's transaction. Stops at the first `Err` item, so
/// an upstream read or projection failure surfaces before anything commits.
///
/// # Errors
///
/// Returns the first upstream error or store error encountered.
pub fn append_rows<I>(
    session: &mut dyn StoreSession,
    table: &str,
    columns: &[String],
    rows: I,
    chunk_size: usize,
) -> Result<u64, IngestError>
where
    I: IntoIterator<Item = Result<ProjectedRow, IngestError>>,
{
    let width = columns.len().max(1);
    let chunk_size = chunk_size
        .min(session.max_parameters() / width)
        .max(1);
    let header = format!(
        "INSERT INTO {} ({}) VALUES ",
        quote_identifier(table),
        columns
            .iter()
            .map(|c| quote_identifier(c).to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let mut written: u64 = 0;
    let mut buffer: Vec<ProjectedRow> = Vec::with_capacity(chunk_size);
    for row in rows {
        buffer.push(row?);
        if buffer.len() == chunk_size {
            written += flush(session, &header, width, &buffer)?;
            buffer.clear();
        }
    }
    if !buffer.is_empty() {
        written += flush(session, &header, width, &buffer)?;
    }
    Ok(written)
}

fn flush(
    session: &mut dyn StoreSession,
    header: &str,
    width: usize,
    rows: &[ProjectedRow],
) -> Result<u64, IngestError> {
    let mut sql = String::with_capacity(header.len() + rows.len() * width * 6);
    sql.push_str(header);
    let mut params: Vec<&str> = Vec::with_capacity(rows.len() * width);
    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for (j, value) in row.values().iter().enumerate() {
            if j > 0 {
                sql.push_str(", ");
            }
            params.push(value);
            sql.push_str(&session.placeholder(params.len()));
        }
        sql.push(')');
    }
    session.execute(&sql, &params)?;
    Ok(rows.len() as u64)
}

/// Runs one dataset's load as a single transaction.
pub struct Loader<'a> {
    store: &'a dyn DestinationStore,
    table: &'a str,
    policy: SchemaPolicy,
    chunk_size: usize,
}

impl<'a> Loader<'a> {
    #[must_use]
    pub fn new(store: &'a dyn DestinationStore, table: &'a str, policy: SchemaPolicy) -> Self {
        Self {
            store,
            table,
            policy,
            chunk_size: INSERT_CHUNK_SIZE,
        }
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Ensure the table and append `rows`, committing only if every row
    /// was written. Returns the committed row count.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the transaction is rolled back and no
    /// row of this load remains.
    pub fn load<I>(&self, columns: &[String], rows: I) -> Result<u64, IngestError>
    where
        I: IntoIterator<Item = Result<ProjectedRow, IngestError>>,
    {
        let mut session = self.store.session()?;
        session.begin()?;

        let outcome = session
            .lock_table(self.table)
            .map_err(IngestError::from)
            .and_then(|()| ensure_table(session.as_mut(), self.table, columns, self.policy))
            .and_then(|()| {
                append_rows(session.as_mut(), self.table, columns, rows, self.chunk_size)
            });

        match outcome {
            Ok(written) => {
                session.commit()?;
                tracing::debug!(table = self.table, rows = written, "Load committed");
                Ok(written)
            }
            Err(err) => {
                if let Err(rollback_err) = session.rollback() {
                    tracing::warn!(
                        table = self.table,
                        error = %rollback_err,
                        "Rollback after failed load also failed"
                    );
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn rows(values: &[&[&str]]) -> Vec<Result<ProjectedRow, IngestError>> {
        values
            .iter()
            .map(|r| Ok(ProjectedRow(r.iter().map(|s| (*s).to_string()).collect())))
            .collect()
    }

    fn dump(store: &SqliteStore, sql: &str) -> Vec<Vec<Option<String>>> {
        store.query_rows(sql)
    }

    #[test]
    fn creates_table_and_appends_in_order() {
        let store = SqliteStore::in_memory().unwrap();
        let loader = Loader::new(&store, "unified_rows", SchemaPolicy::Exact).with_chunk_size(2);
        let written = loader
            .load(&cols(&["b", "a"]), rows(&[&["1", "x"], &["2", "y"], &["3", "z"]]))
            .unwrap();
        assert_eq!(written, 3);
        let got = dump(&store, "SELECT \"b\", \"a\" FROM unified_rows ORDER BY rowid");
        assert_eq!(
            got,
            vec![
                vec![Some("1".into()), Some("x".into())],
                vec![Some("2".into()), Some("y".into())],
                vec![Some("3".into()), Some("z".into())],
            ]
        );
    }

    #[test]
    fn upstream_error_rolls_back_everything() {
        let store = SqliteStore::in_memory().unwrap();
        let loader = Loader::new(&store, "unified_rows", SchemaPolicy::Exact).with_chunk_size(2);
        loader.load(&cols(&["a"]), rows(&[&["seed"]])).unwrap();

        let mut input = rows(&[&["1"], &["2"], &["3"]]);
        input.push(Err(IngestError::Parse {
            path: "a.csv".into(),
            line: Some(5),
            message: "bad row".into(),
        }));
        input.extend(rows(&[&["5"], &["6"], &["7"], &["8"], &["9"], &["10"]]));

        let err = loader.load(&cols(&["a"]), input).unwrap_err();
        assert!(matches!(err, IngestError::Parse { .. }));
        let got = dump(&store, "SELECT \"a\" FROM unified_rows");
        assert_eq!(got, vec![vec![Some("seed".into())]]);
    }

    #[test]
    fn exact_policy_rejects_different_columns() {
        let store = SqliteStore::in_memory().unwrap();
        let loader = Loader::new(&store, "unified_rows", SchemaPolicy::Exact);
        loader.load(&cols(&["a", "b"]), rows(&[&["1", "2"]])).unwrap();

        let err = loader.load(&cols(&["a", "c"]), rows(&[&["3", "4"]])).unwrap_err();
        match err {
            IngestError::SchemaMismatch {
                table_columns,
                dataset_columns,
                ..
            } => {
                assert_eq!(table_columns, vec!["a", "b"]);
                assert_eq!(dataset_columns, vec!["a", "c"]);
            }
            other => panic!("expected schema mismatch, got {other:?}"),
        }
    }

    #[test]
    fn exact_policy_accepts_reordered_columns() {
        let store = SqliteStore::in_memory().unwrap();
        let loader = Loader::new(&store, "unified_rows", SchemaPolicy::Exact);
        loader.load(&cols(&["a", "b"]), rows(&[&["1", "2"]])).unwrap();
        loader.load(&cols(&["b", "a"]), rows(&[&["4", "3"]])).unwrap();
        let got = dump(&store, "SELECT \"a\", \"b\" FROM unified_rows ORDER BY rowid");
        assert_eq!(got[1], vec![Some("3".into()), Some("4".into())]);
    }

    #[test]
    fn additive_policy_grows_table_and_leaves_gaps_null() {
        let store = SqliteStore::in_memory().unwrap();
        let loader = Loader::new(&store, "unified_rows", SchemaPolicy::Additive);
        loader.load(&cols(&["a"]), rows(&[&["1"]])).unwrap();
        loader.load(&cols(&["b"]), rows(&[&["2"]])).unwrap();

        let got = dump(&store, "SELECT \"a\", \"b\" FROM unified_rows ORDER BY rowid");
        assert_eq!(
            got,
            vec![vec![Some("1".into()), None], vec![None, Some("2".into())]]
        );
    }

    #[test]
    fn empty_input_still_creates_table() {
        let store = SqliteStore::in_memory().unwrap();
        let loader = Loader::new(&store, "unified_rows", SchemaPolicy::Exact);
        assert_eq!(loader.load(&cols(&["a"]), Vec::new()).unwrap(), 0);
        let mut session = store.session().unwrap();
        assert_eq!(session.table_columns("unified_rows").unwrap(), Some(cols(&["a"])));
    }

    #[test]
    fn identifiers_are_quoted() {
        let store = SqliteStore::in_memory().unwrap();
        let loader = Loader::new(&store, "unified_rows", SchemaPolicy::Exact);
        loader
            .load(&cols(&["first name", "Total"]), rows(&[&["Ada", "x"]]))
            .unwrap();
        let got = dump(&store, "SELECT \"first name\" FROM unified_rows");
        assert_eq!(got, vec![vec![Some("Ada".into())]]);
    }
}
