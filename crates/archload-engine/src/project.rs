//! Column projection: restrict raw rows to the configured columns.

use crate::errors::IngestError;
use crate::readers::{RawRow, RowIter};

/// Stringified values aligned to a definition's columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedRow(pub Vec<String>);

impl ProjectedRow {
    #[must_use]
    pub fn values(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn into_values(self) -> Vec<String> {
        self.0
    }
}

/// Project `row` onto `columns`, in column order.
///
/// # Errors
///
/// Returns [`IngestError::MissingColumn`] naming the first absent column
/// and the 1-based `ordinal` of the row.
pub fn project(row: &RawRow, columns: &[String], ordinal: u64) -> Result<ProjectedRow, IngestError> {
    columns
        .iter()
        .map(|column| {
            row.get(column)
                .map(|value| value.to_text())
                .ok_or_else(|| IngestError::MissingColumn {
                    column: column.clone(),
                    row: ordinal,
                })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(ProjectedRow)
}

/// Lazily projects a row stream, counting the rows read.
pub struct ProjectedRows {
    rows: RowIter,
    columns: Vec<String>,
    rows_read: u64,
}

impl ProjectedRows {
    #[must_use]
    pub fn new(rows: RowIter, columns: Vec<String>) -> Self {
        Self {
            rows,
            columns,
            rows_read: 0,
        }
    }

    /// Rows pulled from the reader so far, including a failing one.
    #[must_use]
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }
}

impl Iterator for ProjectedRows {
    type Item = Result<ProjectedRow, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw = self.rows.next()?;
        self.rows_read += 1;
        Some(raw.and_then(|row| project(&row, &self.columns, self.rows_read)))
    }
}
