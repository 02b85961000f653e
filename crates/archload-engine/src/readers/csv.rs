use std::fs::File;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord};

use super::{source_unavailable, FormatReader, RawRow, RawValue, RowIter};
use crate::errors::IngestError;

/// Comma-separated values; the first line is the header.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvReader;

impl FormatReader for CsvReader {
    fn read(&self, path: &Path) -> Result<RowIter, IngestError> {
        let file = File::open(path).map_err(|e| source_unavailable(path, e))?;
        // Field counts are checked against the header below so the error
        // can name the offending line.
        let mut reader = ReaderBuilder::new().flexible(true).from_reader(file);
        let header = reader
            .headers()
            .map_err(|e| parse_error(path, &e))?
            .clone();

        let path = path.to_path_buf();
        let rows = reader
            .into_records()
            .map(move |record| to_row(&path, &header, record));
        Ok(Box::new(rows))
    }
}

fn to_row(
    path: &Path,
    header: &StringRecord,
    record: Result<StringRecord, csv::Error>,
) -> Result<RawRow, IngestError> {
    let record = record.map_err(|e| parse_error(path, &e))?;
    if record.len() != header.len() {
        return Err(IngestError::Parse {
            path: path.to_path_buf(),
            line: record.position().map(csv::Position::line),
            message: format!(
                "expected {} fields, found {}",
                header.len(),
                record.len()
            ),
        });
    }
    Ok(header
        .iter()
        .zip(record.iter())
        .map(|(name, value)| (name.to_string(), RawValue::Text(value.to_string())))
        .collect())
}

fn parse_error(path: &Path, err: &csv::Error) -> IngestError {
    IngestError::Parse {
        path: PathBuf::from(path),
        line: err.position().map(csv::Position::line),
        message: err.to_string(),
    }
}
