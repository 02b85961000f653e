//! Format readers: decode a source file into a lazy sequence of raw rows.

mod csv;
mod json;
mod spreadsheet;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use archload_types::dataset::SourceFormat;

use crate::errors::IngestError;

pub use self::csv::CsvReader;
pub use self::json::JsonReader;
pub use self::spreadsheet::SpreadsheetReader;

/// A scalar as decoded from the source, before stringification.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl RawValue {
    /// Text form stored in the destination table.
    ///
    /// Null becomes the empty string and integral floats keep one decimal
    /// place (`3.0`); other floats use the shortest round-trip form.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) if f.is_finite() && f.fract() == 0.0 => format!("{f:.1}"),
            Self::Float(f) => f.to_string(),
            Self::Text(s) => s.clone(),
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// One decoded record: column name to raw value.
pub type RawRow = HashMap<String, RawValue>;

/// Finite, single-pass sequence of decoded rows.
pub type RowIter = Box<dyn Iterator<Item = Result<RawRow, IngestError>> + Send>;

/// Decoder for one source format.
pub trait FormatReader: Send + Sync {
    /// Open `path` and return its rows in source order.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::SourceUnavailable`] if the file cannot be
    /// opened, or [`IngestError::Parse`] if it cannot be decoded up front.
    /// Per-row decode failures surface as `Err` items of the iterator.
    fn read(&self, path: &Path) -> Result<RowIter, IngestError>;
}

/// The reader registered for `format`.
#[must_use]
pub fn reader_for(format: SourceFormat) -> &'static dyn FormatReader {
    match format {
        SourceFormat::Csv => &CsvReader,
        SourceFormat::Json => &JsonReader,
        SourceFormat::Spreadsheet => &SpreadsheetReader,
    }
}

/// Decode `path` as `format`.
///
/// # Errors
///
/// See [`FormatReader::read`].
pub fn read(path: &Path, format: SourceFormat) -> Result<RowIter, IngestError> {
    reader_for(format).read(path)
}

fn source_unavailable(path: &Path, source: std::io::Error) -> IngestError {
    IngestError::SourceUnavailable {
        path: path.to_path_buf(),
        source,
    }
}
