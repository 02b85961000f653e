//! Dataset definition model.
//!
//! A [`DatasetDefinition`] is one configured unit of work: a file inside the
//! archive, the format it is encoded in, the columns to keep, and an optional
//! upstream dataset that must finish first.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Unique dataset identifier (e.g. `"customers_daily"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(String);

impl DatasetId {
    /// Create a new dataset identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for DatasetId {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

// ---------------------------------------------------------------------------
// Source format
// ---------------------------------------------------------------------------

/// Encoding of a source file inside the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// Comma-separated values with a header line.
    Csv,
    /// A single JSON document (array of objects or one object).
    Json,
    /// First worksheet of an xlsx/xls/ods workbook.
    #[serde(alias = "xlsx", alias = "xls", alias = "ods")]
    Spreadsheet,
}

impl SourceFormat {
    /// Parse a configured format name, accepting the workbook extensions
    /// as aliases for [`SourceFormat::Spreadsheet`].
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            "spreadsheet" | "xlsx" | "xls" | "ods" => Some(Self::Spreadsheet),
            _ => None,
        }
    }

    /// Canonical configuration name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Spreadsheet => "spreadsheet",
        }
    }
}

impl std::fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

/// A validated dataset definition.
///
/// Only the registry constructs these, after checking that `columns` is
/// non-empty and duplicate-free and that `depends_on` names a known dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDefinition {
    pub id: DatasetId,
    /// Path of the source file relative to the extraction directory.
    pub file_name: String,
    /// Columns to keep, in target order.
    pub columns: Vec<String>,
    pub format: SourceFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DatasetId>,
}
