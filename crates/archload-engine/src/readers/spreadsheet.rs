use std::path::Path;

use calamine::{open_workbook_auto, Data, Range, Reader};

use super::{source_unavailable, FormatReader, RawRow, RawValue, RowIter};
use crate::errors::IngestError;

/// First worksheet of an xlsx, xls, or ods workbook, detected by extension.
///
/// The first row is the header. Rows with no non-empty cell are skipped and
/// do not count as data rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpreadsheetReader;

impl FormatReader for SpreadsheetReader {
    fn read(&self, path: &Path) -> Result<RowIter, IngestError> {
        std::fs::metadata(path).map_err(|e| source_unavailable(path, e))?;
        let parse_error = |message: String| IngestError::Parse {
            path: path.to_path_buf(),
            line: None,
            message,
        };

        let mut workbook = open_workbook_auto(path)
            .map_err(|e| parse_error(format!("failed to open workbook: {e}")))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| parse_error("workbook has no worksheet".to_string()))?
            .map_err(|e| parse_error(format!("failed to read worksheet: {e}")))?;

        let header: Vec<String> = range
            .rows()
            .next()
            .map(|cells| cells.iter().map(|c| cell_value(c).to_text()).collect())
            .unwrap_or_default();

        tracing::debug!(
            path = %path.display(),
            height = range.height(),
            width = range.width(),
            "Worksheet opened"
        );
        Ok(Box::new(SheetRows {
            range,
            header,
            next_row: 1,
        }))
    }
}

/// Data rows of a worksheet, decoded one at a time.
struct SheetRows {
    range: Range<Data>,
    header: Vec<String>,
    next_row: usize,
}

impl Iterator for SheetRows {
    type Item = Result<RawRow, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next_row < self.range.height() {
            let row = self.next_row;
            self.next_row += 1;
            let cells: Vec<&Data> = (0..self.range.width())
                .filter_map(|col| self.range.get((row, col)))
                .collect();
            if cells.iter().all(|c| matches!(c, Data::Empty)) {
                continue;
            }
            let record = self
                .header
                .iter()
                .zip(cells)
                .map(|(name, cell)| (name.clone(), cell_value(cell)))
                .collect();
            return Some(Ok(record));
        }
        None
    }
}

/// Workbooks store every number as a double; integral values within `i64`
/// range are read back as integers.
fn cell_value(cell: &Data) -> RawValue {
    match cell {
        Data::Empty => RawValue::Null,
        Data::Bool(b) => RawValue::Bool(*b),
        Data::Int(i) => RawValue::Integer(*i),
        #[allow(clippy::cast_possible_truncation)]
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => RawValue::Integer(*f as i64),
        Data::Float(f) => RawValue::Float(*f),
        Data::String(s) => RawValue::Text(s.clone()),
        other => RawValue::Text(other.to_string()),
    }
}
