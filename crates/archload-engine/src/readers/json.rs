use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde_json::{Map, Value};

use super::{source_unavailable, FormatReader, RawRow, RawValue, RowIter};
use crate::errors::IngestError;

/// A single JSON document: an array of objects, or one object.
///
/// Nested objects flatten to dotted keys (`address.city`). Arrays inside a
/// row are kept as their JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonReader;

impl FormatReader for JsonReader {
    fn read(&self, path: &Path) -> Result<RowIter, IngestError> {
        let file = File::open(path).map_err(|e| source_unavailable(path, e))?;
        let document: Value =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| IngestError::Parse {
                path: path.to_path_buf(),
                line: Some(e.line() as u64),
                message: e.to_string(),
            })?;

        match document {
            Value::Object(object) => {
                let row: Result<RawRow, IngestError> = Ok(flatten(object));
                Ok(Box::new(std::iter::once(row)))
            }
            Value::Array(elements) => {
                let path = path.to_path_buf();
                let rows = elements
                    .into_iter()
                    .enumerate()
                    .map(move |(i, element)| match element {
                        Value::Object(object) => Ok(flatten(object)),
                        other => Err(IngestError::Parse {
                            path: path.clone(),
                            line: None,
                            message: format!(
                                "element {} is {}, expected an object",
                                i + 1,
                                kind(&other)
                            ),
                        }),
                    });
                Ok(Box::new(rows))
            }
            other => Err(IngestError::Parse {
                path: path.to_path_buf(),
                line: None,
                message: format!(
                    "top-level document is {}, expected an array or object",
                    kind(&other)
                ),
            }),
        }
    }
}

fn flatten(object: Map<String, Value>) -> RawRow {
    let mut row = RawRow::with_capacity(object.len());
    flatten_into(&mut row, None, object);
    row
}

fn flatten_into(row: &mut RawRow, prefix: Option<&str>, object: Map<String, Value>) {
    for (key, value) in object {
        let key = match prefix {
            Some(prefix) => format!("{prefix}.{key}"),
            None => key,
        };
        match value {
            Value::Object(nested) => flatten_into(row, Some(&key), nested),
            other => {
                row.insert(key, scalar(other));
            }
        }
    }
}

fn scalar(value: Value) -> RawValue {
    match value {
        Value::Null => RawValue::Null,
        Value::Bool(b) => RawValue::Bool(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                RawValue::Integer(i)
            } else if n.is_u64() {
                RawValue::Text(n.to_string())
            } else {
                n.as_f64().map_or_else(|| RawValue::Text(n.to_string()), RawValue::Float)
            }
        }
        Value::String(s) => RawValue::Text(s),
        array @ Value::Array(_) => RawValue::Text(array.to_string()),
        // Objects are flattened before reaching here.
        object @ Value::Object(_) => RawValue::Text(object.to_string()),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
