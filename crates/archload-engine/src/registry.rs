//! Dataset registry: turns configured records into validated definitions.
//!
//! Every record is checked and every problem is collected. Violations are
//! ordered by record index, so the first one names the lowest offending
//! record. Either all records become definitions or none do.

use std::collections::{HashMap, HashSet};

use archload_types::dataset::{DatasetDefinition, DatasetId, SourceFormat};
use serde_yaml::Value;

use crate::config::types::PipelineConfig;
use crate::config::validator::settings_violations;
use crate::errors::{ConfigurationError, Violation, ViolationKind};

const IDENTIFIER_KEYS: &[&str] = &["identifier", "dag_id"];
const DEPENDS_ON_KEYS: &[&str] = &["depends_on", "wait_for_dag"];

/// Validate `records` into definitions, preserving their order.
///
/// # Errors
///
/// Returns a [`ConfigurationError`] holding every violation found.
pub fn load(records: &[Value]) -> Result<Vec<DatasetDefinition>, ConfigurationError> {
    let mut violations = Vec::new();
    let mut parsed = Vec::with_capacity(records.len());

    for (index, record) in records.iter().enumerate() {
        parsed.push(parse_record(index, record, &mut violations));
    }

    check_identifiers(&parsed, &mut violations);

    // Record checks run before the cross-record pass; a stable sort by index
    // keeps each record's violations in field order.
    violations.sort_by_key(|v| v.index);

    if !violations.is_empty() {
        return Err(ConfigurationError { violations });
    }

    Ok(parsed.into_iter().flatten().collect())
}

/// Validate a whole pipeline: dataset records first, then settings.
///
/// # Errors
///
/// Returns a [`ConfigurationError`] holding every violation found.
pub fn load_pipeline(config: &PipelineConfig) -> Result<Vec<DatasetDefinition>, ConfigurationError> {
    let records = load(&config.datasets);
    let settings = settings_violations(config);

    match records {
        Ok(definitions) if settings.is_empty() => Ok(definitions),
        Ok(_) => Err(ConfigurationError {
            violations: settings,
        }),
        Err(mut err) => {
            err.violations.extend(settings);
            Err(err)
        }
    }
}

fn parse_record(
    index: usize,
    record: &Value,
    violations: &mut Vec<Violation>,
) -> Option<DatasetDefinition> {
    if !record.is_mapping() {
        violations.push(Violation::record(index, "record", "must be a mapping"));
        return None;
    }

    let before = violations.len();

    let id = required_string(index, record, IDENTIFIER_KEYS, violations);
    let file_name = required_string(index, record, &["file_name"], violations);
    let columns = parse_columns(index, record, violations);
    let format = parse_format(index, record, violations);
    let depends_on = optional_string(index, record, DEPENDS_ON_KEYS, violations);

    if violations.len() > before {
        return None;
    }

    Some(DatasetDefinition {
        id: DatasetId::new(id?),
        file_name: file_name?,
        columns: columns?,
        format: format?,
        depends_on: depends_on.map(DatasetId::new),
    })
}

fn lookup<'a>(record: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| record.get(*key))
        .filter(|value| !value.is_null())
}

fn required_string(
    index: usize,
    record: &Value,
    keys: &[&str],
    violations: &mut Vec<Violation>,
) -> Option<String> {
    let field = keys[0];
    match lookup(record, keys) {
        None => {
            violations
                .push(Violation::record(index, field, "is required").with_kind(ViolationKind::Missing));
            None
        }
        Some(value) => match value.as_str().map(str::trim) {
            Some("") => {
                violations.push(Violation::record(index, field, "must not be empty"));
                None
            }
            Some(s) => Some(s.to_string()),
            None => {
                violations.push(Violation::record(index, field, "must be a string"));
                None
            }
        },
    }
}

fn optional_string(
    index: usize,
    record: &Value,
    keys: &[&str],
    violations: &mut Vec<Violation>,
) -> Option<String> {
    let value = lookup(record, keys)?;
    match value.as_str().map(str::trim) {
        Some("") => None,
        Some(s) => Some(s.to_string()),
        None => {
            violations.push(Violation::record(index, keys[0], "must be a string"));
            None
        }
    }
}

fn parse_columns(
    index: usize,
    record: &Value,
    violations: &mut Vec<Violation>,
) -> Option<Vec<String>> {
    let Some(value) = lookup(record, &["columns"]) else {
        violations.push(
            Violation::record(index, "columns", "is required").with_kind(ViolationKind::Missing),
        );
        return None;
    };
    let Some(items) = value.as_sequence() else {
        violations.push(Violation::record(index, "columns", "must be a list"));
        return None;
    };
    if items.is_empty() {
        violations.push(Violation::record(index, "columns", "must not be empty"));
        return None;
    }

    let mut columns = Vec::with_capacity(items.len());
    let mut seen = HashSet::new();
    let mut ok = true;
    for (pos, item) in items.iter().enumerate() {
        match item.as_str() {
            Some(name) if !name.trim().is_empty() => {
                if !seen.insert(name) {
                    violations.push(
                        Violation::record(index, "columns", format!("duplicate column '{name}'"))
                            .with_kind(ViolationKind::Duplicate),
                    );
                    ok = false;
                }
                columns.push(name.to_string());
            }
            _ => {
                violations.push(Violation::record(
                    index,
                    "columns",
                    format!("entry {pos} must be a non-empty string"),
                ));
                ok = false;
            }
        }
    }

    ok.then_some(columns)
}

fn parse_format(
    index: usize,
    record: &Value,
    violations: &mut Vec<Violation>,
) -> Option<SourceFormat> {
    let Some(value) = lookup(record, &["format"]) else {
        violations.push(
            Violation::record(index, "format", "is required").with_kind(ViolationKind::Missing),
        );
        return None;
    };
    let Some(raw) = value.as_str() else {
        violations.push(Violation::record(index, "format", "must be a string"));
        return None;
    };
    let format = SourceFormat::parse(raw);
    if format.is_none() {
        violations.push(
            Violation::record(
                index,
                "format",
                format!("unsupported format '{raw}' (expected csv, json, or spreadsheet)"),
            )
            .with_kind(ViolationKind::UnsupportedFormat),
        );
    }
    format
}

/// Uniqueness and dependency references, across records that parsed.
fn check_identifiers(parsed: &[Option<DatasetDefinition>], violations: &mut Vec<Violation>) {
    let mut first_seen: HashMap<&DatasetId, usize> = HashMap::new();
    for (index, def) in parsed.iter().enumerate() {
        let Some(def) = def else { continue };
        if let Some(first) = first_seen.get(&def.id) {
            violations.push(
                Violation::record(
                    index,
                    "identifier",
                    format!("duplicate identifier '{}' (first used by datasets[{first}])", def.id),
                )
                .with_kind(ViolationKind::Duplicate),
            );
        } else {
            first_seen.insert(&def.id, index);
        }
    }

    for (index, def) in parsed.iter().enumerate() {
        let Some(def) = def else { continue };
        if let Some(dep) = &def.depends_on {
            if !first_seen.contains_key(dep) {
                violations.push(
                    Violation::record(index, "depends_on", format!("unknown dataset '{dep}'"))
                        .with_kind(ViolationKind::UnknownDependency),
                );
            }
        }
    }
}
