//! Pipeline file parsing with environment variable substitution.
//!
//! Files are YAML; JSON is accepted as the YAML subset it is. A file whose
//! top level is a sequence is treated as a bare list of dataset records.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::PipelineConfig;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error if any referenced environment variable is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let mut missing = Vec::new();

    for cap in ENV_VAR_RE.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(val) => {
                result = result.replace(&cap[0], &val);
            }
            Err(_) => {
                if !missing.iter().any(|m| m == var_name) {
                    missing.push(var_name.to_string());
                }
            }
        }
    }

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(result)
}

/// Parse a pipeline document (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the document is
/// neither a record list nor a pipeline mapping.
pub fn parse_pipeline_str(source: &str) -> Result<PipelineConfig> {
    let substituted = substitute_env_vars(source)?;
    let document: serde_yaml::Value =
        serde_yaml::from_str(&substituted).context("Failed to parse pipeline document")?;

    match document {
        serde_yaml::Value::Sequence(records) => Ok(PipelineConfig::from_records(records)),
        other => serde_yaml::from_value(other).context("Failed to parse pipeline settings"),
    }
}

/// Parse a pipeline file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or its content is invalid.
pub fn parse_pipeline(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
    parse_pipeline_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{SchemaPolicy, StoreBackendKind};

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("AL_TEST_HOST", "db.example.com");
        let input = "connection: host=${AL_TEST_HOST}";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, "connection: host=db.example.com");
        std::env::remove_var("AL_TEST_HOST");
    }

    #[test]
    fn test_no_env_vars_passthrough() {
        let input = "table: unified_rows";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_missing_env_vars_all_reported_once() {
        let input = "${AL_MISSING_X} ${AL_MISSING_Y} ${AL_MISSING_X}";
        let err = substitute_env_vars(input).unwrap_err().to_string();
        assert!(err.contains("AL_MISSING_X, AL_MISSING_Y"), "got: {err}");
    }

    #[test]
    fn test_bare_record_list_gets_defaults() {
        let json = r#"[
            {"dag_id": "orders", "file_name": "orders.csv", "columns": ["id"], "format": "csv"}
        ]"#;
        let config = parse_pipeline_str(json).unwrap();
        assert_eq!(config.datasets.len(), 1);
        assert_eq!(config.version, "1.0");
        assert_eq!(config.destination.table, "unified_rows");
        assert_eq!(config.dependencies.timeout_seconds, 600);
        assert_eq!(config.dependencies.poll_interval_seconds, 30);
        assert_eq!(config.resources.max_retries, 1);
        assert_eq!(config.resources.retry_delay_seconds, 300);
    }

    #[test]
    fn test_full_pipeline_document() {
        std::env::set_var("AL_TEST_PG", "host=localhost user=etl");
        let yaml = r#"
version: "1.0"
archive:
  path: /srv/data/drop.zip
  extract_dir: /srv/data/unzipped
destination:
  backend: postgres
  connection: ${AL_TEST_PG}
  table: landing
  schema_policy: additive
resources:
  concurrency: 2
dependencies:
  timeout_seconds: 60
  poll_interval_seconds: 5
datasets:
  - identifier: a
    file_name: a.csv
    format: csv
    columns: [x]
"#;
        let config = parse_pipeline_str(yaml).unwrap();
        assert_eq!(config.destination.backend, StoreBackendKind::Postgres);
        assert_eq!(config.destination.connection, "host=localhost user=etl");
        assert_eq!(config.destination.schema_policy, SchemaPolicy::Additive);
        assert_eq!(config.archive.path, Path::new("/srv/data/drop.zip"));
        assert_eq!(config.resources.concurrency, 2);
        assert_eq!(config.resources.max_retries, 1);
        assert_eq!(config.dependencies.poll_interval_seconds, 5);
        assert_eq!(config.datasets.len(), 1);
        std::env::remove_var("AL_TEST_PG");
    }

    #[test]
    fn test_unknown_backend_fails() {
        let yaml = "destination:\n  backend: oracle\n";
        let err = format!("{:#}", parse_pipeline_str(yaml).unwrap_err());
        assert!(err.contains("unknown variant"), "got: {err}");
    }

    #[test]
    fn test_parse_invalid_yaml_errors() {
        let yaml = "this is not: [valid: yaml: {{{}}}";
        assert!(parse_pipeline_str(yaml).is_err());
    }

    #[test]
    fn test_parse_pipeline_file_not_found() {
        let err = parse_pipeline(Path::new("/nonexistent/pipeline.yaml"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("Failed to read pipeline file"));
    }
}
