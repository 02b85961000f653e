//! Semantic validation for parsed pipeline settings.
//!
//! Dataset records are validated by the [registry](crate::registry); this
//! module covers everything around them.

use crate::config::types::PipelineConfig;
use crate::errors::Violation;

const SUPPORTED_VERSION: &str = "1.0";

/// Collect every settings violation in `config`, in field order.
#[must_use]
pub fn settings_violations(config: &PipelineConfig) -> Vec<Violation> {
    let mut violations = Vec::new();

    if config.version != SUPPORTED_VERSION {
        violations.push(Violation::setting(
            "version",
            format!(
                "unsupported pipeline version '{}', expected '{SUPPORTED_VERSION}'",
                config.version
            ),
        ));
    }

    if config.archive.extract_dir.as_os_str().is_empty() {
        violations.push(Violation::setting(
            "archive.extract_dir",
            "must not be empty",
        ));
    }

    if config.destination.table.trim().is_empty() {
        violations.push(Violation::setting("destination.table", "must not be empty"));
    }

    if config.destination.connection.trim().is_empty() {
        violations.push(Violation::setting(
            "destination.connection",
            "must not be empty",
        ));
    }

    if config.resources.concurrency == 0 {
        violations.push(Violation::setting(
            "resources.concurrency",
            "must be at least 1",
        ));
    }

    let deps = &config.dependencies;
    if deps.poll_interval_seconds == 0 {
        violations.push(Violation::setting(
            "dependencies.poll_interval_seconds",
            "must be > 0",
        ));
    } else if deps.poll_interval_seconds > deps.timeout_seconds {
        violations.push(Violation::setting(
            "dependencies.poll_interval_seconds",
            format!(
                "must not exceed timeout_seconds ({})",
                deps.timeout_seconds
            ),
        ));
    }

    violations
}
