//! Pipeline error model and retry backoff policy helpers.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use archload_state::StateError;
use archload_types::dataset::DatasetId;
use archload_types::state::RunState;

use crate::store::StoreError;

const RETRY_MAX_DELAY: Duration = Duration::from_secs(3_600);

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Pipeline stage an error surfaced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Registry validation and dependency planning, before any I/O.
    Plan,
    Extract,
    Gate,
    Read,
    Project,
    Load,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Extract => "extract",
            Self::Gate => "gate",
            Self::Read => "read",
            Self::Project => "project",
            Self::Load => "load",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Category of a configuration violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    /// A required field is absent.
    Missing,
    /// A field has the wrong type or an out-of-range value.
    Invalid,
    /// `format` names a format no reader handles.
    UnsupportedFormat,
    /// A column or dataset identifier is repeated.
    Duplicate,
    /// `depends_on` names no dataset in the batch.
    UnknownDependency,
}

/// One problem found while validating configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Index of the offending dataset record, `None` for pipeline settings.
    pub index: Option<usize>,
    pub field: String,
    pub kind: ViolationKind,
    pub message: String,
}

impl Violation {
    pub(crate) fn record(index: usize, field: &str, message: impl Into<String>) -> Self {
        Self {
            index: Some(index),
            field: field.to_string(),
            kind: ViolationKind::Invalid,
            message: message.into(),
        }
    }

    pub(crate) fn setting(field: &str, message: impl Into<String>) -> Self {
        Self {
            index: None,
            field: field.to_string(),
            kind: ViolationKind::Invalid,
            message: message.into(),
        }
    }

    #[must_use]
    pub(crate) fn with_kind(mut self, kind: ViolationKind) -> Self {
        self.kind = kind;
        self
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "datasets[{i}].{}: {}", self.field, self.message),
            None => write!(f, "{}: {}", self.field, self.message),
        }
    }
}

/// All violations found in one configuration, in record order.
///
/// Every record is validated; the first violation names the lowest
/// offending record index. An unsupported source format is reported here,
/// as a violation of kind [`ViolationKind::UnsupportedFormat`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid configuration:{}", list_violations(.violations))]
pub struct ConfigurationError {
    pub violations: Vec<Violation>,
}

impl ConfigurationError {
    /// The violation to report first.
    #[must_use]
    pub fn first(&self) -> Option<&Violation> {
        self.violations.first()
    }

    /// Violations of one kind, in report order.
    pub fn of_kind(&self, kind: ViolationKind) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(move |v| v.kind == kind)
    }
}

fn list_violations(violations: &[Violation]) -> String {
    violations.iter().map(|v| format!("\n  - {v}")).collect()
}

// ---------------------------------------------------------------------------
// IngestError
// ---------------------------------------------------------------------------

/// Failure of one pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("failed to extract {}: {reason}", archive.display())]
    Extraction { archive: PathBuf, reason: String },

    #[error("cannot open source file {}: {source}", path.display())]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error in {}{}: {message}", path.display(), line.map(|l| format!(" at line {l}")).unwrap_or_default())]
    Parse {
        path: PathBuf,
        line: Option<u64>,
        message: String,
    },

    #[error("missing column '{column}' in row {row}")]
    MissingColumn { column: String, row: u64 },

    #[error("schema mismatch for table '{table}': table has [{}], dataset provides [{}]", table_columns.join(", "), dataset_columns.join(", "))]
    SchemaMismatch {
        table: String,
        table_columns: Vec<String>,
        dataset_columns: Vec<String>,
    },

    #[error("dependency '{dependency}' finished in state '{state}'")]
    DependencyFailed {
        dependency: DatasetId,
        state: RunState,
    },

    #[error("dependency '{dependency}' did not complete within {timeout:?} (last state: {})", last_state.map_or("unknown", RunState::as_str))]
    DependencyTimeout {
        dependency: DatasetId,
        timeout: Duration,
        last_state: Option<RunState>,
    },

    #[error("dependency cycle: {}", cycle.iter().map(DatasetId::as_str).collect::<Vec<_>>().join(" -> "))]
    DependencyCycle { cycle: Vec<DatasetId> },

    #[error("load failed: {0}")]
    Load(#[from] StoreError),

    #[error("run ledger error: {0}")]
    Ledger(#[from] StateError),

    #[error("{0}")]
    Internal(String),
}

impl IngestError {
    /// The stage this kind of error belongs to.
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::Configuration(_)
            | Self::DependencyCycle { .. }
            | Self::Internal(_) => Stage::Plan,
            Self::Extraction { .. } => Stage::Extract,
            Self::DependencyFailed { .. } | Self::DependencyTimeout { .. } | Self::Ledger(_) => {
                Stage::Gate
            }
            Self::SourceUnavailable { .. } | Self::Parse { .. } => Stage::Read,
            Self::MissingColumn { .. } => Stage::Project,
            Self::SchemaMismatch { .. } | Self::Load(_) => Stage::Load,
        }
    }

    /// Whether an orchestrator retry could plausibly succeed.
    ///
    /// Data and configuration problems repeat identically on every attempt;
    /// I/O, store, and dependency-timing failures may not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Extraction { .. }
                | Self::SourceUnavailable { .. }
                | Self::DependencyTimeout { .. }
                | Self::Load(_)
                | Self::Ledger(_)
        )
    }
}

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

/// A failed dataset pipeline run: which dataset, which stage, and why.
#[derive(Debug, thiserror::Error)]
#[error("dataset '{dataset}' failed at {stage}: {source}")]
pub struct PipelineError {
    pub dataset: DatasetId,
    pub stage: Stage,
    #[source]
    pub source: IngestError,
}

impl PipelineError {
    /// Wrap `source`, attributing it to the stage its kind belongs to.
    #[must_use]
    pub fn new(dataset: DatasetId, source: IngestError) -> Self {
        let stage = source.stage();
        Self {
            dataset,
            stage,
            source,
        }
    }

    /// Wrap `source` with an explicit stage.
    #[must_use]
    pub fn at(stage: Stage, dataset: DatasetId, source: IngestError) -> Self {
        Self {
            dataset,
            stage,
            source,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}

/// Delay before retry `attempt` (1-based): `base * 2^(attempt - 1)`, capped.
pub(crate) fn compute_backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(RETRY_MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_follows_error_kind() {
        let err = IngestError::MissingColumn {
            column: "id".into(),
            row: 4,
        };
        assert_eq!(err.stage(), Stage::Project);

        let err = IngestError::DependencyTimeout {
            dependency: DatasetId::new("upstream"),
            timeout: Duration::from_millis(100),
            last_state: Some(RunState::Running),
        };
        assert_eq!(err.stage(), Stage::Gate);

        let err = IngestError::Parse {
            path: PathBuf::from("a.csv"),
            line: Some(3),
            message: "bad".into(),
        };
        assert_eq!(err.stage(), Stage::Read);
    }

    #[test]
    fn pipeline_error_display_names_dataset_and_stage() {
        let err = PipelineError::new(
            DatasetId::new("orders"),
            IngestError::MissingColumn {
                column: "total".into(),
                row: 7,
            },
        );
        let msg = err.to_string();
        assert!(msg.contains("orders"), "got: {msg}");
        assert!(msg.contains("project"), "got: {msg}");
        assert!(msg.contains("missing column 'total' in row 7"), "got: {msg}");
    }

    #[test]
    fn explicit_stage_overrides_kind() {
        let err = PipelineError::at(
            Stage::Load,
            DatasetId::new("a"),
            IngestError::Internal("load task panicked".into()),
        );
        assert_eq!(err.stage, Stage::Load);
    }

    #[test]
    fn parse_error_display_includes_line() {
        let err = IngestError::Parse {
            path: PathBuf::from("data/a.csv"),
            line: Some(12),
            message: "expected 3 fields, found 2".into(),
        };
        assert_eq!(
            err.to_string(),
            "parse error in data/a.csv at line 12: expected 3 fields, found 2"
        );
    }

    #[test]
    fn cycle_display_lists_path() {
        let err = IngestError::DependencyCycle {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
    }

    #[test]
    fn configuration_error_lists_every_violation() {
        let err = ConfigurationError {
            violations: vec![
                Violation::record(1, "columns", "must not be empty"),
                Violation::setting("resources.concurrency", "must be at least 1"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("datasets[1].columns: must not be empty"));
        assert!(msg.contains("resources.concurrency: must be at least 1"));
        assert_eq!(err.first().unwrap().index, Some(1));
        assert!(msg.starts_with("invalid configuration:\n  - datasets[1]"), "got: {msg}");
    }

    #[test]
    fn violations_filter_by_kind() {
        let err = ConfigurationError {
            violations: vec![
                Violation::record(0, "format", "unsupported format 'parquet'")
                    .with_kind(ViolationKind::UnsupportedFormat),
                Violation::record(1, "file_name", "is required").with_kind(ViolationKind::Missing),
            ],
        };
        let unsupported: Vec<_> = err.of_kind(ViolationKind::UnsupportedFormat).collect();
        assert_eq!(unsupported.len(), 1);
        assert_eq!(unsupported[0].index, Some(0));
        assert_eq!(err.of_kind(ViolationKind::Duplicate).count(), 0);
    }

    #[test]
    fn retryable_kinds() {
        assert!(IngestError::Extraction {
            archive: PathBuf::from("a.zip"),
            reason: "truncated".into(),
        }
        .is_retryable());
        assert!(!IngestError::MissingColumn {
            column: "a".into(),
            row: 1,
        }
        .is_retryable());
        assert!(!IngestError::DependencyFailed {
            dependency: "a".into(),
            state: RunState::Failed,
        }
        .is_retryable());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(300);
        assert_eq!(compute_backoff(base, 1), Duration::from_secs(300));
        assert_eq!(compute_backoff(base, 2), Duration::from_secs(600));
        assert_eq!(compute_backoff(base, 3), Duration::from_secs(1_200));
        assert_eq!(compute_backoff(base, 10), RETRY_MAX_DELAY);
    }

    #[test]
    fn backoff_zero_base_is_immediate() {
        assert_eq!(compute_backoff(Duration::ZERO, 4), Duration::ZERO);
    }
}
