//! Dataset and cycle outcome types.

use archload_types::dataset::DatasetId;

use crate::errors::PipelineError;

/// Counts and timing for one successful dataset load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadSummary {
    pub rows_read: u64,
    pub rows_written: u64,
    pub duration_secs: f64,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Final result of one dataset's run within a cycle.
#[derive(Debug)]
pub struct DatasetOutcome {
    pub dataset: DatasetId,
    pub run_id: i64,
    pub result: Result<LoadSummary, PipelineError>,
}

impl DatasetOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Outcomes of a cycle, in configuration order.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub outcomes: Vec<DatasetOutcome>,
    pub duration_secs: f64,
}

impl CycleReport {
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    #[must_use]
    pub fn rows_written(&self) -> u64 {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .map(|s| s.rows_written)
            .sum()
    }

    /// Failures, in configuration order.
    pub fn failures(&self) -> impl Iterator<Item = &PipelineError> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().err())
    }
}
