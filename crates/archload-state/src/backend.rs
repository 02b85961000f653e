//! Run ledger trait definition.
//!
//! [`RunLedger`] defines the storage contract for dataset run history.
//! Model types live in [`archload_types::state`].

use archload_types::dataset::DatasetId;
use archload_types::state::{RunRecord, RunState, RunStats};

use crate::error;

/// Storage contract for dataset run history.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn RunLedger>`.
pub trait RunLedger: Send + Sync {
    /// Record a new run for `dataset` in the `pending` state, returning its ID.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn start_run(&self, dataset: &DatasetId) -> error::Result<i64>;

    /// Move a run to a non-terminal state (e.g. `running`).
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn set_run_state(&self, run_id: i64, state: RunState) -> error::Result<()>;

    /// Finalize a run with a terminal state and its stats.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn complete_run(&self, run_id: i64, state: RunState, stats: &RunStats) -> error::Result<()>;

    /// State of the most recent run for `dataset`, or `None` if it never ran.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure
    /// or when the stored status is not a known [`RunState`].
    fn latest_run_state(&self, dataset: &DatasetId) -> error::Result<Option<RunState>>;

    /// The most recent runs across all datasets, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn recent_runs(&self, limit: usize) -> error::Result<Vec<RunRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify the trait is object-safe (can be used as `dyn RunLedger`).
    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn RunLedger) {}
    }
}
