//! Dependency gate: wait for an upstream dataset's run to succeed.

use std::sync::Arc;
use std::time::Duration;

use archload_state::{RunLedger, StateError};
use archload_types::dataset::DatasetId;
use archload_types::state::RunState;
use tokio::time::Instant;

use crate::errors::IngestError;

/// Source of the most recent run state per dataset.
///
/// Calls may block; the gate issues them on the blocking pool.
pub trait RunStatusProvider: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the state cannot be looked up.
    fn run_state(&self, dataset: &DatasetId) -> Result<Option<RunState>, StateError>;
}

impl<T: RunLedger + ?Sized> RunStatusProvider for T {
    fn run_state(&self, dataset: &DatasetId) -> Result<Option<RunState>, StateError> {
        self.latest_run_state(dataset)
    }
}

/// Wait until `dependency`'s most recent run is `success`.
///
/// The deadline is measured from entry. Between polls the task sleeps; it
/// never sleeps past the deadline. A timeout too large to represent as an
/// instant means no deadline.
///
/// # Errors
///
/// - [`IngestError::DependencyFailed`] as soon as a `failed` or `skipped`
///   state is observed.
/// - [`IngestError::DependencyTimeout`] if no terminal state is seen in time.
/// - [`IngestError::Ledger`] if the provider fails.
pub async fn await_completion<P>(
    provider: Arc<P>,
    dependency: &DatasetId,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), IngestError>
where
    P: RunStatusProvider + ?Sized + 'static,
{
    let deadline = Instant::now().checked_add(timeout);
    let mut polls: u32 = 0;

    loop {
        let state = poll_once(&provider, dependency).await?;
        polls += 1;

        match state {
            Some(RunState::Success) => {
                tracing::debug!(dependency = %dependency, polls, "Dependency satisfied");
                return Ok(());
            }
            Some(state @ (RunState::Failed | RunState::Skipped)) => {
                return Err(IngestError::DependencyFailed {
                    dependency: dependency.clone(),
                    state,
                });
            }
            _ => {}
        }

        let now = Instant::now();
        let wait = match deadline {
            Some(deadline) if now >= deadline => {
                return Err(IngestError::DependencyTimeout {
                    dependency: dependency.clone(),
                    timeout,
                    last_state: state,
                });
            }
            Some(deadline) => poll_interval.min(deadline - now),
            None => poll_interval,
        };

        if polls == 1 {
            tracing::info!(
                dependency = %dependency,
                state = state.map_or("none", RunState::as_str),
                timeout_secs = timeout.as_secs_f64(),
                "Waiting for dependency"
            );
        }
        tokio::time::sleep(wait).await;
    }
}

async fn poll_once<P>(provider: &Arc<P>, dependency: &DatasetId) -> Result<Option<RunState>, IngestError>
where
    P: RunStatusProvider + ?Sized + 'static,
{
    let provider = Arc::clone(provider);
    let dependency = dependency.clone();
    tokio::task::spawn_blocking(move || provider.run_state(&dependency))
        .await
        .map_err(|e| IngestError::Internal(format!("status poll task failed: {e}")))?
        .map_err(IngestError::from)
}
