//! Store and run ledger construction from configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use archload_state::{PostgresRunLedger, RunLedger, SqliteRunLedger};

use crate::config::types::{PipelineConfig, StateBackendKind};
use crate::store::{open_store, DestinationStore};

pub(crate) fn create_run_ledger(config: &PipelineConfig) -> Result<Arc<dyn RunLedger>> {
    match config.state.backend {
        StateBackendKind::Sqlite => {
            let ledger = if let Some(path) = &config.state.connection {
                SqliteRunLedger::open(Path::new(path)).context("Failed to open run ledger")?
            } else {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                let state_path = PathBuf::from(home).join(".archload").join("state.db");
                SqliteRunLedger::open(&state_path).context("Failed to open default run ledger")?
            };
            Ok(Arc::new(ledger) as Arc<dyn RunLedger>)
        }
        StateBackendKind::Postgres => {
            let connstr = config
                .state
                .connection
                .as_deref()
                .unwrap_or("host=localhost dbname=archload_state");
            let ledger = PostgresRunLedger::open(connstr)
                .map_err(|e| anyhow::anyhow!("failed to open Postgres run ledger: {e}"))?;
            Ok(Arc::new(ledger) as Arc<dyn RunLedger>)
        }
    }
}

pub(crate) fn create_store(config: &PipelineConfig) -> Result<Arc<dyn DestinationStore>> {
    open_store(&config.destination).with_context(|| {
        format!(
            "Failed to open destination store ({:?})",
            config.destination.backend
        )
    })
}

/// Open the store and ledger and try a session on each.
pub(crate) fn check_backends(config: &PipelineConfig) -> Result<()> {
    let store = create_store(config)?;
    store
        .session()
        .with_context(|| format!("Destination store unreachable: {}", store.describe()))?;
    tracing::info!(store = %store.describe(), "Destination store: OK");

    let ledger = create_run_ledger(config)?;
    ledger
        .recent_runs(1)
        .context("Run ledger unreadable")?;
    tracing::info!("Run ledger: OK");
    Ok(())
}
