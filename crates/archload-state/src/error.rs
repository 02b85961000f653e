//! Run ledger error types.

/// Errors produced by [`RunLedger`](crate::RunLedger) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying database failure (`SQLite` or `PostgreSQL`).
    #[error("state backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Database failure with a short description of the failing step.
    #[error("state backend error ({context}): {source}")]
    BackendContext {
        context: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored status string is not a known run state.
    #[error("unknown run state '{0}' in ledger")]
    UnknownState(String),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("run ledger lock poisoned")]
    LockPoisoned,
}

impl StateError {
    pub(crate) fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }

    pub(crate) fn backend_context(
        context: &'static str,
        err: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::BackendContext {
            context,
            source: Box::new(err),
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
