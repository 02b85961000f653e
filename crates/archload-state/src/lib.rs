//! Run history persistence for archload.
//!
//! Provides the [`RunLedger`] trait with [`SqliteRunLedger`] and
//! [`PostgresRunLedger`] implementations. The ledger doubles as the status
//! provider the dependency gate polls.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod postgres;
pub mod sqlite;

pub use backend::RunLedger;
pub use error::StateError;
pub use postgres::PostgresRunLedger;
pub use sqlite::SqliteRunLedger;
