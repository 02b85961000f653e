//! Shared archload model types.
//!
//! Kept free of I/O so the engine, state, and CLI crates can all depend on
//! it without pulling in storage or runtime dependencies.

pub mod dataset;
pub mod state;
