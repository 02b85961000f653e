//! Pipeline configuration: file model, parsing, and settings validation.

pub mod parser;
pub mod types;
pub mod validator;
