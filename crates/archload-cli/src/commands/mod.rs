pub mod check;
pub mod datasets;
pub mod run;
pub mod status;
