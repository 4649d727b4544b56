//! Event-sourced views of a DAG run.
//!
//! - `reconstruct` -- fold the event log into de-duplicated task instances
//! - `summary` -- per-status counts over reconstructed tasks

pub mod reconstruct;
pub mod summary;

pub use reconstruct::reconstruct;
pub use summary::{RunSummary, summarize};
