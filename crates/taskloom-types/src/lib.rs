//! Shared domain types for taskloom.
//!
//! This crate contains the domain types used across the workspace:
//! task instances, DAG definitions and runs, the event log record,
//! composite task keys, loop parameters, and their error types.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror, dashmap.

pub mod config;
pub mod dag;
pub mod error;
pub mod event;
pub mod key;
pub mod loop_params;
pub mod task;
