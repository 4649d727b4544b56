//! Infrastructure layer for taskloom.
//!
//! Adapters for the ports defined in `taskloom-core`: the toml engine config
//! loader, a tokio channel-backed scheduler, and loaders for event logs and
//! DAG definition files.

pub mod config;
pub mod loader;
pub mod scheduler;
