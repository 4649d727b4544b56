//! Orchestration core for taskloom.
//!
//! This crate defines the ports (store, scheduler, and task-tree cache
//! traits) and the logic built on them: the task tree, event-sourced task
//! reconstruction, and the loop engine. It depends only on `taskloom-types`
//! -- never on `taskloom-infra` or any IO crate.

pub mod events;
pub mod loops;
pub mod render;
pub mod repository;
pub mod scheduler;
pub mod tree;
