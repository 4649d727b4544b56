//! Repository trait definitions (ports) and the in-memory reference store.
//!
//! `task` defines the storage interface the loop engine consumes. `memory`
//! is a complete in-process implementation used by tests and by the
//! `tloom simulate` command.

pub mod memory;
pub mod task;
