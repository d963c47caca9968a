// src/core/connection/mod.rs

//! Long-lived device connections: per-device entries, their command queues,
//! and the manager that coordinates them.

pub mod entry;
pub mod manager;
pub mod queue;

pub use entry::{ConnectionEntry, ConnectionStatus, ConnectionStatusReport};
pub use manager::{ConnectionManager, ExecuteOptions, Execution, PrewarmSummary, SweepReport};
pub use queue::{CommandQueue, CommandResult, DrainOutcome, QueuedCommand, QueuedHandle};
