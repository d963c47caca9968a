// src/core/tasks/mod.rs

//! Long-running background tasks that support the connection manager.

pub mod idle_sweep;
