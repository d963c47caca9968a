// src/core/mod.rs

//! The central module: the connection manager and the collaborator traits it
//! depends on.

pub mod connection;
pub mod errors;
pub mod link;
pub mod metrics;
pub mod registry;
pub mod tasks;

pub use errors::LinkError;
pub use link::{DeviceAddress, DeviceCommand};
