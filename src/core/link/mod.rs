// src/core/link/mod.rs

//! The seam between the connection manager and a physical device.
//!
//! The manager never speaks a wire protocol itself. It asks a `LinkConnector`
//! to open a `DeviceLink` for an address and then hands `DeviceCommand` values
//! to that link. Anything that can move a command to a box and bring a reply
//! back (the bundled TCP line protocol, a test double, a vendor bridge) plugs in here.

use crate::core::errors::LinkError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod command;
pub mod tcp;

pub use command::{CommandReply, DeviceCommand, RemoteKey};
pub use tcp::{TcpLink, TcpLinkConnector};

/// The network location of a device's control channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAddress {
    pub host: String,
    pub port: u16,
}

impl DeviceAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Timeouts applied by links when opening a channel and waiting for replies.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkOptions {
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_command_timeout")]
    pub command_timeout: Duration,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
        }
    }
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_command_timeout() -> Duration {
    Duration::from_secs(10)
}

/// An open, bidirectional control channel to exactly one device.
#[async_trait]
pub trait DeviceLink: Send + Sync + fmt::Debug {
    /// Sends a command and waits for the device's reply.
    async fn send(&self, command: &DeviceCommand) -> Result<CommandReply, LinkError>;

    /// Closes the channel. Calling `close` on an already closed link is not an error.
    async fn close(&self) -> Result<(), LinkError>;

    /// Reports whether the channel is still usable. Must not block.
    fn is_alive(&self) -> bool;
}

/// Opens `DeviceLink`s. One connector serves every device of a manager.
#[async_trait]
pub trait LinkConnector: Send + Sync {
    async fn open(
        &self,
        address: &DeviceAddress,
        options: &LinkOptions,
    ) -> Result<Arc<dyn DeviceLink>, LinkError>;
}
