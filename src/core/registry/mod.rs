// src/core/registry/mod.rs

//! The persisted list of known devices and their last reported liveness.
//!
//! The registry is a system of record for *configuration* (which devices exist
//! and where they live) and a sink for liveness updates. The manager never reads
//! it to decide in-memory connection state.

use crate::core::link::DeviceAddress;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod file;
pub mod memory;

pub use file::JsonFileDeviceRegistry;
pub use memory::MemoryDeviceRegistry;

/// One known device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            name: None,
            address: address.into(),
            port,
            is_online: false,
            last_seen: None,
        }
    }

    pub fn device_address(&self) -> DeviceAddress {
        DeviceAddress::new(self.address.clone(), self.port)
    }
}

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Returns every known device.
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>>;

    /// Looks up a single device by id.
    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>>;

    /// Records whether a device was reachable at `at`. Unknown ids are ignored.
    async fn update_liveness(&self, device_id: &str, is_online: bool, at: DateTime<Utc>)
    -> Result<()>;
}
