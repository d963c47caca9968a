// src/core/registry/memory.rs

use super::{DeviceRecord, DeviceRegistry};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// A registry held entirely in memory. Used when no registry file is configured
/// and by embedders that keep device records elsewhere.
#[derive(Debug, Default)]
pub struct MemoryDeviceRegistry {
    devices: DashMap<String, DeviceRecord>,
}

impl MemoryDeviceRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_devices(records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        let registry = Self::new();
        for record in records {
            registry.upsert(record);
        }
        registry
    }

    /// Adds or replaces a device record.
    pub fn upsert(&self, record: DeviceRecord) {
        self.devices.insert(record.id.clone(), record);
    }

    pub fn remove(&self, device_id: &str) -> Option<DeviceRecord> {
        self.devices.remove(device_id).map(|(_, r)| r)
    }
}

#[async_trait]
impl DeviceRegistry for MemoryDeviceRegistry {
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        let mut records: Vec<DeviceRecord> =
            self.devices.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        Ok(self.devices.get(device_id).map(|r| r.value().clone()))
    }

    async fn update_liveness(
        &self,
        device_id: &str,
        is_online: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(mut record) = self.devices.get_mut(device_id) {
            record.is_online = is_online;
            if is_online {
                record.last_seen = Some(at);
            }
        }
        Ok(())
    }
}
