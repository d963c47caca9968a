// src/core/registry/file.rs

//! A device registry persisted as a single JSON document.

use super::{DeviceRecord, DeviceRegistry};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// The on-disk layout of the registry file.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RegistryFile {
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
}

/// Keeps the registry in memory and rewrites the whole file on every liveness change.
///
/// Writes go to a temporary file that is then renamed over the original, so a
/// crash mid-write never leaves a truncated registry behind. All writes are
/// serialized through one async mutex.
#[derive(Debug)]
pub struct JsonFileDeviceRegistry {
    path: PathBuf,
    contents: Mutex<RegistryFile>,
}

impl JsonFileDeviceRegistry {
    /// Loads the registry at `path`. A missing file yields an empty registry that
    /// is created on the first write.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let contents = match fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str::<RegistryFile>(&text)
                .with_context(|| format!("Failed to parse device registry '{}'", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Device registry '{}' does not exist yet; starting empty.",
                    path.display()
                );
                RegistryFile::default()
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read device registry '{}'", path.display())
                });
            }
        };

        info!(
            "Loaded {} device(s) from registry '{}'.",
            contents.devices.len(),
            path.display()
        );

        Ok(Self {
            path,
            contents: Mutex::new(contents),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, contents: &RegistryFile) -> Result<()> {
        let json = serde_json::to_vec_pretty(contents)?;
        let temp_path = self
            .path
            .with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
        fs::write(&temp_path, &json)
            .await
            .with_context(|| format!("Failed to write '{}'", temp_path.display()))?;
        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e)
                .with_context(|| format!("Failed to replace '{}'", self.path.display()));
        }
        debug!("Device registry saved to {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl DeviceRegistry for JsonFileDeviceRegistry {
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        Ok(self.contents.lock().await.devices.clone())
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        Ok(self
            .contents
            .lock()
            .await
            .devices
            .iter()
            .find(|d| d.id == device_id)
            .cloned())
    }

    async fn update_liveness(
        &self,
        device_id: &str,
        is_online: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut contents = self.contents.lock().await;
        let Some(record) = contents.devices.iter_mut().find(|d| d.id == device_id) else {
            return Ok(());
        };
        if record.is_online == is_online && !is_online {
            return Ok(());
        }
        record.is_online = is_online;
        if is_online {
            record.last_seen = Some(at);
        }
        self.persist(&contents).await
    }
}
