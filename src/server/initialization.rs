// src/server/initialization.rs

//! Builds the service's collaborators from configuration.

use super::context::ServiceContext;
use crate::config::Config;
use crate::core::connection::ConnectionManager;
use crate::core::link::TcpLinkConnector;
use crate::core::registry::{DeviceRegistry, JsonFileDeviceRegistry, MemoryDeviceRegistry};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Initializes all service components before starting the main loop.
pub async fn setup(config: &Config) -> Result<ServiceContext> {
    log_startup_info(config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let registry = build_registry(config).await?;
    let manager = Arc::new(ConnectionManager::new(
        config.manager.clone(),
        config.link,
        Arc::new(TcpLinkConnector::new()),
        registry,
    ));
    info!("Connection manager initialized.");

    Ok(ServiceContext {
        manager,
        shutdown_tx,
        background_tasks: JoinSet::new(),
    })
}

async fn build_registry(config: &Config) -> Result<Arc<dyn DeviceRegistry>> {
    match &config.registry.path {
        Some(path) => Ok(Arc::new(JsonFileDeviceRegistry::open(path).await?)),
        None => {
            warn!("No registry.path configured; using an empty in-memory device registry.");
            Ok(Arc::new(MemoryDeviceRegistry::new()))
        }
    }
}

fn log_startup_info(config: &Config) {
    info!("boxlink version {}", env!("CARGO_PKG_VERSION"));
    let m = &config.manager;
    info!(
        "Queue: max {} per device, timeout {:?}. Idle timeout {:?}, sweep every {:?}.",
        m.max_queue_len, m.queue_timeout, m.idle_timeout, m.sweep_interval
    );
    info!(
        "Link timeouts: connect {:?}, command {:?}.",
        config.link.connect_timeout, config.link.command_timeout
    );
}
