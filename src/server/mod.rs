// src/server/mod.rs

//! The service's composition root: builds the collaborators, owns the one
//! `ConnectionManager` of the process, and runs until a shutdown signal arrives.

use crate::config::Config;
use anyhow::Result;

mod context;
mod initialization;
mod metrics_server;
mod spawner;
mod supervisor;

pub use context::ServiceContext;

/// The main service startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    // 1. Build the registry, link connector and connection manager.
    let mut context = initialization::setup(&config).await?;

    // 2. Spawn all background tasks.
    spawner::spawn_all(&mut context, &config)?;

    // 3. Connect to the registered devices, then supervise until shutdown.
    supervisor::run(context, config.registry.prewarm).await;

    Ok(())
}
