// src/server/spawner.rs

//! Spawns all of the service's long-running background tasks.

use super::context::ServiceContext;
use super::metrics_server;
use crate::config::Config;
use crate::core::tasks::idle_sweep::IdleSweeper;
use anyhow::Result;
use tracing::info;

/// Spawns all background tasks into the context's JoinSet.
pub fn spawn_all(ctx: &mut ServiceContext, config: &Config) -> Result<()> {
    let sweeper = IdleSweeper::new(ctx.manager.clone());
    let shutdown_rx_sweep = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        sweeper.run(shutdown_rx_sweep).await;
        Ok(())
    });

    if config.metrics.enabled {
        let manager = ctx.manager.clone();
        let port = config.metrics.port;
        let shutdown_rx_metrics = ctx.shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            metrics_server::run_metrics_server(manager, port, shutdown_rx_metrics).await
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    Ok(())
}
