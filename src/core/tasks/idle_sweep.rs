// src/core/tasks/idle_sweep.rs

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::core::connection::ConnectionManager;

/// A task that periodically evicts idle devices and expires stale queued commands.
pub struct IdleSweeper {
    manager: Arc<ConnectionManager>,
    interval: Duration,
}

impl IdleSweeper {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        let interval = manager.config().sweep_interval;
        Self { manager, interval }
    }

    /// Runs the sweep loop until shutdown is signalled or the manager is closed.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Idle sweeper started. Interval: {:?}. Inactivity threshold: {:?}.",
            self.interval,
            self.manager.config().idle_timeout
        );
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately; nothing can be idle yet.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.manager.is_closed() {
                        info!("Connection manager closed; idle sweeper exiting.");
                        return;
                    }
                    let report = self.manager.sweep_idle().await;
                    if report.evicted > 0 {
                        info!(
                            "Idle sweep evicted {} device(s); {} still tracked.",
                            report.evicted,
                            self.manager.connection_count()
                        );
                    } else {
                        debug!("Idle sweep pass: {:?}", report);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Idle sweeper shutting down.");
                    return;
                }
            }
        }
    }
}
