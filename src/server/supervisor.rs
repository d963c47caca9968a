// src/server/supervisor.rs

//! Contains the main service loop that waits for a termination signal and
//! performs the graceful shutdown.

use super::context::ServiceContext;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Runs until SIGINT/SIGTERM or a failed background task, then shuts down.
pub async fn run(mut ctx: ServiceContext, prewarm: bool) {
    // Pre-warming runs beside the loop so a slow device never delays signal handling.
    let prewarm_task = prewarm.then(|| {
        let manager = ctx.manager.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.prewarm().await {
                warn!("Pre-warming device connections failed: {}", e);
            }
        })
    });

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to register SIGINT handler: {}", e);
            return shutdown(ctx, prewarm_task).await;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            return shutdown(ctx, prewarm_task).await;
        }
    };

    loop {
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                break;
            }

            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => warn!("A background task finished unexpectedly without an error."),
                    Ok(Err(e)) => { error!("CRITICAL: Background task failed: {}. Shutting down.", e); break; }
                    Err(e) => { error!("CRITICAL: Background task panicked: {e:?}. Shutting down."); break; }
                }
            }
        }
    }

    shutdown(ctx, prewarm_task).await;
}

async fn shutdown(mut ctx: ServiceContext, prewarm_task: Option<JoinHandle<()>>) {
    if let Some(task) = prewarm_task {
        task.abort();
    }

    info!("Shutting down. Sending signal to all tasks.");
    if ctx.shutdown_tx.send(()).is_err() {
        warn!("No background task was listening for the shutdown signal.");
    }

    // Every device is disconnected and every queued command resolved before we return.
    ctx.manager.shutdown().await;

    if tokio::time::timeout(TASK_SHUTDOWN_GRACE, async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!(
            "Background tasks did not stop within {:?}; aborting them.",
            TASK_SHUTDOWN_GRACE
        );
        ctx.background_tasks.shutdown().await;
    }

    info!("Service shutdown complete.");
}
