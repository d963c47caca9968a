// src/server/context.rs

use crate::core::connection::ConnectionManager;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

/// Holds all the initialized state required to run the service's main loop.
pub struct ServiceContext {
    pub manager: Arc<ConnectionManager>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
}
