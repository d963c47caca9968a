// src/core/connection/manager.rs

//! The `ConnectionManager`: one instance per process, owning every device's
//! connection entry.
//!
//! # Locking
//!
//! Two levels of locking keep devices independent of each other:
//!
//! - The device-id → entry map is a `DashMap`. Entries are created with an
//!   atomic `entry().or_insert_with()`, and no shard guard is ever held across
//!   an `.await`.
//! - Each entry has an async session lock held for the whole of a connect
//!   attempt, a command round-trip or a queue drain. Only one of those runs per
//!   device at a time, and a slow device never blocks another one.
//!
//! Removing an entry (disconnect, idle sweep, shutdown) happens while holding its
//! session lock and marks the session `retired`. A task that was waiting on that
//! lock sees the flag and resolves the device again from the map.

use super::entry::{ConnectionEntry, ConnectionStatus, ConnectionStatusReport, Session};
use super::queue::{CommandResult, QueuedHandle};
use crate::config::ManagerConfig;
use crate::core::errors::LinkError;
use crate::core::link::{CommandReply, DeviceAddress, DeviceCommand, DeviceLink, LinkConnector, LinkOptions};
use crate::core::metrics;
use crate::core::registry::DeviceRegistry;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-call options for `execute_command`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Queue the command if the device is not connected instead of failing.
    pub allow_queue: bool,
}

impl ExecuteOptions {
    pub fn queued() -> Self {
        Self { allow_queue: true }
    }

    pub fn immediate() -> Self {
        Self { allow_queue: false }
    }
}

/// The result of `execute_command`.
#[derive(Debug)]
pub enum Execution {
    /// The command ran against a live link.
    Completed(CommandReply),
    /// The device was down; the command waits in its queue.
    Queued(QueuedHandle),
}

impl Execution {
    /// Resolves to the command's final result, waiting on the queue if necessary.
    pub async fn into_result(self) -> CommandResult {
        match self {
            Execution::Completed(reply) => Ok(reply),
            Execution::Queued(handle) => handle.wait().await,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Execution::Queued(_))
    }
}

/// What one idle-sweep pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub expired_commands: usize,
    pub dropped_links: usize,
    /// Devices with queued commands that were reconnected and replayed.
    pub reconnected: usize,
}

/// The outcome of connecting to every registered device at startup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PrewarmSummary {
    pub connected: usize,
    pub failed: usize,
}

pub struct ConnectionManager {
    entries: DashMap<String, Arc<ConnectionEntry>>,
    connector: Arc<dyn LinkConnector>,
    registry: Arc<dyn DeviceRegistry>,
    config: ManagerConfig,
    link_options: LinkOptions,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        config: ManagerConfig,
        link_options: LinkOptions,
        connector: Arc<dyn LinkConnector>,
        registry: Arc<dyn DeviceRegistry>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            connector,
            registry,
            config,
            link_options,
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the device's link, opening one if the device is not connected.
    ///
    /// Concurrent callers for the same device share one attempt: whoever gets the
    /// session lock first connects, the others wait and then either reuse the new
    /// link or receive the failure of the attempt they waited on.
    pub async fn get_or_create_connection(
        &self,
        device_id: &str,
        address: DeviceAddress,
    ) -> Result<Arc<dyn DeviceLink>, LinkError> {
        loop {
            self.ensure_open(device_id)?;
            let entry = self.entry_for(device_id, &address);
            let epoch_before = entry.connect_epoch();

            let mut session = entry.lock_session().await;
            if session.retired {
                continue;
            }
            if self.is_closed() {
                self.retire_locked(&entry, &mut session).await;
                return Err(LinkError::ConnectionClosed(device_id.to_string()));
            }

            if let Some(link) = self.live_link(&entry, &session) {
                entry.touch();
                debug!("Reusing existing link for '{}'", device_id);
                return Ok(link);
            }

            // A connect attempt finished while we waited for the lock and failed: share its outcome.
            if let Some(reason) = entry.connect_failure_since(epoch_before) {
                return Err(LinkError::ConnectionFailed {
                    device_id: device_id.to_string(),
                    reason,
                });
            }

            entry.set_address(address.clone());
            return self.connect_locked(&entry, &mut session).await;
        }
    }

    /// Runs `command` on the device, opening a link first if the device is not
    /// connected. If the device cannot be reached the command is queued when
    /// `options.allow_queue` is set, and rejected with `NotConnected` otherwise.
    pub async fn execute_command(
        &self,
        device_id: &str,
        command: DeviceCommand,
        options: ExecuteOptions,
    ) -> Result<Execution, LinkError> {
        loop {
            self.ensure_open(device_id)?;
            let entry = match self.tracked_entry(device_id) {
                Some(entry) => entry,
                None => {
                    let address = self.lookup_address(device_id).await?;
                    self.entry_for(device_id, &address)
                }
            };
            let epoch_before = entry.connect_epoch();

            let mut session = entry.lock_session().await;
            if session.retired {
                continue;
            }
            if self.is_closed() {
                self.retire_locked(&entry, &mut session).await;
                return Err(LinkError::ConnectionClosed(device_id.to_string()));
            }

            if let Some(link) = self.live_link(&entry, &session) {
                return self
                    .run_direct(&entry, link.as_ref(), &command)
                    .await
                    .map(Execution::Completed);
            }

            // Dial unless an attempt failed while we waited; earlier queued commands replay first.
            match entry.connect_failure_since(epoch_before) {
                Some(reason) => debug!(
                    "Not dialing '{}' again; the attempt just made failed: {}",
                    device_id, reason
                ),
                None => {
                    if let Err(e) = self.connect_locked(&entry, &mut session).await {
                        debug!("Connect on demand for '{}' failed: {}", device_id, e);
                    }
                    if let Some(link) = self.live_link(&entry, &session) {
                        return self
                            .run_direct(&entry, link.as_ref(), &command)
                            .await
                            .map(Execution::Completed);
                    }
                }
            }

            if !options.allow_queue {
                return Err(LinkError::NotConnected(device_id.to_string()));
            }

            let result = session.queue.enqueue(command);
            entry.sync_queue_len(session.queue.len());
            return match result {
                Ok(handle) => {
                    info!(
                        "Device '{}' is {}; command queued ({} pending)",
                        device_id,
                        entry.status(),
                        session.queue.len()
                    );
                    Ok(Execution::Queued(handle))
                }
                Err(e) => {
                    metrics::QUEUE_REJECTIONS_TOTAL.inc();
                    warn!("Rejected command for '{}': {}", device_id, e);
                    Err(e)
                }
            };
        }
    }

    /// Closes the device's link, removes its entry and fails its queued commands
    /// with `ConnectionClosed`. Returns whether the device was tracked.
    pub async fn disconnect(&self, device_id: &str) -> bool {
        let removed = match self.tracked_entry(device_id) {
            Some(entry) => {
                let mut session = entry.lock_session().await;
                if session.retired {
                    false
                } else {
                    self.retire_locked(&entry, &mut session).await;
                    true
                }
            }
            None => false,
        };

        if removed {
            info!("Disconnected device '{}'", device_id);
        }
        self.persist_liveness(device_id, false).await;
        removed
    }

    /// Drops the current link, waits `reconnect_delay`, then connects again.
    ///
    /// Unlike `disconnect`, the entry and its queue survive: commands queued before
    /// the reconnect are replayed once the new link is up.
    pub async fn reconnect(&self, device_id: &str) -> Result<Arc<dyn DeviceLink>, LinkError> {
        self.ensure_open(device_id)?;
        let address = match self.tracked_entry(device_id) {
            Some(entry) => {
                let mut session = entry.lock_session().await;
                if !session.retired {
                    Self::close_link(device_id, &mut session).await;
                    entry.mark_disconnected();
                }
                entry.address()
            }
            None => self.lookup_address(device_id).await?,
        };

        info!(
            "Reconnecting to '{}' at {} in {:?}",
            device_id, address, self.config.reconnect_delay
        );
        tokio::time::sleep(self.config.reconnect_delay).await;
        self.get_or_create_connection(device_id, address).await
    }

    /// Disconnects every tracked device. Safe to call repeatedly and concurrently.
    pub async fn disconnect_all(&self) -> usize {
        let ids = self.tracked_devices();
        if ids.is_empty() {
            return 0;
        }
        info!("Disconnecting {} device(s)", ids.len());
        let results = join_all(ids.iter().map(|id| self.disconnect(id))).await;
        results.into_iter().filter(|removed| *removed).count()
    }

    /// Rejects all further work, then disconnects every device.
    pub async fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Connection manager shutting down.");
        }
        self.disconnect_all().await;
    }

    pub fn get_connection_status(&self, device_id: &str) -> Option<ConnectionStatusReport> {
        self.tracked_entry(device_id).map(|entry| entry.report())
    }

    /// Ids of all tracked devices, sorted.
    pub fn tracked_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn connection_count(&self) -> usize {
        self.entries.len()
    }

    /// Withdraws a queued command. Returns false if it already ran or never existed.
    pub async fn cancel_queued(&self, device_id: &str, command_id: Uuid) -> bool {
        let Some(entry) = self.tracked_entry(device_id) else {
            return false;
        };
        let mut session = entry.lock_session().await;
        if session.retired {
            return false;
        }
        let cancelled = session.queue.cancel(command_id);
        entry.sync_queue_len(session.queue.len());
        cancelled
    }

    /// Connects to every device in the registry concurrently.
    pub async fn prewarm(&self) -> anyhow::Result<PrewarmSummary> {
        let devices = self.registry.list_devices().await?;
        info!("Pre-warming connections to {} device(s)", devices.len());

        let results = join_all(devices.iter().map(|device| {
            self.get_or_create_connection(&device.id, device.device_address())
        }))
        .await;

        let mut summary = PrewarmSummary::default();
        for (device, result) in devices.iter().zip(results) {
            match result {
                Ok(_) => summary.connected += 1,
                Err(e) => {
                    summary.failed += 1;
                    debug!("Pre-warm of '{}' failed: {}", device.id, e);
                }
            }
        }
        info!(
            "Pre-warm finished: {} connected, {} unreachable",
            summary.connected, summary.failed
        );
        Ok(summary)
    }

    /// One idle-sweep pass.
    ///
    /// Entries idle beyond `idle_timeout` are evicted. The remaining ones have
    /// their expired queued commands failed, and links that died while marked
    /// connected are closed so the next access reconnects. Entries whose session
    /// is busy are skipped; they are in use and therefore not idle.
    ///
    /// Finally, every device that still has queued commands but no link gets a
    /// connect attempt, so its queue replays without waiting for a caller.
    pub async fn sweep_idle(&self) -> SweepReport {
        let now = Instant::now();
        let candidates: Vec<Arc<ConnectionEntry>> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        let mut report = SweepReport::default();

        for entry in candidates {
            let Ok(mut session) = entry.try_lock_session() else {
                continue;
            };
            if session.retired {
                continue;
            }

            if entry.idle_for(now) >= self.config.idle_timeout {
                info!(
                    "Evicting '{}' after {:?} of inactivity",
                    entry.device_id(),
                    entry.idle_for(now)
                );
                self.retire_locked(&entry, &mut session).await;
                drop(session);
                metrics::IDLE_EVICTIONS_TOTAL.inc();
                self.persist_liveness(entry.device_id(), false).await;
                report.evicted += 1;
                continue;
            }

            let expired = session.queue.expire(now);
            if expired > 0 {
                metrics::QUEUE_TIMEOUTS_TOTAL.inc_by(expired as f64);
                entry.sync_queue_len(session.queue.len());
                report.expired_commands += expired;
            }

            let dead_link = session.link.as_ref().is_some_and(|link| !link.is_alive());
            if dead_link && entry.status() == ConnectionStatus::Connected {
                warn!("Link to '{}' dropped; closing it", entry.device_id());
                metrics::LINK_DROPS_TOTAL.inc();
                entry.mark_error("link dropped");
                Self::close_link(entry.device_id(), &mut session).await;
                report.dropped_links += 1;
            }
        }

        report.reconnected = self.reconnect_pending().await;

        if report != SweepReport::default() {
            debug!("Idle sweep: {:?}", report);
        }
        report
    }

    /// Reconnects, concurrently, every device whose queue is waiting for a link.
    async fn reconnect_pending(&self) -> usize {
        let pending: Vec<Arc<ConnectionEntry>> = self
            .entries
            .iter()
            .filter(|e| e.queued_commands() > 0)
            .map(|e| e.value().clone())
            .collect();
        if pending.is_empty() {
            return 0;
        }
        let results = join_all(pending.iter().map(|entry| self.replay_queue(entry))).await;
        results.into_iter().filter(|replayed| *replayed).count()
    }

    async fn replay_queue(&self, entry: &Arc<ConnectionEntry>) -> bool {
        let Ok(mut session) = entry.try_lock_session() else {
            return false;
        };
        if session.retired || self.is_closed() || session.queue.is_empty() {
            return false;
        }
        if self.live_link(entry, &session).is_some() {
            return false;
        }
        match self.connect_locked(entry, &mut session).await {
            Ok(_) => true,
            Err(e) => {
                debug!(
                    "Reconnect of '{}' for {} queued command(s) failed: {}",
                    entry.device_id(),
                    session.queue.len(),
                    e
                );
                false
            }
        }
    }

    /// Refreshes the gauges exported on the metrics endpoint.
    pub fn refresh_gauges(&self) {
        let mut connected = 0usize;
        let mut queued = 0usize;
        for entry in self.entries.iter() {
            if entry.status() == ConnectionStatus::Connected {
                connected += 1;
            }
            queued += entry.queued_commands();
        }
        metrics::TRACKED_DEVICES.set(self.entries.len() as f64);
        metrics::CONNECTED_DEVICES.set(connected as f64);
        metrics::QUEUED_COMMANDS.set(queued as f64);
    }

    fn ensure_open(&self, device_id: &str) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::ConnectionClosed(device_id.to_string()));
        }
        Ok(())
    }

    fn tracked_entry(&self, device_id: &str) -> Option<Arc<ConnectionEntry>> {
        self.entries.get(device_id).map(|e| e.value().clone())
    }

    /// Returns the device's entry, inserting a fresh one atomically if none exists.
    fn entry_for(&self, device_id: &str, address: &DeviceAddress) -> Arc<ConnectionEntry> {
        self.entries
            .entry(device_id.to_string())
            .or_insert_with(|| {
                debug!("Tracking new device '{}' at {}", device_id, address);
                Arc::new(ConnectionEntry::new(
                    device_id,
                    address.clone(),
                    self.config.max_queue_len,
                    self.config.queue_timeout,
                ))
            })
            .value()
            .clone()
    }

    async fn lookup_address(&self, device_id: &str) -> Result<DeviceAddress, LinkError> {
        match self.registry.get_device(device_id).await {
            Ok(Some(record)) => Ok(record.device_address()),
            Ok(None) => Err(LinkError::UnknownDevice(device_id.to_string())),
            Err(e) => {
                warn!("Device registry lookup for '{}' failed: {}", device_id, e);
                Err(LinkError::UnknownDevice(device_id.to_string()))
            }
        }
    }

    /// The entry's link, if it is marked connected and still alive.
    fn live_link(&self, entry: &ConnectionEntry, session: &Session) -> Option<Arc<dyn DeviceLink>> {
        let link = session.link.as_ref()?;
        if entry.status() != ConnectionStatus::Connected {
            return None;
        }
        if !link.is_alive() {
            warn!("Link to '{}' is no longer alive", entry.device_id());
            metrics::LINK_DROPS_TOTAL.inc();
            entry.mark_error("link dropped");
            return None;
        }
        Some(link.clone())
    }

    async fn connect_locked(
        &self,
        entry: &Arc<ConnectionEntry>,
        session: &mut Session,
    ) -> Result<Arc<dyn DeviceLink>, LinkError> {
        let device_id = entry.device_id();
        Self::close_link(device_id, session).await;

        entry.mark_connecting();
        let address = entry.address();
        info!("Connecting to '{}' at {}", device_id, address);
        metrics::CONNECT_ATTEMPTS_TOTAL.inc();

        match self.connector.open(&address, &self.link_options).await {
            Ok(link) => {
                session.link = Some(link.clone());
                entry.mark_connected();
                info!("Connected to '{}' at {}", device_id, address);
                self.persist_liveness(device_id, true).await;
                self.drain_locked(entry, session, &link).await;
                Ok(link)
            }
            Err(e) => {
                entry.mark_connect_failed(e.to_string());
                metrics::CONNECT_FAILURES_TOTAL.inc();
                warn!(
                    "Connection to '{}' at {} failed (attempt {}): {}",
                    device_id,
                    address,
                    entry.connection_attempts(),
                    e
                );
                self.persist_liveness(device_id, false).await;
                Err(LinkError::connection_failed(device_id, &e))
            }
        }
    }

    /// Replays the entry's queued commands over a freshly opened link.
    async fn drain_locked(
        &self,
        entry: &Arc<ConnectionEntry>,
        session: &mut Session,
        link: &Arc<dyn DeviceLink>,
    ) {
        if session.queue.is_empty() {
            return;
        }
        let device_id = entry.device_id();
        info!(
            "Replaying {} queued command(s) for '{}'",
            session.queue.len(),
            device_id
        );

        let outcome = session
            .queue
            .drain(self.config.drain_delay, |command| {
                let link = link.clone();
                let entry = entry.clone();
                async move {
                    let result = Self::send_and_record(&entry, link.as_ref(), &command).await;
                    (result, link.is_alive())
                }
            })
            .await;

        entry.sync_queue_len(session.queue.len());
        if outcome.expired > 0 {
            metrics::QUEUE_TIMEOUTS_TOTAL.inc_by(outcome.expired as f64);
        }

        if outcome.halted {
            warn!(
                "Link to '{}' dropped during queue replay; {} command(s) stay queued",
                device_id,
                session.queue.len()
            );
            metrics::LINK_DROPS_TOTAL.inc();
            entry.mark_error("link dropped during queue replay");
            Self::close_link(device_id, session).await;
        } else {
            info!(
                "Queue replay for '{}' done: {} succeeded, {} failed, {} expired",
                device_id, outcome.succeeded, outcome.failed, outcome.expired
            );
        }
    }

    async fn run_direct(
        &self,
        entry: &ConnectionEntry,
        link: &dyn DeviceLink,
        command: &DeviceCommand,
    ) -> Result<CommandReply, LinkError> {
        let result = Self::send_and_record(entry, link, command).await;
        if let Err(e) = &result {
            // The next access reconnects instead of reusing a suspect link.
            entry.mark_error(e.to_string());
            warn!("Command on '{}' failed: {}", entry.device_id(), e);
        }
        result
    }

    /// Sends one command, refreshing activity on success and counting the outcome.
    async fn send_and_record(
        entry: &ConnectionEntry,
        link: &dyn DeviceLink,
        command: &DeviceCommand,
    ) -> Result<CommandReply, LinkError> {
        match link.send(command).await {
            Ok(reply) => {
                entry.touch();
                metrics::COMMANDS_TOTAL
                    .with_label_values(&[command.name(), "ok"])
                    .inc();
                debug!("'{}' <- {}: ok", entry.device_id(), command.name());
                Ok(reply)
            }
            Err(e) => {
                metrics::COMMANDS_TOTAL
                    .with_label_values(&[command.name(), "error"])
                    .inc();
                Err(LinkError::command_failed(entry.device_id(), &e))
            }
        }
    }

    /// Closes and forgets the session's link, logging rather than propagating close errors.
    async fn close_link(device_id: &str, session: &mut Session) {
        if let Some(link) = session.link.take()
            && let Err(e) = link.close().await
        {
            warn!("Error while closing link to '{}': {}", device_id, e);
        }
    }

    /// Tears an entry down: fails its queue, closes its link, marks it retired and
    /// removes it from the map. Must be called with the entry's session lock held.
    async fn retire_locked(&self, entry: &Arc<ConnectionEntry>, session: &mut Session) {
        let device_id = entry.device_id();
        session.retired = true;
        let failed = session
            .queue
            .fail_all(LinkError::ConnectionClosed(device_id.to_string()));
        if failed > 0 {
            info!(
                "Failed {} queued command(s) for '{}': connection closed",
                failed, device_id
            );
        }
        entry.sync_queue_len(0);
        Self::close_link(device_id, session).await;
        entry.mark_disconnected();
        self.entries
            .remove_if(device_id, |_, current| Arc::ptr_eq(current, entry));
    }

    async fn persist_liveness(&self, device_id: &str, is_online: bool) {
        if let Err(e) = self
            .registry
            .update_liveness(device_id, is_online, Utc::now())
            .await
        {
            warn!(
                "Failed to record liveness={} for '{}': {}",
                is_online, device_id, e
            );
        }
    }
}
