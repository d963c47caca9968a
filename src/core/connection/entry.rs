// src/core/connection/entry.rs

//! Per-device connection bookkeeping.

use super::queue::CommandQueue;
use crate::core::link::{DeviceAddress, DeviceLink};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, TryLockError};

/// Where a device's connection is in its lifecycle.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// A point-in-time view of one device's connection, for diagnostics.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatusReport {
    pub device_id: String,
    pub address: DeviceAddress,
    pub status: ConnectionStatus,
    pub last_activity: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub idle_for: Duration,
    pub connection_attempts: u32,
    pub last_error: Option<String>,
    pub queued_commands: usize,
}

/// Fields readable without waiting for the device.
#[derive(Debug)]
struct EntryMeta {
    address: DeviceAddress,
    status: ConnectionStatus,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    connection_attempts: u32,
    last_error: Option<String>,
    queued: usize,
    /// Bumped every time a connect attempt finishes, successfully or not.
    connect_epoch: u64,
    /// Set when the most recent connect attempt failed, cleared when one succeeds.
    last_connect_error: Option<String>,
}

/// Everything that must only be touched by one task at a time: the link and the queue.
///
/// The session lock is held across connect attempts, command round-trips and
/// queue drains, which is what serializes all work on a single device.
#[derive(Debug)]
pub struct Session {
    pub link: Option<Arc<dyn DeviceLink>>,
    pub queue: CommandQueue,
    /// Set once the entry has been removed from the manager's map. A task that
    /// acquires the lock afterwards must look the device up again.
    pub retired: bool,
}

/// The manager's record of one device.
#[derive(Debug)]
pub struct ConnectionEntry {
    device_id: String,
    meta: Mutex<EntryMeta>,
    session: AsyncMutex<Session>,
}

impl ConnectionEntry {
    pub fn new(
        device_id: impl Into<String>,
        address: DeviceAddress,
        queue_capacity: usize,
        queue_timeout: Duration,
    ) -> Self {
        let device_id = device_id.into();
        Self {
            meta: Mutex::new(EntryMeta {
                address,
                status: ConnectionStatus::Disconnected,
                last_activity: Instant::now(),
                last_activity_at: Utc::now(),
                connection_attempts: 0,
                last_error: None,
                queued: 0,
                connect_epoch: 0,
                last_connect_error: None,
            }),
            session: AsyncMutex::new(Session {
                link: None,
                queue: CommandQueue::new(device_id.clone(), queue_capacity, queue_timeout),
                retired: false,
            }),
            device_id,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.meta.lock().status
    }

    pub fn address(&self) -> DeviceAddress {
        self.meta.lock().address.clone()
    }

    pub fn set_address(&self, address: DeviceAddress) {
        self.meta.lock().address = address;
    }

    pub fn connection_attempts(&self) -> u32 {
        self.meta.lock().connection_attempts
    }

    pub fn last_error(&self) -> Option<String> {
        self.meta.lock().last_error.clone()
    }

    pub fn connect_epoch(&self) -> u64 {
        self.meta.lock().connect_epoch
    }

    /// The error of the latest connect attempt, if an attempt finished after
    /// `epoch` and the latest one failed. Command failures never count here.
    pub fn connect_failure_since(&self, epoch: u64) -> Option<String> {
        let meta = self.meta.lock();
        if meta.connect_epoch == epoch {
            return None;
        }
        meta.last_connect_error.clone()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.meta.lock().last_activity)
    }

    /// Records a successful interaction with the device.
    pub fn touch(&self) {
        let mut meta = self.meta.lock();
        meta.last_activity = Instant::now();
        meta.last_activity_at = Utc::now();
    }

    pub fn mark_connecting(&self) {
        let mut meta = self.meta.lock();
        meta.status = ConnectionStatus::Connecting;
    }

    pub fn mark_connected(&self) {
        let mut meta = self.meta.lock();
        meta.status = ConnectionStatus::Connected;
        meta.connection_attempts = 0;
        meta.connect_epoch += 1;
        meta.last_connect_error = None;
        meta.last_error = None;
        meta.last_activity = Instant::now();
        meta.last_activity_at = Utc::now();
    }

    /// Moves the entry to `Error` after a failed command or a dropped link.
    pub fn mark_error(&self, error: impl Into<String>) {
        let mut meta = self.meta.lock();
        meta.status = ConnectionStatus::Error;
        meta.last_error = Some(error.into());
    }

    /// Moves the entry to `Error` after a failed connect attempt.
    pub fn mark_connect_failed(&self, error: impl Into<String>) {
        let error = error.into();
        let mut meta = self.meta.lock();
        meta.status = ConnectionStatus::Error;
        meta.connection_attempts = meta.connection_attempts.saturating_add(1);
        meta.connect_epoch += 1;
        meta.last_connect_error = Some(error.clone());
        meta.last_error = Some(error);
    }

    pub fn mark_disconnected(&self) {
        self.meta.lock().status = ConnectionStatus::Disconnected;
    }

    /// Mirrors the queue length so status reports never wait on the session lock.
    pub fn sync_queue_len(&self, len: usize) {
        self.meta.lock().queued = len;
    }

    pub fn queued_commands(&self) -> usize {
        self.meta.lock().queued
    }

    pub async fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().await
    }

    pub fn try_lock_session(&self) -> Result<MutexGuard<'_, Session>, TryLockError> {
        self.session.try_lock()
    }

    pub fn report(&self) -> ConnectionStatusReport {
        let meta = self.meta.lock();
        ConnectionStatusReport {
            device_id: self.device_id.clone(),
            address: meta.address.clone(),
            status: meta.status,
            last_activity: meta.last_activity_at,
            idle_for: meta.last_activity.elapsed(),
            connection_attempts: meta.connection_attempts,
            last_error: meta.last_error.clone(),
            queued_commands: meta.queued,
        }
    }
}
