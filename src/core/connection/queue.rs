// src/core/connection/queue.rs

//! The per-device backlog of commands waiting for a connection.
//!
//! Every queued command carries the sending half of a `oneshot` channel; the
//! caller keeps the receiving half inside a `QueuedHandle`. Whatever happens to
//! the command (it runs, it expires, it is cancelled, its device is dropped),
//! the queue resolves that sender exactly once, so no caller waits forever.

use crate::core::errors::LinkError;
use crate::core::link::{CommandReply, DeviceCommand};
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// The outcome delivered to a queued command's waiter.
pub type CommandResult = Result<CommandReply, LinkError>;

/// A command waiting in a device's queue.
#[derive(Debug)]
pub struct QueuedCommand {
    pub id: Uuid,
    pub command: DeviceCommand,
    pub enqueued_at: Instant,
    /// Execution attempts already made for this command.
    pub retries: u32,
    waiter: oneshot::Sender<CommandResult>,
}

impl QueuedCommand {
    fn new(device_id: &str, command: DeviceCommand) -> (Self, QueuedHandle) {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let queued = Self {
            id,
            command,
            enqueued_at: Instant::now(),
            retries: 0,
            waiter: tx,
        };
        let handle = QueuedHandle {
            id,
            device_id: device_id.to_string(),
            rx,
        };
        (queued, handle)
    }

    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.enqueued_at) >= timeout
    }

    /// Delivers the final result. A caller that dropped its handle simply never sees it.
    pub fn resolve(self, result: CommandResult) {
        let _ = self.waiter.send(result);
    }
}

/// A caller's claim on a command that was queued instead of executed.
///
/// Queued is not done: the command has not reached the device yet.
#[must_use = "a queued command has not run yet; await `wait()` or call `detach()`"]
#[derive(Debug)]
pub struct QueuedHandle {
    id: Uuid,
    device_id: String,
    rx: oneshot::Receiver<CommandResult>,
}

impl QueuedHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Waits until the command runs, times out, or is abandoned.
    pub async fn wait(self) -> CommandResult {
        match self.rx.await {
            Ok(result) => result,
            // The sender can only vanish without a result if the queue itself was dropped.
            Err(_) => Err(LinkError::ConnectionClosed(self.device_id)),
        }
    }

    /// Gives up interest in the result. The command still runs when the device comes back.
    pub fn detach(self) {
        debug!(
            "Detached from queued command {} for '{}'",
            self.id, self.device_id
        );
    }

    /// Returns the result if it is already available, without waiting.
    pub fn try_result(&mut self) -> Option<CommandResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(LinkError::ConnectionClosed(self.device_id.clone())))
            }
        }
    }
}

/// Counts of what happened during one queue drain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    pub succeeded: usize,
    pub failed: usize,
    pub expired: usize,
    /// True if the connection died and the remaining commands were left queued.
    pub halted: bool,
}

/// A bounded FIFO of commands for one device.
#[derive(Debug)]
pub struct CommandQueue {
    device_id: String,
    items: VecDeque<QueuedCommand>,
    capacity: usize,
    timeout: Duration,
}

impl CommandQueue {
    pub fn new(device_id: impl Into<String>, capacity: usize, timeout: Duration) -> Self {
        Self {
            device_id: device_id.into(),
            items: VecDeque::new(),
            capacity,
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Ids of the queued commands in execution order.
    pub fn pending_ids(&self) -> Vec<Uuid> {
        self.items.iter().map(|c| c.id).collect()
    }

    /// Appends a command. Expired commands are purged first; a queue still at
    /// capacity after that rejects the new command and keeps the existing ones.
    pub fn enqueue(&mut self, command: DeviceCommand) -> Result<QueuedHandle, LinkError> {
        self.expire(Instant::now());
        if self.items.len() >= self.capacity {
            return Err(LinkError::QueueFull {
                device_id: self.device_id.clone(),
                capacity: self.capacity,
            });
        }
        let (queued, handle) = QueuedCommand::new(&self.device_id, command);
        debug!(
            "Queued {} command {} for '{}' ({} pending)",
            queued.command.name(),
            queued.id,
            self.device_id,
            self.items.len() + 1
        );
        self.items.push_back(queued);
        Ok(handle)
    }

    pub fn pop_front(&mut self) -> Option<QueuedCommand> {
        self.items.pop_front()
    }

    /// Removes every command that has waited at least the queue timeout and fails
    /// it with `QueueTimeout`. Returns how many were removed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let mut expired = 0;
        let mut kept = VecDeque::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if item.is_expired(now, timeout) {
                let waited = now.saturating_duration_since(item.enqueued_at);
                item.resolve(Err(LinkError::QueueTimeout {
                    device_id: self.device_id.clone(),
                    waited,
                }));
                expired += 1;
            } else {
                kept.push_back(item);
            }
        }
        self.items = kept;
        if expired > 0 {
            debug!(
                "Expired {} queued command(s) for '{}'",
                expired, self.device_id
            );
        }
        expired
    }

    /// Fails every queued command with `reason` and empties the queue.
    pub fn fail_all(&mut self, reason: LinkError) -> usize {
        let count = self.items.len();
        for item in self.items.drain(..) {
            item.resolve(Err(reason.clone()));
        }
        count
    }

    /// Removes a single command, failing its waiter with `Cancelled`.
    pub fn cancel(&mut self, id: Uuid) -> bool {
        let Some(pos) = self.items.iter().position(|c| c.id == id) else {
            return false;
        };
        if let Some(item) = self.items.remove(pos) {
            item.resolve(Err(LinkError::Cancelled(self.device_id.clone())));
        }
        true
    }

    /// Pops and runs commands in FIFO order until the queue is empty or the
    /// executor reports that the connection died.
    ///
    /// `execute` returns the command's result and whether the connection is still
    /// alive afterwards. The command that was running when the connection died is
    /// resolved with its own result; everything behind it stays queued. `delay`
    /// is slept between consecutive commands.
    pub async fn drain<F, Fut>(&mut self, delay: Duration, mut execute: F) -> DrainOutcome
    where
        F: FnMut(DeviceCommand) -> Fut,
        Fut: Future<Output = (CommandResult, bool)>,
    {
        let mut outcome = DrainOutcome {
            expired: self.expire(Instant::now()),
            ..Default::default()
        };

        while let Some(mut item) = self.items.pop_front() {
            if item.is_expired(Instant::now(), self.timeout) {
                let waited = item.enqueued_at.elapsed();
                item.resolve(Err(LinkError::QueueTimeout {
                    device_id: self.device_id.clone(),
                    waited,
                }));
                outcome.expired += 1;
                continue;
            }

            item.retries += 1;
            let (result, alive) = execute(item.command.clone()).await;
            if result.is_ok() {
                outcome.succeeded += 1;
            } else {
                outcome.failed += 1;
            }
            debug!(
                "Replayed queued command {} for '{}' (attempt {}): {}",
                item.id,
                self.device_id,
                item.retries,
                if result.is_ok() { "ok" } else { "failed" }
            );
            item.resolve(result);

            if !alive {
                outcome.halted = true;
                break;
            }
            if !self.items.is_empty() && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        outcome
    }
}
