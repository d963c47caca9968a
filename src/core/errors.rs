// src/core/errors.rs

//! Defines the primary error type for the connection manager and its links.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The main error enum, representing every failure a caller of the
/// `ConnectionManager` can observe.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Opening a link to the device failed.
    #[error("Connection to '{device_id}' failed: {reason}")]
    ConnectionFailed { device_id: String, reason: String },

    /// A command was issued against a device that is not connected and queueing was not allowed.
    #[error("Device '{0}' is not connected")]
    NotConnected(String),

    /// The device's command backlog is at capacity.
    #[error("Command queue for '{device_id}' is full ({capacity} pending)")]
    QueueFull { device_id: String, capacity: usize },

    /// A queued command waited longer than its timeout.
    #[error("Queued command for '{device_id}' timed out after {waited:?}")]
    QueueTimeout { device_id: String, waited: Duration },

    /// The connection was torn down while the command was still waiting.
    #[error("Connection to '{0}' was closed")]
    ConnectionClosed(String),

    /// The caller withdrew a queued command before it ran.
    #[error("Queued command for '{0}' was cancelled")]
    Cancelled(String),

    /// The link was up but the command itself failed.
    #[error("Command failed on '{device_id}': {reason}")]
    CommandFailed { device_id: String, reason: String },

    /// No entry and no registry record exist for the device.
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Operation timed out")]
    Timeout,
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
impl Clone for LinkError {
    fn clone(&self) -> Self {
        match self {
            LinkError::ConnectionFailed { device_id, reason } => LinkError::ConnectionFailed {
                device_id: device_id.clone(),
                reason: reason.clone(),
            },
            LinkError::NotConnected(s) => LinkError::NotConnected(s.clone()),
            LinkError::QueueFull {
                device_id,
                capacity,
            } => LinkError::QueueFull {
                device_id: device_id.clone(),
                capacity: *capacity,
            },
            LinkError::QueueTimeout { device_id, waited } => LinkError::QueueTimeout {
                device_id: device_id.clone(),
                waited: *waited,
            },
            LinkError::ConnectionClosed(s) => LinkError::ConnectionClosed(s.clone()),
            LinkError::Cancelled(s) => LinkError::Cancelled(s.clone()),
            LinkError::CommandFailed { device_id, reason } => LinkError::CommandFailed {
                device_id: device_id.clone(),
                reason: reason.clone(),
            },
            LinkError::UnknownDevice(s) => LinkError::UnknownDevice(s.clone()),
            LinkError::Io(e) => LinkError::Io(Arc::clone(e)),
            LinkError::Protocol(s) => LinkError::Protocol(s.clone()),
            LinkError::Timeout => LinkError::Timeout,
        }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        LinkError::Io(Arc::new(e))
    }
}

impl From<tokio::time::error::Elapsed> for LinkError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        LinkError::Timeout
    }
}

impl From<tokio_util::codec::LinesCodecError> for LinkError {
    fn from(e: tokio_util::codec::LinesCodecError) -> Self {
        match e {
            tokio_util::codec::LinesCodecError::Io(io) => io.into(),
            tokio_util::codec::LinesCodecError::MaxLineLengthExceeded => {
                LinkError::Protocol("reply exceeded the maximum line length".into())
            }
        }
    }
}

impl LinkError {
    /// Builds a `ConnectionFailed` error from a link-level failure.
    pub fn connection_failed(device_id: &str, cause: &LinkError) -> Self {
        LinkError::ConnectionFailed {
            device_id: device_id.to_string(),
            reason: cause.to_string(),
        }
    }

    /// Builds a `CommandFailed` error from a link-level failure.
    pub fn command_failed(device_id: &str, cause: &LinkError) -> Self {
        LinkError::CommandFailed {
            device_id: device_id.to_string(),
            reason: cause.to_string(),
        }
    }
}
