// src/core/link/tcp.rs

//! A `DeviceLink` speaking a newline-delimited text protocol over TCP.
//!
//! Each request is one line produced by `DeviceCommand::to_wire`. The device
//! answers with exactly one line: `OK` optionally followed by a payload, or
//! `ERR <message>`. An `ERR` reply fails the command but leaves the link usable;
//! socket errors, EOF and read timeouts mark the link dead.

use super::{CommandReply, DeviceAddress, DeviceCommand, DeviceLink, LinkConnector, LinkOptions};
use crate::core::errors::LinkError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;

const MAX_REPLY_LINE: usize = 64 * 1024;

/// Opens `TcpLink`s, performing a `PING` handshake before handing a link out.
#[derive(Debug, Default, Clone)]
pub struct TcpLinkConnector;

impl TcpLinkConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LinkConnector for TcpLinkConnector {
    async fn open(
        &self,
        address: &DeviceAddress,
        options: &LinkOptions,
    ) -> Result<Arc<dyn DeviceLink>, LinkError> {
        let link = TcpLink::connect(address, options).await?;
        Ok(Arc::new(link))
    }
}

/// An open TCP control channel.
#[derive(Debug)]
pub struct TcpLink {
    address: DeviceAddress,
    framed: Mutex<Option<Framed<TcpStream, LinesCodec>>>,
    alive: AtomicBool,
    command_timeout: Duration,
}

impl TcpLink {
    /// Connects to `address` and verifies the device answers a `PING`, all
    /// within the configured connect timeout.
    pub async fn connect(address: &DeviceAddress, options: &LinkOptions) -> Result<Self, LinkError> {
        let handshake = async {
            let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
            stream.set_nodelay(true)?;
            let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_REPLY_LINE));
            framed.send(DeviceCommand::Ping.to_wire()).await?;
            match framed.next().await {
                Some(Ok(line)) if line.starts_with("OK") => Ok(framed),
                Some(Ok(line)) => Err(LinkError::Protocol(format!(
                    "unexpected handshake reply '{line}'"
                ))),
                Some(Err(e)) => Err(e.into()),
                None => Err(LinkError::Protocol(
                    "connection closed during handshake".into(),
                )),
            }
        };

        let framed = tokio::time::timeout(options.connect_timeout, handshake).await??;
        debug!("TCP link to {} established", address);

        Ok(Self {
            address: address.clone(),
            framed: Mutex::new(Some(framed)),
            alive: AtomicBool::new(true),
            command_timeout: options.command_timeout,
        })
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceLink for TcpLink {
    async fn send(&self, command: &DeviceCommand) -> Result<CommandReply, LinkError> {
        let mut guard = self.framed.lock().await;
        let framed = guard
            .as_mut()
            .ok_or_else(|| LinkError::Protocol(format!("link to {} is closed", self.address)))?;

        if let Err(e) = framed.send(command.to_wire()).await {
            self.mark_dead();
            return Err(e.into());
        }

        let reply = match tokio::time::timeout(self.command_timeout, framed.next()).await {
            Ok(Some(Ok(line))) => line,
            Ok(Some(Err(e))) => {
                self.mark_dead();
                return Err(e.into());
            }
            Ok(None) => {
                self.mark_dead();
                return Err(LinkError::Protocol("connection closed by peer".into()));
            }
            Err(_) => {
                // The reply may still arrive later and desynchronize the stream.
                self.mark_dead();
                return Err(LinkError::Timeout);
            }
        };

        if let Some(rest) = reply.strip_prefix("OK") {
            Ok(CommandReply::new(rest.trim_start()))
        } else if let Some(msg) = reply.strip_prefix("ERR") {
            Err(LinkError::Protocol(msg.trim_start().to_string()))
        } else {
            Err(LinkError::Protocol(format!("unexpected reply '{reply}'")))
        }
    }

    async fn close(&self) -> Result<(), LinkError> {
        self.mark_dead();
        if let Some(mut framed) = self.framed.lock().await.take() {
            SinkExt::<String>::close(&mut framed).await?;
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
