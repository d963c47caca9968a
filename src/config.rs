// src/config.rs

//! Manages service configuration: loading, defaults, and validation.

use crate::core::link::LinkOptions;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;

/// Tunables of the connection manager.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// The most commands a single device may have waiting for a connection.
    #[serde(default = "default_max_queue_len")]
    pub max_queue_len: usize,
    /// How long a queued command may wait before it fails with a timeout.
    #[serde(with = "humantime_serde", default = "default_queue_timeout")]
    pub queue_timeout: Duration,
    /// Devices without a successful command or connect for this long are disconnected.
    #[serde(with = "humantime_serde", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
    /// How often the idle sweep runs.
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
    /// Pause between consecutive replayed commands during a queue drain.
    #[serde(with = "humantime_serde", default = "default_drain_delay")]
    pub drain_delay: Duration,
    /// Pause between tearing a link down and reopening it on `reconnect`.
    #[serde(with = "humantime_serde", default = "default_reconnect_delay")]
    pub reconnect_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_queue_len: default_max_queue_len(),
            queue_timeout: default_queue_timeout(),
            idle_timeout: default_idle_timeout(),
            sweep_interval: default_sweep_interval(),
            drain_delay: default_drain_delay(),
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

fn default_max_queue_len() -> usize {
    50
}
fn default_queue_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_drain_delay() -> Duration {
    Duration::from_millis(50)
}
fn default_reconnect_delay() -> Duration {
    Duration::from_secs(1)
}

/// Where device records come from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Path of the JSON registry file. Without one, an empty in-memory registry is used.
    #[serde(default)]
    pub path: Option<String>,
    /// Connect to every registered device at startup.
    #[serde(default = "default_prewarm")]
    pub prewarm: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: None,
            prewarm: default_prewarm(),
        }
    }
}

fn default_prewarm() -> bool {
    true
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_port() -> u16 {
    9464
}

/// The complete service configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub link: LinkOptions,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            manager: ManagerConfig::default(),
            link: LinkOptions::default(),
            registry: RegistryConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to load configuration from '{path}'"))
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        let m = &self.manager;
        if m.max_queue_len == 0 {
            return Err(anyhow!("manager.max_queue_len cannot be 0"));
        }
        if m.queue_timeout.is_zero() {
            return Err(anyhow!("manager.queue_timeout cannot be 0"));
        }
        if m.idle_timeout.is_zero() {
            return Err(anyhow!("manager.idle_timeout cannot be 0"));
        }
        if m.sweep_interval.is_zero() {
            return Err(anyhow!("manager.sweep_interval cannot be 0"));
        }
        if m.sweep_interval > m.idle_timeout {
            warn!(
                "manager.sweep_interval ({:?}) is longer than manager.idle_timeout ({:?}); idle devices will linger past the timeout.",
                m.sweep_interval, m.idle_timeout
            );
        }

        if self.link.connect_timeout.is_zero() {
            return Err(anyhow!("link.connect_timeout cannot be 0"));
        }
        if self.link.command_timeout.is_zero() {
            return Err(anyhow!("link.command_timeout cannot be 0"));
        }

        if let Some(path) = &self.registry.path
            && path.trim().is_empty()
        {
            return Err(anyhow!("registry.path cannot be empty when set"));
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(anyhow!("metrics.port cannot be 0"));
        }
        Ok(())
    }
}
