// src/core/metrics.rs

//! Defines and registers Prometheus metrics for the connection manager.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, TextEncoder, register_counter, register_counter_vec,
    register_gauge,
};

lazy_static! {
    // --- Gauges, refreshed before every scrape ---
    /// Devices the manager currently tracks, in any state.
    pub static ref TRACKED_DEVICES: Gauge =
        register_gauge!("boxlink_tracked_devices", "Number of devices with a connection entry.").unwrap();
    /// Devices whose link is currently up.
    pub static ref CONNECTED_DEVICES: Gauge =
        register_gauge!("boxlink_connected_devices", "Number of devices with an open link.").unwrap();
    /// Commands waiting for a device to come back.
    pub static ref QUEUED_COMMANDS: Gauge =
        register_gauge!("boxlink_queued_commands", "Number of commands waiting in device queues.").unwrap();

    // --- Counters ---
    pub static ref CONNECT_ATTEMPTS_TOTAL: Counter =
        register_counter!("boxlink_connect_attempts_total", "Total number of link open attempts.").unwrap();
    pub static ref CONNECT_FAILURES_TOTAL: Counter =
        register_counter!("boxlink_connect_failures_total", "Total number of failed link open attempts.").unwrap();
    /// Commands that reached a device, labeled by command kind and outcome.
    pub static ref COMMANDS_TOTAL: CounterVec =
        register_counter_vec!("boxlink_commands_total", "Total number of commands sent to devices.", &["command", "outcome"]).unwrap();
    pub static ref QUEUE_REJECTIONS_TOTAL: Counter =
        register_counter!("boxlink_queue_rejections_total", "Total number of commands rejected because a queue was full.").unwrap();
    pub static ref QUEUE_TIMEOUTS_TOTAL: Counter =
        register_counter!("boxlink_queue_timeouts_total", "Total number of queued commands that timed out.").unwrap();
    pub static ref IDLE_EVICTIONS_TOTAL: Counter =
        register_counter!("boxlink_idle_evictions_total", "Total number of devices disconnected by the idle sweep.").unwrap();
    pub static ref LINK_DROPS_TOTAL: Counter =
        register_counter!("boxlink_link_drops_total", "Total number of links found dead while marked connected.").unwrap();
}

/// Gathers all registered metrics and encodes them into the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# failed to encode metrics: {e}\n"))
}
