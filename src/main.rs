// src/main.rs

//! The main entry point for the boxlink service.

use anyhow::Result;
use boxlink::config::Config;
use boxlink::server;
use std::env;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("boxlink version {VERSION}");
        return Ok(());
    }

    // The configuration file is optional; without one every setting takes its default.
    let mut config = match args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
    {
        Some(path) => match Config::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{path}\": {e:#}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    // Override the metrics port if provided as a command-line argument.
    if let Some(port_index) = args.iter().position(|arg| arg == "--metrics-port") {
        match args.get(port_index + 1).map(|s| s.parse::<u16>()) {
            Some(Ok(port)) => {
                config.metrics.enabled = true;
                config.metrics.port = port;
            }
            Some(Err(_)) => {
                eprintln!("Invalid port number: {}", args[port_index + 1]);
                std::process::exit(1);
            }
            None => {
                eprintln!("--metrics-port flag requires a value");
                std::process::exit(1);
            }
        }
    }

    // Get the log filter from the environment or the config.
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::registry()
        .with(EnvFilter::new(log_filter))
        .with(
            tracing_subscriber::fmt::layer()
                .compact() // Use the compact, single-line format.
                .with_ansi(true),
        )
        .init();

    info!("Starting boxlink {VERSION}");
    if let Err(e) = server::run(config).await {
        error!("Service runtime error: {}", e);
        return Err(e);
    }
    Ok(())
}
