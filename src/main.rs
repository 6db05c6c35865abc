//! Sysmon - Host Information over HTTP
//!
//! This is the main entry point for the sysmon server.
//! It parses configuration, sets up logging and signal handling, and runs
//! the event loop until SIGINT or SIGTERM.

use anyhow::Context;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::sync::Arc;
use sysmon::{Config, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn print_banner(config: &Config, server: &Server) {
    println!(
        r#"
  ___ _   _ ___ _ __ ___   ___  _ __
 / __| | | / __| '_ ` _ \ / _ \| '_ \
 \__ \ |_| \__ \ | | | | | (_) | | | |
 |___/\__, |___/_| |_| |_|\___/|_| |_|
      |___/

sysmon v{} - Host Information over HTTP
──────────────────────────────────────────────────────────────
Listening on {} ({} backend, {} connection slots)
Endpoints: /smver /uname /cpu /info /all

Use Ctrl+C to shutdown gracefully.
"#,
        sysmon::VERSION,
        server.local_addr(),
        config.backend,
        server.pool_capacity(),
    );
}

fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();
    config.validate().context("invalid configuration")?;

    // Set up logging; RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let mut server = Server::bind(config.clone())
        .with_context(|| format!("failed to start on {}", config.address()))?;

    // Set up graceful shutdown
    let shutdown = server.shutdown_handle();
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .with_context(|| format!("failed to install handler for signal {signal}"))?;
    }

    print_banner(&config, &server);

    server.run().context("event loop failed")?;

    info!("Server shutdown complete");
    Ok(())
}
