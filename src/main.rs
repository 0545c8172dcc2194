//! ev-echo: A single-threaded TCP echo server
//!
//! Accepts TCP connections and writes every byte it receives back to the
//! same connection, until the peer disconnects.
//!
//! Features:
//! - One mio event loop (epoll on Linux, kqueue on macOS)
//! - Fixed-size buffer per connection
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        backlog = config.backlog,
        buffer_size = config.buffer_size,
        "Starting ev-echo server"
    );

    runtime::run(config)?;
    Ok(())
}
