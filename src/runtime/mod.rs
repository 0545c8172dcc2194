//! Single-threaded, readiness-driven echo runtime.
//!
//! - `socket`: listening socket setup
//! - `buffer`: fixed-capacity per-connection echo buffer
//! - `connection`: connection state and the slab-backed registry
//! - `event_loop`: mio reactor with the accept and echo handlers

mod buffer;
mod connection;
mod event_loop;
mod socket;

pub use event_loop::EventLoop;

use crate::config::Config;
use tracing::info;

/// Bind the listener and serve connections until the process is stopped.
pub fn run(config: Config) -> std::io::Result<()> {
    let mut event_loop = EventLoop::bind(&config)?;

    info!(
        addr = %event_loop.local_addr()?,
        backlog = config.backlog,
        buffer_size = config.buffer_size,
        "Echo server listening"
    );

    event_loop.run()
}
