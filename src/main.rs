//! policyd: a cross-domain socket policy server
//!
//! Answers the policy file request that sandboxed web players (Unity3D,
//! Flash) send before opening a socket to another host, plus a one-shot
//! `PING` liveness check. One request per connection.
//!
//! Features:
//! - Per-phase read and write deadlines
//! - Bounded, shared request buffer pool
//! - Configuration via CLI arguments or TOML file

mod buffer;
mod config;
mod protocol;
mod server;

use config::Config;
use server::Server;
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
        listen = %config.listen,
        timeout_secs = config.timeout.as_secs(),
        max_connections = config.max_connections,
        workers = ?config.workers,
        buffer_size = config.buffer_size,
        pool_size = config.pool_size,
        "Starting policyd"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    let server = Server::new(config);
    runtime.block_on(server.run())
}
