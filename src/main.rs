//! chat-room: A TCP broadcast chat server
//!
//! Clients connect, bind a display name and post chat lines. Every chat
//! line is labelled with its author and broadcast to the whole room.
//!
//! Features:
//! - Length-prefixed binary framing with an 8-byte big-endian header
//! - Replay of the last 100 room messages to newly joined clients
//! - Raw binary or JSON payload codecs
//! - Several listening ports sharing one room
//! - Configuration via CLI arguments or TOML file

mod codec;
mod config;
mod connection;
mod frame;
mod room;
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

    let workers = config.workers.unwrap_or_else(num_cpus).max(1);

    info!(
        host = %config.host,
        ports = ?config.ports,
        listeners_per_port = config.listeners_per_port,
        workers,
        codec = ?config.codec,
        relay_unknown = config.relay_unknown,
        "Starting chat-room server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("chat-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async move { Server::new(config).run().await })?;
    Ok(())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
