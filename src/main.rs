//! hashjam: a reactor-style TCP server for iterated hash requests
//!
//! Architecture:
//! - acceptor threads share the listen port via SO_REUSEPORT and distribute
//!   connections round-robin across worker event loops
//! - each worker owns a private mio poll and its connections for their whole
//!   lifetime; cross-thread work arrives as tasks on the worker's queue
//! - request digests run on a bounded business pool, never on a worker thread
//! - framing is a length-prefixed binary protocol decoded with zero-copy
//!   slices out of pooled read buffers

mod admission;
mod buffer;
mod codec;
mod config;
mod executor;
mod handler;
mod reactor;
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
        acceptors = config.acceptors,
        max_connections = config.max_connections,
        "Starting hashjam server"
    );

    let _server = Server::start(&config)?;

    // All work happens on the acceptor, event-loop, and business threads;
    // the process runs until it is terminated.
    loop {
        std::thread::park();
    }
}
