//! Switchyard server binary.
//!
//! # Usage
//!
//! ```bash
//! # Serve the demo protocol on the default address
//! switchyard-server
//!
//! # Two listeners, short idle timeout
//! switchyard-server --listen 0.0.0.0:4433 --listen [::]:4433 --idle-timeout-secs 10
//! ```

use std::time::Duration;

use clap::Parser;
use switchyard_core::ServerConfig;
use switchyard_server::{DemoApp, DemoCodec, TcpConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Switchyard demo server
#[derive(Parser, Debug)]
#[command(name = "switchyard-server")]
#[command(about = "Readiness-driven protocol server with a worker pool")]
#[command(version)]
struct Args {
    /// Address to listen on (repeat for several listeners)
    #[arg(short, long = "listen", default_value = "127.0.0.1:4433")]
    listen: Vec<String>,

    /// Worker threads running the application handler
    #[arg(short, long, default_value = "20")]
    workers: usize,

    /// Seconds an active session may stay silent (0 disables)
    #[arg(long, default_value = "60")]
    idle_timeout_secs: u64,

    /// Seconds a handshake may take (0 disables)
    #[arg(long, default_value = "30")]
    handshake_timeout_secs: u64,

    /// Largest frame body accepted or sent, in bytes
    #[arg(long, default_value = "1048576")]
    max_frame_len: usize,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_sessions: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Switchyard server starting");

    let config = ServerConfig {
        listen: args.listen,
        workers: args.workers,
        handshake_timeout: seconds(args.handshake_timeout_secs),
        idle_timeout: seconds(args.idle_timeout_secs),
        max_sessions: args.max_sessions,
        ..ServerConfig::default()
    };
    let tcp = TcpConfig { max_frame_len: args.max_frame_len, ..TcpConfig::default() };

    let mut server = switchyard_server::bind(config, &tcp, DemoCodec::new(), DemoApp)?;

    for address in server.listener_addresses() {
        tracing::info!("Server listening on {}", address);
    }

    server.run()?;

    tracing::info!("Switchyard server stopped");
    Ok(())
}
