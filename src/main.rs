//! Line chat server - Entry Point
//!
//! Parses the command line, starts logging and runs the ChatServer until
//! an interrupt or termination signal arrives.

use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use linechat::config::{DEFAULT_HOST, DEFAULT_PORT};
use linechat::{ChatServer, Config};

/// Multi-client line-based TCP chat server
#[derive(Parser, Debug)]
#[command(name = "linechat")]
#[command(version, about, long_about = None)]
struct Args {
    /// Host to listen on
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Idle read timeout per client, in seconds
    #[arg(long, default_value_t = 120)]
    idle_timeout: u64,

    /// Write timeout per message, in seconds
    #[arg(long, default_value_t = 10)]
    write_timeout: u64,

    /// Maximum message size in bytes
    #[arg(long, default_value_t = 4096)]
    msg_max_bytes: usize,

    /// Maximum number of clients (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_clients: usize,

    /// Outbound queue capacity per client (at least 3)
    #[arg(long, default_value_t = 64)]
    queue_capacity: usize,

    /// Seconds between the shutdown warning and disconnecting everyone
    #[arg(long, default_value_t = 3)]
    shutdown_grace: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Config {
            host: args.host,
            port: args.port,
            idle_timeout: Duration::from_secs(args.idle_timeout),
            write_timeout: Duration::from_secs(args.write_timeout),
            max_message_bytes: args.msg_max_bytes,
            max_clients: args.max_clients,
            debug: args.debug,
            outbound_capacity: args.queue_capacity,
            shutdown_grace: Duration::from_secs(args.shutdown_grace),
            ..Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from(Args::parse());

    // Use RUST_LOG env var to override, e.g. RUST_LOG=linechat=trace
    let default_filter = if config.debug {
        "linechat=debug"
    } else {
        "linechat=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let server = ChatServer::bind(config).await?;

    if let Err(e) = server.run(shutdown_signal()).await {
        error!("Server stopped: {}", e);
        return Err(e.into());
    }

    info!("Bye");
    Ok(())
}

/// Completes on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
