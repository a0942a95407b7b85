//! # prico-server
//!
//! Runs the real-time room server. Settings come from flags, environment
//! variables, or a `.env` file; `RUST_LOG` controls log filtering.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use prico_realtime::{HubConfig, RealtimeServer, ServerConfig, ShutdownHandle};

/// Command-line arguments for the realtime server.
#[derive(Parser, Debug)]
#[command(author, version, about = "Real-time chat, editor and call rooms over WebSocket", long_about = None)]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "PRICO_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory. Documents stay in memory when unset.
    #[arg(long, env = "PRICO_STORAGE")]
    storage: Option<PathBuf>,

    /// Minimum milliseconds between saves of one editor file.
    #[arg(long, env = "PRICO_DEBOUNCE_MS", default_value_t = 5000)]
    debounce_ms: u64,

    /// Frames queued per connection before it is dropped as stalled.
    #[arg(long, env = "PRICO_OUTBOUND_CAPACITY", default_value_t = 256)]
    outbound_capacity: usize,

    #[arg(long, env = "PRICO_SEND_TIMEOUT_MS", default_value_t = 5000)]
    send_timeout_ms: u64,

    /// Chat messages each room keeps in memory.
    #[arg(long, env = "PRICO_MESSAGE_CACHE", default_value_t = 1024)]
    message_cache: usize,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            hub: HubConfig {
                debounce_interval: Duration::from_millis(self.debounce_ms),
                outbound_capacity: self.outbound_capacity.max(1),
                send_timeout: Duration::from_millis(self.send_timeout_ms),
                message_cache_capacity: self.message_cache.max(1),
            },
            storage_path: self.storage,
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            log::warn!("Cannot listen for SIGTERM: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await
}

async fn shutdown_on_signal(handle: ShutdownHandle) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                log::warn!("Cannot listen for Ctrl-C: {e}");
                return;
            }
            log::info!("Ctrl-C received, shutting down");
        }
        _ = terminate() => log::info!("SIGTERM received, shutting down"),
    }
    handle.shutdown().await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    log::info!(
        "Starting realtime server on {} (debounce {:?}, storage {})",
        config.bind_addr,
        config.hub.debounce_interval,
        config
            .storage_path
            .as_ref()
            .map_or_else(|| "in-memory".to_string(), |p| p.display().to_string())
    );

    let server = RealtimeServer::new(config)?;
    tokio::spawn(shutdown_on_signal(server.shutdown_handle()));
    server.run().await?;

    log::info!("Realtime server stopped");
    Ok(())
}
