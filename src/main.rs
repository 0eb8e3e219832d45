//! Real-time Chat Server - Entry Point
//!
//! Loads configuration, starts the TCP listener and ChatServer actor,
//! and accepts connections.

use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use realtime_chat::{handle_connection, ChatServer, MemoryStore, ServerConfig, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=realtime_chat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("realtime_chat=info")),
        )
        .init();

    let mut config = ServerConfig::from_env();

    // Bind address from command line overrides the environment
    if let Some(addr) = env::args().nth(1) {
        config.bind_addr = addr;
    }

    if config.open_registration {
        warn!("Open registration enabled: any token is accepted as a user id");
    }
    let store: Arc<dyn Store> =
        Arc::new(MemoryStore::new().with_open_registration(config.open_registration));

    // Start TCP listener
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("WebSocket Chat Server listening on {}", config.bind_addr);

    // Create ChatServer actor channel and start
    let (server, cmd_tx) = ChatServer::channel(config.clone(), Arc::clone(&store));
    tokio::spawn(server.run());

    info!(
        "ChatServer actor started (typing window {:?})",
        config.typing_window
    );

    // Connection accept loop
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let cmd_tx = cmd_tx.clone();
                let store = Arc::clone(&store);
                let outbound_buffer = config.outbound_buffer;

                // Spawn handler task for each connection
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, cmd_tx, store, outbound_buffer).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
