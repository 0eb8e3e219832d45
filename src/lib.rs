//! Real-time Direct and Group Chat Server Library
//!
//! A WebSocket chat server built with tokio-tungstenite, using the Actor
//! pattern for all live coordination state.
//!
//! # Features
//! - Token authentication before a connection is registered
//! - One live connection per user (a reconnect supersedes the old one)
//! - Presence (online/offline/away/busy) broadcast to a user's contacts
//! - Direct and group rooms with per-connection subscriptions
//! - Typing indicators that expire on their own
//! - Message delivery status (sent → delivered → read), reactions,
//!   edits, soft deletes, read receipts and history paging
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `ChatServer` is the central actor owning every registry
//! - Each connection has a `handler` task communicating with the server
//! - No locks needed - all state access goes through message passing
//! - Storage calls run in spawned tasks and report back as commands
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use realtime_chat::{handle_connection, ChatServer, MemoryStore, ServerConfig, Store};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig::from_env();
//!     let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
//!     let listener = TcpListener::bind(&config.bind_addr).await.unwrap();
//!
//!     let (server, cmd_tx) = ChatServer::channel(config.clone(), store.clone());
//!     tokio::spawn(server.run());
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         let cmd_tx = cmd_tx.clone();
//!         let store = store.clone();
//!         tokio::spawn(handle_connection(stream, cmd_tx, store, config.outbound_buffer));
//!     }
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod fanout;
pub mod handler;
pub mod ledger;
pub mod message;
pub mod persist;
pub mod presence;
pub mod registry;
pub mod room;
pub mod server;
pub mod store;
pub mod typing;
pub mod types;

// Re-export main types for convenience
pub use config::ServerConfig;
pub use connection::Connection;
pub use error::{AppError, SendError, StoreError};
pub use handler::handle_connection;
pub use ledger::{FileMeta, Message, MessageLedger, Reaction, Recipient};
pub use message::{ClientMessage, ErrorCode, ServerMessage};
pub use presence::{PresenceStore, UserPresence};
pub use registry::ConnectionRegistry;
pub use room::RoomTracker;
pub use server::{ChatServer, MessageAction, ServerCommand};
pub use store::{MemoryStore, Store};
pub use typing::TypingTracker;
pub use types::{
    ConnectionId, GroupId, MessageId, MessageKind, MessageStatus, PresenceStatus, RoomId, UserId,
};
