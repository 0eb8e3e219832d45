//! WebSocket connection handler
//!
//! Handles individual client connections: WebSocket handshake,
//! authentication, message parsing, and bidirectional communication with
//! the ChatServer.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::message::{ClientMessage, ServerMessage};
use crate::server::ServerCommand;
use crate::store::Store;
use crate::types::{ConnectionId, UserId};

/// How long a client has to send its `authenticate` frame
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a new TCP connection
///
/// Performs WebSocket handshake, authenticates the first frame against the
/// store, sets up bidirectional communication, and manages the connection
/// lifecycle. Nothing reaches the ChatServer until the identity is verified.
pub async fn handle_connection(
    stream: TcpStream,
    cmd_tx: mpsc::Sender<ServerCommand>,
    store: Arc<dyn Store>,
    outbound_buffer: usize,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    // WebSocket handshake
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let auth = authenticate(&mut ws_receiver, store.as_ref());
    let user_id = match tokio::time::timeout(AUTH_TIMEOUT, auth).await {
        Ok(Ok(user_id)) => user_id,
        Ok(Err(e)) => {
            warn!("Authentication failed for {}: {}", peer_addr, e);
            let json = serde_json::to_string(&ServerMessage::from(AppError::Auth))?;
            ws_sender.send(Message::Text(json.into())).await?;
            let _ = ws_sender.close().await;
            return Ok(());
        }
        Err(_) => {
            warn!("No authentication from {} within {:?}", peer_addr, AUTH_TIMEOUT);
            let _ = ws_sender.close().await;
            return Ok(());
        }
    };

    let connection_id = ConnectionId::new();
    info!(
        "User {} connected from {} as {}",
        user_id, peer_addr, connection_id
    );

    // Create channel for server -> client messages
    let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(outbound_buffer);

    // Register with ChatServer; it answers with `connected`
    if cmd_tx
        .send(ServerCommand::Connect {
            connection_id,
            user_id,
            sender: msg_tx,
        })
        .await
        .is_err()
    {
        error!("Failed to register {} - server closed", connection_id);
        return Err(AppError::ChannelSend);
    }

    // Clone cmd_tx for read task
    let cmd_tx_read = cmd_tx.clone();

    // Spawn read task (WebSocket -> ServerCommand)
    let mut read_task = tokio::spawn(async move {
        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    let cmd = match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(client_msg) => client_message_to_command(connection_id, client_msg),
                        Err(e) => {
                            warn!("Invalid JSON from {}: {}", connection_id, e);
                            ServerCommand::Rejected {
                                connection_id,
                                reason: e.to_string(),
                            }
                        }
                    };
                    if cmd_tx_read.send(cmd).await.is_err() {
                        debug!("Server closed, ending read task for {}", connection_id);
                        break;
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!("Connection {} sent close frame", connection_id);
                    break;
                }
                Ok(Message::Ping(_)) => {
                    // Pong is handled automatically by tungstenite
                    debug!("Ping from {}", connection_id);
                }
                Ok(Message::Pong(_)) => {
                    debug!("Pong from {}", connection_id);
                }
                Ok(_) => {
                    // Binary or other message types - ignore
                }
                Err(e) => {
                    error!("WebSocket error for {}: {}", connection_id, e);
                    break;
                }
            }
        }
        debug!("Read task ended for {}", connection_id);
    });

    // Spawn write task (ServerMessage -> WebSocket)
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        debug!("WebSocket send failed, ending write task");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    // Continue - don't break on serialization errors
                }
            }
        }
        debug!("Write task ended for {}", connection_id);

        // Server dropped us (disconnect or superseded): close the socket
        let _ = ws_sender.close().await;
    });

    // Wait for either task to complete, then stop the other
    tokio::select! {
        _ = &mut read_task => {
            debug!("Read task completed for {}", connection_id);
            write_task.abort();
        }
        _ = &mut write_task => {
            debug!("Write task completed for {}", connection_id);
            read_task.abort();
        }
    }

    // Send disconnect command; the server ignores it if we were superseded
    let _ = cmd_tx
        .send(ServerCommand::Disconnect { connection_id })
        .await;

    info!("Connection {} closed", connection_id);

    Ok(())
}

/// Read frames until the first text frame and verify it as `authenticate`
async fn authenticate(
    ws_receiver: &mut SplitStream<WebSocketStream<TcpStream>>,
    store: &dyn Store,
) -> Result<UserId, AppError> {
    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result? {
            Message::Text(text) => {
                return match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Authenticate { token }) => {
                        Ok(store.verify_identity(&token).await?)
                    }
                    Ok(_) | Err(_) => Err(AppError::Auth),
                };
            }
            Message::Close(_) => break,
            _ => continue,
        }
    }
    Err(AppError::Auth)
}

/// Convert a ClientMessage to a ServerCommand
fn client_message_to_command(connection_id: ConnectionId, msg: ClientMessage) -> ServerCommand {
    match msg {
        ClientMessage::Authenticate { .. } => ServerCommand::Rejected {
            connection_id,
            reason: "already authenticated".to_string(),
        },
        ClientMessage::JoinRoom { room } => ServerCommand::JoinRoom { connection_id, room },
        ClientMessage::LeaveRoom { room } => ServerCommand::LeaveRoom { connection_id, room },
        ClientMessage::Typing { room, is_typing: true } => {
            ServerCommand::Typing { connection_id, room }
        }
        ClientMessage::Typing { room, is_typing: false } | ClientMessage::StopTyping { room } => {
            ServerCommand::StopTyping { connection_id, room }
        }
        ClientMessage::NewMessage {
            recipient,
            content,
            kind,
            file,
            reply_to,
        } => ServerCommand::NewMessage {
            connection_id,
            recipient,
            content,
            kind,
            file,
            reply_to,
        },
        ClientMessage::MessageRead { message_id } => ServerCommand::MessageRead {
            connection_id,
            message_id,
        },
        ClientMessage::MessageReaction { message_id, emoji } => ServerCommand::MessageReaction {
            connection_id,
            message_id,
            emoji,
        },
        ClientMessage::StatusChange { status } => ServerCommand::StatusChange {
            connection_id,
            status,
        },
        ClientMessage::UpdateMessageStatus { message_id, status } => {
            ServerCommand::UpdateMessageStatus {
                connection_id,
                message_id,
                status,
            }
        }
        ClientMessage::EditMessage {
            message_id,
            content,
        } => ServerCommand::EditMessage {
            connection_id,
            message_id,
            content,
        },
        ClientMessage::DeleteMessage { message_id } => ServerCommand::DeleteMessage {
            connection_id,
            message_id,
        },
        ClientMessage::FetchHistory {
            room,
            before,
            limit,
        } => ServerCommand::FetchHistory {
            connection_id,
            room,
            before,
            limit,
        },
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::config::ServerConfig;
    use crate::server::ChatServer;
    use crate::store::MemoryStore;

    async fn start() -> String {
        let store = Arc::new(MemoryStore::new());
        store.add_user("alice", "tok-alice").await;

        let (server, cmd_tx) = ChatServer::channel(ServerConfig::default(), store.clone());
        tokio::spawn(server.run());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let cmd_tx = cmd_tx.clone();
                let store: Arc<dyn Store> = store.clone();
                tokio::spawn(handle_connection(stream, cmd_tx, store, 32));
            }
        });
        format!("ws://{}", addr)
    }

    async fn next_json(
        ws: &mut WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    ) -> serde_json::Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_token() {
        let url = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        ws.send(Message::Text(
            r#"{"type":"authenticate","token":"wrong"}"#.into(),
        ))
        .await
        .unwrap();

        let reply = next_json(&mut ws).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["code"], "auth_failed");
    }

    #[tokio::test]
    async fn test_requires_authenticate_first() {
        let url = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        ws.send(Message::Text(
            r#"{"type":"join_room","room":"dm:alice:bob"}"#.into(),
        ))
        .await
        .unwrap();

        let reply = next_json(&mut ws).await;
        assert_eq!(reply["code"], "auth_failed");
    }

    #[tokio::test]
    async fn test_connect_and_invalid_frame() {
        let url = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        ws.send(Message::Text(
            r#"{"type":"authenticate","token":"tok-alice"}"#.into(),
        ))
        .await
        .unwrap();

        let connected = next_json(&mut ws).await;
        assert_eq!(connected["type"], "connected");
        assert_eq!(connected["user_id"], "alice");
        assert_eq!(connected["status"], "online");

        ws.send(Message::Text(r#"{"type":"dance"}"#.into()))
            .await
            .unwrap();
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["code"], "invalid_message");

        // The connection survives a bad frame
        ws.send(Message::Text(
            r#"{"type":"join_room","room":"dm:alice:bob"}"#.into(),
        ))
        .await
        .unwrap();
        let joined = next_json(&mut ws).await;
        assert_eq!(joined["type"], "room_joined");
        assert_eq!(joined["room"], "dm:alice:bob");
    }
}
