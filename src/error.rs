//! Error types for the chat server
//!
//! Defines application-level errors and message send errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// business errors (send error message to client).
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send error (fatal - internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// Identity could not be verified; the connection is refused
    #[error("Authentication failed")]
    Auth,

    /// Message, room or user does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Actor lacks rights for the requested mutation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Well-formed JSON carrying an unusable request
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Unexpected storage failure
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Message send errors
///
/// Occurs when attempting to send messages through closed or full channels.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The connection is not draining its outbound queue
    #[error("Channel full")]
    ChannelFull,
}

/// Errors reported by the storage/auth collaborator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Token is unknown or expired
    #[error("unauthorized")]
    Unauthorized,

    /// Requested entity does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Storage backend failure
    #[error("storage backend: {0}")]
    Backend(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unauthorized => AppError::Auth,
            StoreError::NotFound(what) => AppError::NotFound(what),
            StoreError::Backend(reason) => AppError::Internal(reason),
        }
    }
}
