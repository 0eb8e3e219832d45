//! Server configuration loaded from environment variables.
//!
//! All settings have defaults so the server can start with zero
//! configuration for local development.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::ledger::DEFAULT_LEDGER_CAPACITY;

/// Hard cap on a single history page
pub const MAX_HISTORY_LIMIT: usize = 200;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    /// Env: `CHAT_BIND_ADDR`
    /// Default: `127.0.0.1:8080`
    pub bind_addr: String,

    /// Typing indicators expire after this much inactivity.
    /// Env: `CHAT_TYPING_WINDOW_MS`
    /// Default: `1000`
    pub typing_window: Duration,

    /// Capacity of the server actor's command channel.
    /// Env: `CHAT_COMMAND_BUFFER`
    /// Default: `256`
    pub command_buffer: usize,

    /// Capacity of each connection's outbound event queue. Events for a
    /// connection whose queue is full are dropped.
    /// Env: `CHAT_OUTBOUND_BUFFER`
    /// Default: `64`
    pub outbound_buffer: usize,

    /// History page size when the client does not ask for one.
    /// Env: `CHAT_HISTORY_LIMIT`
    /// Default: `50`
    pub history_limit: usize,

    /// Most messages the server keeps live; older ones are reloaded from
    /// the store when touched.
    /// Env: `CHAT_LEDGER_CAPACITY`
    /// Default: `10000`
    pub ledger_capacity: usize,

    /// Let the bundled in-memory store accept any non-empty token as a new
    /// user id. Development only.
    /// Env: `CHAT_OPEN_REGISTRATION` (true/false)
    /// Default: `true`
    pub open_registration: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            typing_window: Duration::from_millis(1000),
            command_buffer: 256,
            outbound_buffer: 64,
            history_limit: 50,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
            open_registration: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from the environment, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let typing_window_ms = parse_var(
            "CHAT_TYPING_WINDOW_MS",
            defaults.typing_window.as_millis() as u64,
        );

        Self {
            bind_addr: env::var("CHAT_BIND_ADDR").unwrap_or(defaults.bind_addr),
            typing_window: Duration::from_millis(typing_window_ms.max(1)),
            command_buffer: parse_var("CHAT_COMMAND_BUFFER", defaults.command_buffer).max(1),
            outbound_buffer: parse_var("CHAT_OUTBOUND_BUFFER", defaults.outbound_buffer).max(1),
            history_limit: parse_var("CHAT_HISTORY_LIMIT", defaults.history_limit)
                .clamp(1, MAX_HISTORY_LIMIT),
            ledger_capacity: parse_var("CHAT_LEDGER_CAPACITY", defaults.ledger_capacity).max(1),
            open_registration: parse_var("CHAT_OPEN_REGISTRATION", defaults.open_registration),
        }
    }

    /// Effective page size for a history request
    pub fn history_page(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.history_limit)
            .clamp(1, MAX_HISTORY_LIMIT)
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring unparseable {}={:?}, using default", name, raw);
            default
        }),
        Err(_) => default,
    }
}
