//! Event fanout
//!
//! State changes produce `Envelope`s: an outbound event plus the audience it
//! is meant for. The dispatcher resolves the audience against the live
//! connection registry and room subscriptions and queues the event on each
//! target connection. Delivery is best-effort; a connection that is gone or
//! not draining its queue simply misses the event.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::error::SendError;
use crate::message::ServerMessage;
use crate::registry::ConnectionRegistry;
use crate::room::RoomTracker;
use crate::types::{ConnectionId, RoomId, UserId};

/// Who an event goes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// One specific bound connection
    Connection(ConnectionId),
    /// Whatever connection these users currently have
    Users(Vec<UserId>),
    /// Every connection subscribed to `room`, plus the live connections of
    /// `also`, minus any connection owned by `except`
    Room {
        room: RoomId,
        also: Vec<UserId>,
        except: Option<UserId>,
    },
}

impl Audience {
    /// Room subscribers other than `except`
    pub fn room_except(room: RoomId, except: &UserId) -> Self {
        Audience::Room {
            room,
            also: Vec::new(),
            except: Some(except.clone()),
        }
    }
}

/// An outbound event addressed to an audience
#[derive(Debug, Clone)]
pub struct Envelope {
    pub audience: Audience,
    pub event: ServerMessage,
}

impl Envelope {
    pub fn new(audience: Audience, event: ServerMessage) -> Self {
        Self { audience, event }
    }

    /// Reply to the connection an inbound event came from
    pub fn reply(connection_id: ConnectionId, event: ServerMessage) -> Self {
        Self::new(Audience::Connection(connection_id), event)
    }
}

/// Resolves audiences to connections and queues events on them
pub struct Dispatcher<'a> {
    registry: &'a ConnectionRegistry,
    rooms: &'a RoomTracker,
}

impl<'a> Dispatcher<'a> {
    pub fn new(registry: &'a ConnectionRegistry, rooms: &'a RoomTracker) -> Self {
        Self { registry, rooms }
    }

    /// Connections an audience currently resolves to
    pub fn resolve(&self, audience: &Audience) -> HashSet<ConnectionId> {
        match audience {
            Audience::Connection(id) => HashSet::from([*id]),
            Audience::Users(users) => users
                .iter()
                .filter_map(|user| self.registry.lookup(user))
                .map(|conn| conn.id)
                .collect(),
            Audience::Room { room, also, except } => {
                let mut targets = self.rooms.members_of(room);
                targets.extend(
                    also.iter()
                        .filter_map(|user| self.registry.lookup(user))
                        .map(|conn| conn.id),
                );
                if let Some(except) = except {
                    targets.retain(|id| self.registry.owner_of(*id) != Some(except));
                }
                targets
            }
        }
    }

    /// Deliver one envelope, returning how many connections accepted it
    pub fn deliver(&self, envelope: &Envelope) -> usize {
        let mut accepted = 0;
        for connection_id in self.resolve(&envelope.audience) {
            let Some(connection) = self.registry.get(connection_id) else {
                debug!("Skipping event for unbound connection {}", connection_id);
                continue;
            };
            match connection.send(envelope.event.clone()) {
                Ok(()) => accepted += 1,
                Err(SendError::ChannelFull) => {
                    warn!("Outbound queue full for {}, dropping event", connection_id);
                }
                Err(SendError::ChannelClosed) => {
                    debug!("Connection {} closed before delivery", connection_id);
                }
            }
        }
        accepted
    }

    /// Deliver a batch of envelopes in order
    pub fn deliver_all(&self, envelopes: &[Envelope]) -> usize {
        envelopes.iter().map(|e| self.deliver(e)).sum()
    }
}
