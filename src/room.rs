//! Room membership tracker
//!
//! Per room, the set of connections currently subscribed to its events.
//! Membership is transient and in-memory only; whether a user may join a
//! room is decided before the request gets here.

use std::collections::{HashMap, HashSet};

use crate::types::{ConnectionId, RoomId};

/// Room → subscribed connections, with a reverse index for cleanup
#[derive(Debug, Default)]
pub struct RoomTracker {
    members: HashMap<RoomId, HashSet<ConnectionId>>,
    joined: HashMap<ConnectionId, HashSet<RoomId>>,
}

impl RoomTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to a room
    ///
    /// Returns true if the connection was not already a member. Joining twice
    /// is harmless.
    pub fn join(&mut self, connection_id: ConnectionId, room: &RoomId) -> bool {
        self.joined
            .entry(connection_id)
            .or_default()
            .insert(room.clone());
        self.members
            .entry(room.clone())
            .or_default()
            .insert(connection_id)
    }

    /// Unsubscribe a connection from a room
    ///
    /// Returns true if the connection was a member. Leaving a room that was
    /// never joined is harmless. Empty rooms are dropped.
    pub fn leave(&mut self, connection_id: ConnectionId, room: &RoomId) -> bool {
        if let Some(rooms) = self.joined.get_mut(&connection_id) {
            rooms.remove(room);
            if rooms.is_empty() {
                self.joined.remove(&connection_id);
            }
        }

        let Some(members) = self.members.get_mut(room) else {
            return false;
        };
        let removed = members.remove(&connection_id);
        if members.is_empty() {
            self.members.remove(room);
        }
        removed
    }

    /// Unsubscribe a connection from every room, returning the rooms it left
    pub fn leave_all(&mut self, connection_id: ConnectionId) -> Vec<RoomId> {
        let rooms: Vec<RoomId> = self
            .joined
            .remove(&connection_id)
            .map(|rooms| rooms.into_iter().collect())
            .unwrap_or_default();

        for room in &rooms {
            if let Some(members) = self.members.get_mut(room) {
                members.remove(&connection_id);
                if members.is_empty() {
                    self.members.remove(room);
                }
            }
        }
        rooms
    }

    /// Connections subscribed to a room
    pub fn members_of(&self, room: &RoomId) -> HashSet<ConnectionId> {
        self.members.get(room).cloned().unwrap_or_default()
    }

    /// Whether a connection is subscribed to a room
    pub fn is_member(&self, connection_id: ConnectionId, room: &RoomId) -> bool {
        self.members
            .get(room)
            .is_some_and(|members| members.contains(&connection_id))
    }

    /// Number of rooms with at least one subscriber
    pub fn room_count(&self) -> usize {
        self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dm() -> RoomId {
        RoomId::direct("alice".into(), "bob".into())
    }

    fn group() -> RoomId {
        RoomId::group("g1".into())
    }

    #[test]
    fn test_join_and_members() {
        let mut rooms = RoomTracker::new();
        let a = ConnectionId::new();
        let b = ConnectionId::new();

        assert!(rooms.join(a, &dm()));
        assert!(rooms.join(b, &dm()));

        let members = rooms.members_of(&dm());
        assert_eq!(members.len(), 2);
        assert!(members.contains(&a) && members.contains(&b));
        assert!(rooms.members_of(&group()).is_empty());
    }

    #[test]
    fn test_join_twice_is_idempotent() {
        let mut rooms = RoomTracker::new();
        let a = ConnectionId::new();

        assert!(rooms.join(a, &dm()));
        assert!(!rooms.join(a, &dm()));
        assert_eq!(rooms.members_of(&dm()).len(), 1);
        assert_eq!(rooms.leave_all(a), vec![dm()]);
    }

    #[test]
    fn test_leave_unjoined_is_idempotent() {
        let mut rooms = RoomTracker::new();
        let a = ConnectionId::new();

        assert!(!rooms.leave(a, &dm()));

        rooms.join(a, &dm());
        assert!(rooms.leave(a, &dm()));
        assert!(!rooms.leave(a, &dm()));
        assert_eq!(rooms.room_count(), 0);
    }

    #[test]
    fn test_multiple_rooms_per_connection() {
        let mut rooms = RoomTracker::new();
        let a = ConnectionId::new();
        let b = ConnectionId::new();

        rooms.join(a, &dm());
        rooms.join(a, &group());
        rooms.join(b, &group());

        assert!(rooms.is_member(a, &dm()));
        assert!(rooms.is_member(a, &group()));
        assert_eq!(rooms.room_count(), 2);

        rooms.leave(a, &dm());
        assert!(!rooms.is_member(a, &dm()));
        assert!(rooms.is_member(a, &group()));
    }

    #[test]
    fn test_leave_all() {
        let mut rooms = RoomTracker::new();
        let a = ConnectionId::new();
        let b = ConnectionId::new();

        rooms.join(a, &dm());
        rooms.join(a, &group());
        rooms.join(b, &group());

        let mut left = rooms.leave_all(a);
        left.sort_by_key(|r| r.to_string());
        assert_eq!(left, vec![dm(), group()]);

        assert!(!rooms.is_member(a, &dm()) && !rooms.is_member(a, &group()));
        assert_eq!(rooms.members_of(&group()).len(), 1);
        assert_eq!(rooms.room_count(), 1);
        assert!(rooms.leave_all(a).is_empty());
    }
}
