//! Connection registry
//!
//! Maps each user to at most one live connection. Binding a new connection
//! for a user evicts the previous one (last bind wins); unbinding a
//! connection that is no longer the bound one is a no-op, so a stale
//! disconnect racing a reconnect cannot flip the user offline.

use std::collections::HashMap;

use crate::connection::Connection;
use crate::types::{ConnectionId, UserId};

/// Single source of truth for "is this user reachable right now"
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Bound connection per user
    by_user: HashMap<UserId, Connection>,
    /// Reverse index: bound connection → owner
    owners: HashMap<ConnectionId, UserId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `connection` to its user
    ///
    /// Returns the connection it replaced, if any. The caller is responsible
    /// for closing the evicted connection.
    pub fn bind(&mut self, connection: Connection) -> Option<Connection> {
        let user_id = connection.user_id.clone();
        let connection_id = connection.id;

        let evicted = self.by_user.insert(user_id.clone(), connection);
        if let Some(old) = &evicted {
            self.owners.remove(&old.id);
        }
        self.owners.insert(connection_id, user_id);
        evicted
    }

    /// Remove the binding for `connection_id` if it is still the live one
    ///
    /// Returns the removed connection, or `None` when the connection is
    /// unknown or was already superseded.
    pub fn unbind(&mut self, connection_id: ConnectionId) -> Option<Connection> {
        let user_id = self.owners.remove(&connection_id)?;
        match self.by_user.get(&user_id) {
            Some(bound) if bound.id == connection_id => self.by_user.remove(&user_id),
            _ => None,
        }
    }

    /// The live connection for a user
    pub fn lookup(&self, user_id: &UserId) -> Option<&Connection> {
        self.by_user.get(user_id)
    }

    /// The live connection with the given id
    pub fn get(&self, connection_id: ConnectionId) -> Option<&Connection> {
        let user_id = self.owners.get(&connection_id)?;
        self.by_user.get(user_id)
    }

    /// Owner of a live connection
    pub fn owner_of(&self, connection_id: ConnectionId) -> Option<&UserId> {
        self.owners.get(&connection_id)
    }

    /// Number of bound users
    pub fn len(&self) -> usize {
        self.by_user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_user.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn conn(user: &str) -> Connection {
        let (tx, _rx) = mpsc::channel(8);
        Connection::new(ConnectionId::new(), user.into(), tx)
    }

    #[test]
    fn test_bind_and_lookup() {
        let mut registry = ConnectionRegistry::new();
        let c = conn("alice");
        let id = c.id;

        assert!(registry.bind(c).is_none());
        assert_eq!(registry.lookup(&"alice".into()).map(|c| c.id), Some(id));
        assert_eq!(registry.owner_of(id), Some(&UserId::from("alice")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_second_bind_evicts_first() {
        let mut registry = ConnectionRegistry::new();
        let first = conn("alice");
        let second = conn("alice");
        let (first_id, second_id) = (first.id, second.id);

        registry.bind(first);
        let evicted = registry.bind(second).expect("first connection evicted");

        assert_eq!(evicted.id, first_id);
        assert_eq!(registry.lookup(&"alice".into()).map(|c| c.id), Some(second_id));
        assert!(registry.get(first_id).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_unbind_is_noop() {
        let mut registry = ConnectionRegistry::new();
        let first = conn("alice");
        let second = conn("alice");
        let (first_id, second_id) = (first.id, second.id);

        registry.bind(first);
        registry.bind(second);

        assert!(registry.unbind(first_id).is_none());
        assert_eq!(registry.lookup(&"alice".into()).map(|c| c.id), Some(second_id));

        assert_eq!(registry.unbind(second_id).map(|c| c.id), Some(second_id));
        assert!(registry.is_empty());

        // Disconnect events are delivered at most once, but be idempotent anyway
        assert!(registry.unbind(second_id).is_none());
    }

    #[test]
    fn test_users_are_independent() {
        let mut registry = ConnectionRegistry::new();
        let a = conn("alice");
        let b = conn("bob");
        let a_id = a.id;

        registry.bind(a);
        registry.bind(b);
        registry.unbind(a_id);

        assert!(registry.lookup(&"alice".into()).is_none());
        assert!(registry.lookup(&"bob".into()).is_some());
    }
}
