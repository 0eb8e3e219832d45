//! Presence store
//!
//! Holds each user's current status and last-seen timestamp. Mutated by the
//! server actor on connect, disconnect and explicit status changes. Who hears
//! about a change (the user's friends) is decided by the caller.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{PresenceStatus, UserId};

/// One user's presence record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserPresence {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
}

/// In-memory presence records, one per user seen by this instance
#[derive(Debug, Default)]
pub struct PresenceStore {
    records: HashMap<UserId, UserPresence>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a user's status, stamping `last_seen` with the current time
    pub fn set_status(&mut self, user_id: &UserId, status: PresenceStatus) -> UserPresence {
        self.set_status_at(user_id, status, Utc::now())
    }

    /// Set a user's status as of `now`
    ///
    /// `last_seen` never moves backwards, even if the wall clock does.
    pub fn set_status_at(
        &mut self,
        user_id: &UserId,
        status: PresenceStatus,
        now: DateTime<Utc>,
    ) -> UserPresence {
        let record = self
            .records
            .entry(user_id.clone())
            .or_insert_with(|| UserPresence {
                user_id: user_id.clone(),
                status,
                last_seen: now,
            });

        record.status = status;
        record.last_seen = record.last_seen.max(now);
        record.clone()
    }

    /// Current record for a user, if this instance has seen them
    pub fn get_status(&self, user_id: &UserId) -> Option<&UserPresence> {
        self.records.get(user_id)
    }

    /// Whether the user is currently anything other than offline
    pub fn is_reachable(&self, user_id: &UserId) -> bool {
        self.records
            .get(user_id)
            .is_some_and(|r| r.status != PresenceStatus::Offline)
    }
}
