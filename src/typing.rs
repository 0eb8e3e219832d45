//! Typing indicator tracker
//!
//! Per room, the users currently flagged as typing. Every `typing=true`
//! signal (re)arms a fixed expiry window for that `(room, user)` pair; an
//! explicit stop or the window elapsing clears it.
//!
//! Each arm gets a fresh generation number. The expiry timer carries the
//! generation it was armed with, and `expire` ignores any generation that is
//! no longer current, so a stale timer can never clear a renewed entry. Timers
//! are also aborted outright when an entry is renewed or stopped.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::types::{RoomId, UserId};

/// Outcome of a `start` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingChange {
    /// User was not typing; the room should hear about it
    Started,
    /// User was already typing; only the deadline moved
    Renewed,
}

/// Identifies one armed expiry window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingTicket {
    pub generation: u64,
    pub deadline: Instant,
}

#[derive(Debug)]
struct TypingEntry {
    generation: u64,
    timer: Option<AbortHandle>,
}

impl TypingEntry {
    fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Typing state for all rooms
#[derive(Debug)]
pub struct TypingTracker {
    window: Duration,
    entries: HashMap<(RoomId, UserId), TypingEntry>,
    next_generation: u64,
}

impl TypingTracker {
    /// Create a tracker whose entries expire after `window` of inactivity
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Mark `user` as typing in `room` and arm a new expiry window
    ///
    /// Any timer attached to the previous window is aborted. The caller
    /// should schedule an expiry for the returned ticket and `attach` it.
    pub fn start(&mut self, room: &RoomId, user: &UserId) -> (TypingChange, TypingTicket) {
        self.next_generation += 1;
        let ticket = TypingTicket {
            generation: self.next_generation,
            deadline: Instant::now() + self.window,
        };

        let key = (room.clone(), user.clone());
        let change = match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.cancel();
                entry.generation = ticket.generation;
                TypingChange::Renewed
            }
            None => {
                self.entries.insert(
                    key,
                    TypingEntry {
                        generation: ticket.generation,
                        timer: None,
                    },
                );
                TypingChange::Started
            }
        };
        (change, ticket)
    }

    /// Attach the expiry timer for `generation`
    ///
    /// If the entry has moved on (renewed or cleared) the timer is aborted
    /// immediately.
    pub fn attach(&mut self, room: &RoomId, user: &UserId, generation: u64, timer: AbortHandle) {
        match self.entries.get_mut(&(room.clone(), user.clone())) {
            Some(entry) if entry.generation == generation => {
                entry.cancel();
                entry.timer = Some(timer);
            }
            _ => timer.abort(),
        }
    }

    /// Clear `user`'s typing flag in `room`
    ///
    /// Returns true if the user was typing.
    pub fn stop(&mut self, room: &RoomId, user: &UserId) -> bool {
        match self.entries.remove(&(room.clone(), user.clone())) {
            Some(mut entry) => {
                entry.cancel();
                true
            }
            None => false,
        }
    }

    /// Expire the window armed with `generation`
    ///
    /// Returns true only if that window is still the current one, in which
    /// case the entry is removed.
    pub fn expire(&mut self, room: &RoomId, user: &UserId, generation: u64) -> bool {
        let key = (room.clone(), user.clone());
        match self.entries.get(&key) {
            Some(entry) if entry.generation == generation => {
                self.entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Clear every entry for `user`, returning the rooms they were typing in
    pub fn clear_user(&mut self, user: &UserId) -> Vec<RoomId> {
        let keys: Vec<(RoomId, UserId)> = self
            .entries
            .keys()
            .filter(|(_, u)| u == user)
            .cloned()
            .collect();

        keys.into_iter()
            .filter_map(|key| {
                let mut entry = self.entries.remove(&key)?;
                entry.cancel();
                Some(key.0)
            })
            .collect()
    }

    /// Whether `user` is currently typing in `room`
    pub fn is_typing(&self, room: &RoomId, user: &UserId) -> bool {
        self.entries.contains_key(&(room.clone(), user.clone()))
    }
}
