//! ChatServer Actor implementation
//!
//! The central actor that owns all live state: the connection registry,
//! presence, room subscriptions, typing indicators and the message ledger.
//! Uses the Actor pattern with mpsc channels for message passing, so every
//! mutation is serialized without locks.
//!
//! The actor never awaits the store. Lookups whose result it needs (friend
//! lists, group rosters, new message ids) run in spawned tasks that post their
//! outcome back as an internal command. Durability writes go through the
//! ordered write-behind queue, and so do reads that must see those writes:
//! loading a message before mutating it, and loading history pages.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::AppError;
use crate::fanout::{Audience, Dispatcher, Envelope};
use crate::ledger::{FileMeta, Message, MessageLedger, Recipient};
use crate::message::ServerMessage;
use crate::persist::{WriteBehind, WriteWorker};
use crate::presence::{PresenceStore, UserPresence};
use crate::registry::ConnectionRegistry;
use crate::room::RoomTracker;
use crate::store::Store;
use crate::typing::{TypingChange, TypingTicket, TypingTracker};
use crate::types::{
    ConnectionId, GroupId, MessageId, MessageKind, MessageStatus, PresenceStatus, RoomId, UserId,
};

/// Roster fetched alongside a group operation, if the target was a group
type Roster = Option<(GroupId, HashSet<UserId>)>;

/// Mutation of an existing message, applied once the message and its
/// group roster are loaded
#[derive(Debug)]
pub enum MessageAction {
    Read,
    React(String),
    UpdateStatus(MessageStatus),
    Edit(String),
    Delete,
}

/// Commands sent to the ChatServer actor
#[derive(Debug)]
pub enum ServerCommand {
    /// Authenticated connection ready to be bound
    Connect {
        connection_id: ConnectionId,
        user_id: UserId,
        sender: mpsc::Sender<ServerMessage>,
    },
    /// Transport closed
    Disconnect { connection_id: ConnectionId },
    /// Frame that could not be parsed
    Rejected {
        connection_id: ConnectionId,
        reason: String,
    },
    JoinRoom {
        connection_id: ConnectionId,
        room: RoomId,
    },
    LeaveRoom {
        connection_id: ConnectionId,
        room: RoomId,
    },
    Typing {
        connection_id: ConnectionId,
        room: RoomId,
    },
    StopTyping {
        connection_id: ConnectionId,
        room: RoomId,
    },
    NewMessage {
        connection_id: ConnectionId,
        recipient: Recipient,
        content: String,
        kind: MessageKind,
        file: Option<FileMeta>,
        reply_to: Option<MessageId>,
    },
    MessageRead {
        connection_id: ConnectionId,
        message_id: MessageId,
    },
    MessageReaction {
        connection_id: ConnectionId,
        message_id: MessageId,
        emoji: String,
    },
    StatusChange {
        connection_id: ConnectionId,
        status: PresenceStatus,
    },
    UpdateMessageStatus {
        connection_id: ConnectionId,
        message_id: MessageId,
        status: MessageStatus,
    },
    EditMessage {
        connection_id: ConnectionId,
        message_id: MessageId,
        content: String,
    },
    DeleteMessage {
        connection_id: ConnectionId,
        message_id: MessageId,
    },
    FetchHistory {
        connection_id: ConnectionId,
        room: RoomId,
        before: Option<MessageId>,
        limit: Option<usize>,
    },
    /// Read a user's live presence record
    GetPresence {
        user_id: UserId,
        reply: oneshot::Sender<Option<UserPresence>>,
    },

    // Internal: outcomes of work done off the actor
    /// A typing window armed with `generation` elapsed
    TypingExpired {
        room: RoomId,
        user_id: UserId,
        generation: u64,
    },
    /// Friend list looked up for a presence notification; `snapshot` is the
    /// presence record the event was built from
    ContactsResolved {
        user_id: UserId,
        friends: HashSet<UserId>,
        snapshot: UserPresence,
        event: ServerMessage,
    },
    /// Group roster checked for a join request
    GroupJoinResolved {
        connection_id: ConnectionId,
        user_id: UserId,
        group: GroupId,
        result: Result<HashSet<UserId>, AppError>,
    },
    /// New message stored (or rejected)
    MessagePersisted {
        connection_id: ConnectionId,
        result: Result<(Message, Roster), AppError>,
    },
    /// Target of a message mutation loaded (or rejected)
    MessageResolved {
        connection_id: ConnectionId,
        user_id: UserId,
        action: MessageAction,
        result: Result<(Message, Roster), AppError>,
    },
    /// History page loaded (or rejected)
    HistoryLoaded {
        connection_id: ConnectionId,
        room: RoomId,
        result: Result<(Vec<Message>, Roster), AppError>,
    },
}

/// The main ChatServer actor
///
/// Manages all state and processes commands from connection handlers.
pub struct ChatServer {
    config: ServerConfig,
    store: Arc<dyn Store>,
    registry: ConnectionRegistry,
    presence: PresenceStore,
    rooms: RoomTracker,
    typing: TypingTracker,
    ledger: MessageLedger,
    writes: WriteBehind,
    worker: Option<WriteWorker>,
    /// Command receiver channel
    receiver: mpsc::Receiver<ServerCommand>,
    /// Our own inbox, for posting results back; weak so the actor stops
    /// once every handler is gone
    handle: mpsc::WeakSender<ServerCommand>,
}

impl ChatServer {
    /// Create a ChatServer and the command channel that feeds it
    pub fn channel(
        config: ServerConfig,
        store: Arc<dyn Store>,
    ) -> (Self, mpsc::Sender<ServerCommand>) {
        let (cmd_tx, receiver) = mpsc::channel(config.command_buffer);
        let (writes, worker) = WriteBehind::new(Arc::clone(&store), cmd_tx.downgrade());

        let server = Self {
            typing: TypingTracker::new(config.typing_window),
            ledger: MessageLedger::with_capacity(config.ledger_capacity),
            config,
            store,
            registry: ConnectionRegistry::new(),
            presence: PresenceStore::new(),
            rooms: RoomTracker::new(),
            writes,
            worker: Some(worker),
            receiver,
            handle: cmd_tx.downgrade(),
        };
        (server, cmd_tx)
    }

    /// Run the ChatServer event loop
    ///
    /// Continuously receives and processes commands until all senders are dropped.
    pub async fn run(mut self) {
        info!("ChatServer started");

        if let Some(worker) = self.worker.take() {
            tokio::spawn(worker.run());
        }

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!("ChatServer shutting down");
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: ServerCommand) {
        let (origin, result) = match cmd {
            ServerCommand::Connect {
                connection_id,
                user_id,
                sender,
            } => (
                connection_id,
                Ok(self.handle_connect(connection_id, user_id, sender)),
            ),
            ServerCommand::Disconnect { connection_id } => {
                (connection_id, Ok(self.handle_disconnect(connection_id)))
            }
            ServerCommand::Rejected {
                connection_id,
                reason,
            } => (connection_id, Err(AppError::InvalidMessage(reason))),
            ServerCommand::JoinRoom {
                connection_id,
                room,
            } => (connection_id, self.handle_join_room(connection_id, room)),
            ServerCommand::LeaveRoom {
                connection_id,
                room,
            } => (connection_id, self.handle_leave_room(connection_id, room)),
            ServerCommand::Typing {
                connection_id,
                room,
            } => (connection_id, self.handle_typing(connection_id, room)),
            ServerCommand::StopTyping {
                connection_id,
                room,
            } => (connection_id, self.handle_stop_typing(connection_id, room)),
            ServerCommand::NewMessage {
                connection_id,
                recipient,
                content,
                kind,
                file,
                reply_to,
            } => (
                connection_id,
                self.handle_new_message(connection_id, recipient, content, kind, file, reply_to),
            ),
            ServerCommand::MessageRead {
                connection_id,
                message_id,
            } => (
                connection_id,
                self.resolve_message(connection_id, message_id, MessageAction::Read),
            ),
            ServerCommand::MessageReaction {
                connection_id,
                message_id,
                emoji,
            } => (
                connection_id,
                self.resolve_message(connection_id, message_id, MessageAction::React(emoji)),
            ),
            ServerCommand::StatusChange {
                connection_id,
                status,
            } => (connection_id, self.handle_status_change(connection_id, status)),
            ServerCommand::UpdateMessageStatus {
                connection_id,
                message_id,
                status,
            } => (
                connection_id,
                self.resolve_message(connection_id, message_id, MessageAction::UpdateStatus(status)),
            ),
            ServerCommand::EditMessage {
                connection_id,
                message_id,
                content,
            } => (
                connection_id,
                self.resolve_message(connection_id, message_id, MessageAction::Edit(content)),
            ),
            ServerCommand::DeleteMessage {
                connection_id,
                message_id,
            } => (
                connection_id,
                self.resolve_message(connection_id, message_id, MessageAction::Delete),
            ),
            ServerCommand::FetchHistory {
                connection_id,
                room,
                before,
                limit,
            } => (
                connection_id,
                self.handle_fetch_history(connection_id, room, before, limit),
            ),
            ServerCommand::GetPresence { user_id, reply } => {
                let _ = reply.send(self.presence.get_status(&user_id).cloned());
                return;
            }
            ServerCommand::TypingExpired {
                room,
                user_id,
                generation,
            } => {
                let envelopes = self.handle_typing_expired(room, user_id, generation);
                self.dispatch(&envelopes);
                return;
            }
            ServerCommand::ContactsResolved {
                user_id,
                friends,
                snapshot,
                event,
            } => {
                // A later change overtook this lookup; its own notice is current
                if self.presence.get_status(&user_id) != Some(&snapshot) {
                    debug!("Dropping stale presence notice for {}", user_id);
                    return;
                }
                debug!("Notifying {} contact(s) of {}", friends.len(), user_id);
                let audience = Audience::Users(friends.into_iter().collect());
                self.dispatch(&[Envelope::new(audience, event)]);
                return;
            }
            ServerCommand::GroupJoinResolved {
                connection_id,
                user_id,
                group,
                result,
            } => (
                connection_id,
                self.handle_group_join_resolved(connection_id, user_id, group, result),
            ),
            ServerCommand::MessagePersisted {
                connection_id,
                result,
            } => (
                connection_id,
                self.handle_message_persisted(connection_id, result),
            ),
            ServerCommand::MessageResolved {
                connection_id,
                user_id,
                action,
                result,
            } => (
                connection_id,
                self.handle_message_resolved(user_id, action, result),
            ),
            ServerCommand::HistoryLoaded {
                connection_id,
                room,
                result,
            } => (
                connection_id,
                self.handle_history_loaded(connection_id, room, result),
            ),
        };

        match result {
            Ok(envelopes) => {
                self.dispatch(&envelopes);
            }
            Err(err) => {
                match &err {
                    AppError::Internal(reason) => error!("Internal error for {}: {}", origin, reason),
                    other => debug!("Rejected event from {}: {}", origin, other),
                }
                self.dispatch(&[Envelope::reply(origin, err.into())]);
            }
        }
    }

    /// Deliver envelopes, returning how many connections accepted them
    fn dispatch(&self, envelopes: &[Envelope]) -> usize {
        Dispatcher::new(&self.registry, &self.rooms).deliver_all(envelopes)
    }

    /// The user bound to a live connection
    fn actor(&self, connection_id: ConnectionId) -> Result<UserId, AppError> {
        self.registry
            .owner_of(connection_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("connection {}", connection_id)))
    }

    /// Run `work` off the actor and feed its result back as a command
    fn defer<F>(&self, work: F)
    where
        F: Future<Output = ServerCommand> + Send + 'static,
    {
        let Some(tx) = self.handle.upgrade() else {
            debug!("ChatServer closing, dropping deferred work");
            return;
        };
        tokio::spawn(async move {
            let cmd = work.await;
            if tx.send(cmd).await.is_err() {
                debug!("ChatServer gone before deferred work finished");
            }
        });
    }

    /// Look up `user_id`'s friends and send them `event`, built from `snapshot`
    fn notify_contacts(&self, user_id: UserId, snapshot: UserPresence, event: ServerMessage) {
        let store = Arc::clone(&self.store);
        let Some(tx) = self.handle.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            match store.friend_ids(&user_id).await {
                Ok(friends) => {
                    let cmd = ServerCommand::ContactsResolved {
                        user_id,
                        friends,
                        snapshot,
                        event,
                    };
                    let _ = tx.send(cmd).await;
                }
                Err(e) => error!("Friend lookup for {} failed: {}", user_id, e),
            }
        });
    }

    /// Drop a connection's room subscriptions and its user's typing flags
    fn release_connection(&mut self, connection_id: ConnectionId, user_id: &UserId) -> Vec<Envelope> {
        let left = self.rooms.leave_all(connection_id);
        debug!("Connection {} left {} room(s)", connection_id, left.len());

        self.typing
            .clear_user(user_id)
            .into_iter()
            .map(|room| stop_typing_envelope(room, user_id))
            .collect()
    }

    /// Handle a new authenticated connection
    fn handle_connect(
        &mut self,
        connection_id: ConnectionId,
        user_id: UserId,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Vec<Envelope> {
        let connection = Connection::new(connection_id, user_id.clone(), sender);
        let mut envelopes = Vec::new();

        let evicted = self.registry.bind(connection);
        if let Some(old) = &evicted {
            info!(
                "Connection {} for {} superseded by {}",
                old.id, user_id, connection_id
            );
            envelopes.extend(self.release_connection(old.id, &user_id));
            if let Err(e) = old.send(ServerMessage::Superseded) {
                debug!("Could not notify superseded connection {}: {}", old.id, e);
            }
        }
        // Dropping the evicted connection closes its outbound channel
        drop(evicted);

        let was_online = self.presence.is_reachable(&user_id);
        let record = self.presence.set_status(&user_id, PresenceStatus::Online);
        self.writes.presence(record.clone());
        info!("User {} bound to connection {}", user_id, connection_id);

        envelopes.push(Envelope::reply(
            connection_id,
            ServerMessage::Connected {
                connection_id,
                user_id: user_id.clone(),
                status: record.status,
                last_seen: record.last_seen,
            },
        ));

        if !was_online {
            self.notify_contacts(
                user_id.clone(),
                record.clone(),
                ServerMessage::FriendOnline {
                    user_id,
                    status: record.status,
                    last_seen: record.last_seen,
                },
            );
        }

        debug!(
            "Total connections: {}, Total rooms: {}",
            self.registry.len(),
            self.rooms.room_count()
        );
        envelopes
    }

    /// Handle transport disconnection
    fn handle_disconnect(&mut self, connection_id: ConnectionId) -> Vec<Envelope> {
        let Some(connection) = self.registry.unbind(connection_id) else {
            // Superseded or never bound: its state was released on eviction
            self.rooms.leave_all(connection_id);
            debug!("Ignoring disconnect of stale connection {}", connection_id);
            return Vec::new();
        };

        let user_id = connection.user_id.clone();
        info!("User {} disconnected ({})", user_id, connection_id);
        let envelopes = self.release_connection(connection_id, &user_id);

        let record = self.presence.set_status(&user_id, PresenceStatus::Offline);
        self.writes.presence(record.clone());
        self.notify_contacts(
            user_id.clone(),
            record.clone(),
            ServerMessage::FriendOffline {
                user_id,
                status: record.status,
                last_seen: record.last_seen,
            },
        );

        debug!(
            "Total connections: {}, Total rooms: {}",
            self.registry.len(),
            self.rooms.room_count()
        );
        envelopes
    }

    /// Handle room joining
    fn handle_join_room(
        &mut self,
        connection_id: ConnectionId,
        room: RoomId,
    ) -> Result<Vec<Envelope>, AppError> {
        let user_id = self.actor(connection_id)?;

        match &room {
            RoomId::Direct(..) => {
                if !room.is_participant(&user_id) {
                    return Err(AppError::Forbidden(format!("{} is not part of {}", user_id, room)));
                }
                Ok(self.join(connection_id, &user_id, room))
            }
            RoomId::Group(group) => {
                let store = Arc::clone(&self.store);
                let group = group.clone();
                self.defer(async move {
                    let result = store.group_member_ids(&group).await.map_err(AppError::from);
                    ServerCommand::GroupJoinResolved {
                        connection_id,
                        user_id,
                        group,
                        result,
                    }
                });
                Ok(Vec::new())
            }
        }
    }

    fn handle_group_join_resolved(
        &mut self,
        connection_id: ConnectionId,
        user_id: UserId,
        group: GroupId,
        result: Result<HashSet<UserId>, AppError>,
    ) -> Result<Vec<Envelope>, AppError> {
        let members = result?;
        let is_member = members.contains(&user_id);
        self.ledger.set_roster(group.clone(), members);

        if !is_member {
            return Err(AppError::Forbidden(format!(
                "{} is not a member of group {}",
                user_id, group
            )));
        }
        // The connection may have gone away while the roster was loading
        if self.registry.owner_of(connection_id) != Some(&user_id) {
            return Ok(Vec::new());
        }
        Ok(self.join(connection_id, &user_id, RoomId::group(group)))
    }

    fn join(&mut self, connection_id: ConnectionId, user_id: &UserId, room: RoomId) -> Vec<Envelope> {
        if self.rooms.join(connection_id, &room) {
            info!("User {} joined room {}", user_id, room);
        }
        vec![Envelope::reply(connection_id, ServerMessage::RoomJoined { room })]
    }

    /// Handle voluntary room leaving
    fn handle_leave_room(
        &mut self,
        connection_id: ConnectionId,
        room: RoomId,
    ) -> Result<Vec<Envelope>, AppError> {
        let user_id = self.actor(connection_id)?;
        let mut envelopes = Vec::new();

        if self.typing.stop(&room, &user_id) {
            envelopes.push(stop_typing_envelope(room.clone(), &user_id));
        }
        if self.rooms.leave(connection_id, &room) {
            info!("User {} left room {}", user_id, room);
        }
        envelopes.push(Envelope::reply(connection_id, ServerMessage::RoomLeft { room }));
        Ok(envelopes)
    }

    /// Handle typing indicator start (or renewal)
    fn handle_typing(
        &mut self,
        connection_id: ConnectionId,
        room: RoomId,
    ) -> Result<Vec<Envelope>, AppError> {
        let user_id = self.actor(connection_id)?;
        if !self.rooms.is_member(connection_id, &room) {
            return Err(AppError::Forbidden(format!("not subscribed to {}", room)));
        }

        let (change, ticket) = self.typing.start(&room, &user_id);
        self.schedule_typing_expiry(&room, &user_id, ticket);

        match change {
            TypingChange::Started => Ok(vec![Envelope::new(
                Audience::room_except(room.clone(), &user_id),
                ServerMessage::Typing { room, user_id },
            )]),
            TypingChange::Renewed => Ok(Vec::new()),
        }
    }

    fn schedule_typing_expiry(&mut self, room: &RoomId, user_id: &UserId, ticket: TypingTicket) {
        let Some(tx) = self.handle.upgrade() else {
            return;
        };
        let cmd = ServerCommand::TypingExpired {
            room: room.clone(),
            user_id: user_id.clone(),
            generation: ticket.generation,
        };
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(ticket.deadline).await;
            let _ = tx.send(cmd).await;
        });
        self.typing
            .attach(room, user_id, ticket.generation, timer.abort_handle());
    }

    /// Handle typing indicator stop
    fn handle_stop_typing(
        &mut self,
        connection_id: ConnectionId,
        room: RoomId,
    ) -> Result<Vec<Envelope>, AppError> {
        let user_id = self.actor(connection_id)?;
        if self.typing.stop(&room, &user_id) {
            Ok(vec![stop_typing_envelope(room, &user_id)])
        } else {
            Ok(Vec::new())
        }
    }

    fn handle_typing_expired(&mut self, room: RoomId, user_id: UserId, generation: u64) -> Vec<Envelope> {
        if self.typing.expire(&room, &user_id, generation) {
            debug!("Typing indicator for {} in {} expired", user_id, room);
            vec![stop_typing_envelope(room, &user_id)]
        } else {
            Vec::new()
        }
    }

    /// Handle a new message: store it off the actor, fan out when stored
    fn handle_new_message(
        &mut self,
        connection_id: ConnectionId,
        recipient: Recipient,
        content: String,
        kind: MessageKind,
        file: Option<FileMeta>,
        reply_to: Option<MessageId>,
    ) -> Result<Vec<Envelope>, AppError> {
        let sender_id = self.actor(connection_id)?;
        let message = Message::new(sender_id.clone(), recipient, content, kind)
            .with_file(file)
            .with_reply_to(reply_to);

        let mut envelopes = Vec::new();
        let room = message.room_id();
        if self.typing.stop(&room, &sender_id) {
            envelopes.push(stop_typing_envelope(room, &sender_id));
        }

        let store = Arc::clone(&self.store);
        self.defer(async move {
            let result = persist_new_message(store.as_ref(), message).await;
            ServerCommand::MessagePersisted {
                connection_id,
                result,
            }
        });
        Ok(envelopes)
    }

    fn handle_message_persisted(
        &mut self,
        connection_id: ConnectionId,
        result: Result<(Message, Roster), AppError>,
    ) -> Result<Vec<Envelope>, AppError> {
        let (message, roster) = result?;
        let sender_id = message.sender_id.clone();
        if let Some((group, members)) = roster {
            self.ledger.set_roster(group, members);
        }

        let recipients: Vec<UserId> = match &message.recipient {
            Recipient::User(user) => vec![user.clone()],
            Recipient::Group(group) => self
                .ledger
                .roster(group)
                .map(|members| members.iter().filter(|u| **u != sender_id).cloned().collect())
                .unwrap_or_default(),
        };

        let message_id = message.id.clone();
        let room = message.room_id();
        self.ledger.insert(message.clone());
        info!("Message {} from {} to {}", message_id, sender_id, room);

        self.dispatch(&[Envelope::reply(
            connection_id,
            ServerMessage::MessageSent {
                message: message.clone(),
            },
        )]);

        let accepted = self.dispatch(&[Envelope::new(
            Audience::Room {
                room: room.clone(),
                also: recipients,
                except: Some(sender_id.clone()),
            },
            ServerMessage::MessageReceived { message },
        )]);

        if accepted == 0 {
            debug!("No recipient connected for {}, status stays sent", message_id);
            return Ok(Vec::new());
        }
        if !self.ledger.mark_delivered(&message_id) {
            return Ok(Vec::new());
        }
        let delivered = self.ledger.get(&message_id)?.clone();
        self.writes.message(delivered);

        Ok(vec![status_envelope(
            room,
            &sender_id,
            message_id,
            MessageStatus::Delivered,
        )])
    }

    /// Queue a mutation of an existing message
    ///
    /// The message is loaded from the store if it is not held live, and a
    /// group message's roster is always re-read so that removed members lose
    /// their rights. The load is ordered behind earlier writes.
    fn resolve_message(
        &mut self,
        connection_id: ConnectionId,
        message_id: MessageId,
        action: MessageAction,
    ) -> Result<Vec<Envelope>, AppError> {
        let user_id = self.actor(connection_id)?;
        let cached = self.ledger.get(&message_id).ok().cloned();
        let store = Arc::clone(&self.store);

        self.writes.read(
            async move {
                let result = load_for_update(store.as_ref(), &message_id, cached).await;
                ServerCommand::MessageResolved {
                    connection_id,
                    user_id,
                    action,
                    result,
                }
            }
            .boxed(),
        );
        Ok(Vec::new())
    }

    fn handle_message_resolved(
        &mut self,
        user_id: UserId,
        action: MessageAction,
        result: Result<(Message, Roster), AppError>,
    ) -> Result<Vec<Envelope>, AppError> {
        let (stored, roster) = result?;
        if let Some((group, members)) = roster {
            self.ledger.set_roster(group, members);
        }
        // Keeps the live copy if one appeared while loading
        let message_id = self.ledger.insert(stored).id.clone();

        match action {
            MessageAction::Read => self.apply_read(user_id, message_id),
            MessageAction::React(emoji) => self.apply_reaction(user_id, message_id, emoji),
            MessageAction::UpdateStatus(status) => {
                self.apply_status_update(user_id, message_id, status)
            }
            MessageAction::Edit(content) => self.apply_edit(user_id, message_id, content),
            MessageAction::Delete => self.apply_delete(user_id, message_id),
        }
    }

    /// Handle a read receipt; advisory only
    fn apply_read(
        &mut self,
        reader: UserId,
        message_id: MessageId,
    ) -> Result<Vec<Envelope>, AppError> {
        let message = self.ledger.read_receipt(&message_id, &reader)?;

        Ok(vec![Envelope::new(
            Audience::Room {
                room: message.room_id(),
                also: vec![message.sender_id.clone()],
                except: Some(reader.clone()),
            },
            ServerMessage::MessageReadReceipt {
                message_id,
                read_by: reader,
                read_at: Utc::now(),
            },
        )])
    }

    fn apply_reaction(
        &mut self,
        user_id: UserId,
        message_id: MessageId,
        emoji: String,
    ) -> Result<Vec<Envelope>, AppError> {
        let message = self
            .ledger
            .add_reaction(&message_id, &user_id, emoji.clone())?
            .clone();
        self.writes.message(message.clone());

        Ok(vec![Envelope::new(
            conversation(&message),
            ServerMessage::MessageReaction {
                message_id,
                user_id,
                emoji,
                reactions: message.reactions,
            },
        )])
    }

    fn apply_status_update(
        &mut self,
        user_id: UserId,
        message_id: MessageId,
        status: MessageStatus,
    ) -> Result<Vec<Envelope>, AppError> {
        if !self.ledger.advance_status(&message_id, &user_id, status)? {
            debug!("Status of {} already at or past {:?}", message_id, status);
            return Ok(Vec::new());
        }

        let message = self.ledger.get(&message_id)?.clone();
        let envelope = status_envelope(message.room_id(), &message.sender_id, message_id, message.status);
        self.writes.message(message);
        Ok(vec![envelope])
    }

    fn apply_edit(
        &mut self,
        user_id: UserId,
        message_id: MessageId,
        content: String,
    ) -> Result<Vec<Envelope>, AppError> {
        let message = self.ledger.edit(&message_id, &user_id, content)?.clone();
        self.writes.message(message.clone());

        let edited_at = message.edited_at.unwrap_or_else(Utc::now);
        Ok(vec![Envelope::new(
            conversation(&message),
            ServerMessage::MessageEdited {
                message_id,
                content: message.content,
                edited_at,
            },
        )])
    }

    fn apply_delete(
        &mut self,
        user_id: UserId,
        message_id: MessageId,
    ) -> Result<Vec<Envelope>, AppError> {
        let message = self.ledger.delete(&message_id, &user_id)?.clone();
        self.writes.message(message.clone());

        let deleted_at = message.deleted_at.unwrap_or_else(Utc::now);
        Ok(vec![Envelope::new(
            conversation(&message),
            ServerMessage::MessageDeleted {
                message_id,
                deleted_at,
            },
        )])
    }

    /// Handle an explicit presence change
    fn handle_status_change(
        &mut self,
        connection_id: ConnectionId,
        status: PresenceStatus,
    ) -> Result<Vec<Envelope>, AppError> {
        let user_id = self.actor(connection_id)?;
        let record = self.presence.set_status(&user_id, status);
        self.writes.presence(record.clone());
        info!("User {} is now {:?}", user_id, status);

        self.notify_contacts(
            user_id.clone(),
            record.clone(),
            ServerMessage::FriendStatusChange {
                user_id,
                status: record.status,
                last_seen: record.last_seen,
            },
        );
        Ok(Vec::new())
    }

    /// Handle a history request: authorize and load behind pending writes
    fn handle_fetch_history(
        &mut self,
        connection_id: ConnectionId,
        room: RoomId,
        before: Option<MessageId>,
        limit: Option<usize>,
    ) -> Result<Vec<Envelope>, AppError> {
        let user_id = self.actor(connection_id)?;
        if matches!(room, RoomId::Direct(..)) && !room.is_participant(&user_id) {
            return Err(AppError::Forbidden(format!("{} is not part of {}", user_id, room)));
        }

        let limit = self.config.history_page(limit);
        let store = Arc::clone(&self.store);
        self.writes.read(
            async move {
                let result =
                    load_history(store.as_ref(), &user_id, &room, before.as_ref(), limit).await;
                ServerCommand::HistoryLoaded {
                    connection_id,
                    room,
                    result,
                }
            }
            .boxed(),
        );
        Ok(Vec::new())
    }

    fn handle_history_loaded(
        &mut self,
        connection_id: ConnectionId,
        room: RoomId,
        result: Result<(Vec<Message>, Roster), AppError>,
    ) -> Result<Vec<Envelope>, AppError> {
        let (page, roster) = result?;
        if let Some((group, members)) = roster {
            self.ledger.set_roster(group, members);
        }

        // Live copies win over stored ones; reads hide deleted content
        let messages: Vec<Message> = page
            .into_iter()
            .map(|stored| self.ledger.insert(stored).redacted())
            .collect();

        Ok(vec![Envelope::reply(
            connection_id,
            ServerMessage::History { room, messages },
        )])
    }
}

/// Everyone in a message's room plus its sender wherever they are
fn conversation(message: &Message) -> Audience {
    Audience::Room {
        room: message.room_id(),
        also: vec![message.sender_id.clone()],
        except: None,
    }
}

fn status_envelope(
    room: RoomId,
    sender_id: &UserId,
    message_id: MessageId,
    status: MessageStatus,
) -> Envelope {
    Envelope::new(
        Audience::Room {
            room,
            also: vec![sender_id.clone()],
            except: None,
        },
        ServerMessage::MessageStatusUpdate { message_id, status },
    )
}

fn stop_typing_envelope(room: RoomId, user_id: &UserId) -> Envelope {
    Envelope::new(
        Audience::room_except(room.clone(), user_id),
        ServerMessage::StopTyping {
            room,
            user_id: user_id.clone(),
        },
    )
}

/// Check group membership for the sender, then store the message
async fn persist_new_message(
    store: &dyn Store,
    mut message: Message,
) -> Result<(Message, Roster), AppError> {
    let roster = match &message.recipient {
        Recipient::User(_) => None,
        Recipient::Group(group) => {
            let members = store.group_member_ids(group).await?;
            if !members.contains(&message.sender_id) {
                return Err(AppError::Forbidden(format!(
                    "{} is not a member of group {}",
                    message.sender_id, group
                )));
            }
            Some((group.clone(), members))
        }
    };

    message.id = store.persist_message(&message).await?;
    Ok((message, roster))
}

/// The message to mutate (live copy if held) and, for group messages, a
/// fresh roster
async fn load_for_update(
    store: &dyn Store,
    id: &MessageId,
    cached: Option<Message>,
) -> Result<(Message, Roster), AppError> {
    let message = match cached {
        Some(message) => message,
        None => store.load_message(id).await?,
    };
    let roster = match &message.recipient {
        Recipient::User(_) => None,
        Recipient::Group(group) => Some((group.clone(), store.group_member_ids(group).await?)),
    };
    Ok((message, roster))
}

/// Check the reader may see a group's history, then load one page
async fn load_history(
    store: &dyn Store,
    reader: &UserId,
    room: &RoomId,
    before: Option<&MessageId>,
    limit: usize,
) -> Result<(Vec<Message>, Roster), AppError> {
    let roster = match room {
        RoomId::Direct(..) => None,
        RoomId::Group(group) => {
            let members = store.group_member_ids(group).await?;
            if !members.contains(reader) {
                return Err(AppError::Forbidden(format!(
                    "{} is not a member of group {}",
                    reader, group
                )));
            }
            Some((group.clone(), members))
        }
    };

    let page = store.load_message_history(room, before, limit).await?;
    Ok((page, roster))
}
