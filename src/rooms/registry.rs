use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::rooms::msg::{ChatMessage, Identity, ServerEvent};

pub type ConnId = Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("room operation before authenticate")]
    Unauthenticated,
    #[error("not a member of room {room_id}")]
    NotAMember { room_id: String },
    #[error("unknown connection")]
    UnknownConnection,
}

struct Connection {
    member: Option<Identity>,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

#[derive(Default)]
struct Room {
    members: BTreeSet<ConnId>,
    history: VecDeque<ChatMessage>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnId, Connection>,
    rooms: HashMap<String, Room>,
}

/// The only access path to room membership and history. Every mutation takes
/// the one lock, so joins, leaves and sends into the same room never
/// interleave; the lock is never held across an await.
pub struct RoomRegistry {
    history_cap: usize,
    inner: Mutex<Inner>,
}

impl RoomRegistry {
    pub fn new(history_cap: usize) -> Self {
        Self {
            history_cap,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a fresh, unauthenticated channel and its fan-out sender.
    pub fn register(&self, tx: mpsc::UnboundedSender<ServerEvent>) -> ConnId {
        let conn = Uuid::now_v7();
        self.inner()
            .connections
            .insert(conn, Connection { member: None, tx });
        conn
    }

    /// Bind an identity to the channel. Re-authenticating on the same channel
    /// replaces the binding.
    pub fn authenticate(&self, conn: ConnId, identity: Identity) -> Result<(), RelayError> {
        let mut inner = self.inner();
        let connection = inner
            .connections
            .get_mut(&conn)
            .ok_or(RelayError::UnknownConnection)?;
        connection.member = Some(identity);
        Ok(())
    }

    /// Add the channel's member to the room, creating the room with empty
    /// history if it does not exist yet. Idempotent; a re-join is a no-op
    /// beyond the history resend. Returns the room's current history,
    /// oldest first, for the joiner only.
    pub fn join(&self, conn: ConnId, room_id: &str) -> Result<Vec<ChatMessage>, RelayError> {
        let mut guard = self.inner();
        let inner = &mut *guard;

        let connection = inner
            .connections
            .get(&conn)
            .ok_or(RelayError::UnknownConnection)?;
        if connection.member.is_none() {
            return Err(RelayError::Unauthenticated);
        }

        let room = inner.rooms.entry(room_id.to_owned()).or_default();
        room.members.insert(conn);

        Ok(room.history.iter().cloned().collect())
    }

    /// Leaving a room the channel is not in is a no-op.
    pub fn leave(&self, conn: ConnId, room_id: &str) {
        let mut inner = self.inner();
        if let Some(room) = inner.rooms.get_mut(room_id) {
            room.members.remove(&conn);
        }
    }

    /// Stamp, append to the room's bounded history and fan out to every other
    /// current member. Delivery to a channel that dropped but has not been
    /// removed yet is silently skipped.
    pub fn send(
        &self,
        conn: ConnId,
        room_id: &str,
        content: String,
    ) -> Result<ChatMessage, RelayError> {
        let mut guard = self.inner();
        let inner = &mut *guard;

        let connection = inner
            .connections
            .get(&conn)
            .ok_or(RelayError::UnknownConnection)?;
        let member = connection
            .member
            .as_ref()
            .ok_or(RelayError::Unauthenticated)?;

        let room = inner
            .rooms
            .get_mut(room_id)
            .filter(|room| room.members.contains(&conn))
            .ok_or_else(|| RelayError::NotAMember {
                room_id: room_id.to_owned(),
            })?;

        let message = ChatMessage {
            room_id: room_id.to_owned(),
            sender_id: member.id.clone(),
            content,
            created_at: OffsetDateTime::now_utc(),
        };

        room.history.push_back(message.clone());
        if room.history.len() > self.history_cap {
            room.history.pop_front();
        }

        for other in &room.members {
            if *other == conn {
                continue;
            }
            if let Some(Connection { tx, .. }) = inner.connections.get(other) {
                let _ = tx.send(ServerEvent::NewMessage(message.clone()));
            }
        }

        Ok(message)
    }

    /// Invoked on disconnect; drops the channel and removes it from every
    /// room's membership set in one pass.
    pub fn remove(&self, conn: ConnId) {
        let mut guard = self.inner();
        let inner = &mut *guard;
        if inner.connections.remove(&conn).is_some() {
            for room in inner.rooms.values_mut() {
                room.members.remove(&conn);
            }
        }
    }

    /// Explicit room creation (the REST path). Keeps existing membership and
    /// history if the room is already live.
    pub fn provision(&self, room_id: &str) {
        self.inner().rooms.entry(room_id.to_owned()).or_default();
    }

    /// Room ids currently held in memory, including lazily created ones.
    pub fn active_rooms(&self) -> Vec<String> {
        self.inner().rooms.keys().cloned().collect()
    }
}
