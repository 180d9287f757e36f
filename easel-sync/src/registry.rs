//! Room membership bookkeeping.
//!
//! The registry owns two views of the same relation and keeps them in step
//! under one lock:
//! ```text
//! connections: ConnectionId → { outbound queues, rooms }
//! rooms:       room id      → { ConnectionId }
//! ```
//! A room exists exactly as long as it has members.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use crate::protocol::ConnectionId;

/// Encoded frame shared between every receiver of one message.
pub type Frame = Arc<Vec<u8>>;

/// Outcome of queueing a frame on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Volatile queue was full; frame discarded.
    Dropped,
    /// Connection is gone.
    Closed,
}

/// Sending half of a connection's outbound queues.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    reliable: mpsc::UnboundedSender<Frame>,
    volatile: mpsc::Sender<Frame>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue without bound; never drops while the connection lives.
    pub fn send_reliable(&self, frame: Frame) -> Delivery {
        match self.reliable.send(frame) {
            Ok(()) => Delivery::Queued,
            Err(_) => Delivery::Closed,
        }
    }

    /// Queue only if there is room.
    pub fn send_volatile(&self, frame: Frame) -> Delivery {
        match self.volatile.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Receiving half, drained by the connection's writer.
pub struct ConnectionQueues {
    pub reliable: mpsc::UnboundedReceiver<Frame>,
    pub volatile: mpsc::Receiver<Frame>,
}

/// Result of a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub room_id: String,
    /// Members after the join, sorted
    pub members: Vec<ConnectionId>,
    /// `false` if the connection was already a member
    pub newly_joined: bool,
}

impl JoinOutcome {
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// The joining connection is the room's only member.
    pub fn is_first(&self) -> bool {
        self.members.len() == 1
    }
}

/// Remaining membership of a room after someone left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub room_id: String,
    pub members: Vec<ConnectionId>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

struct ConnectionEntry {
    handle: ConnectionHandle,
    rooms: HashSet<String>,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

impl RegistryState {
    fn sorted_members(&self, room_id: &str) -> Vec<ConnectionId> {
        let mut members: Vec<ConnectionId> = self
            .rooms
            .get(room_id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    fn remove_member(&mut self, room_id: &str, id: ConnectionId) -> MembershipChange {
        if let Some(members) = self.rooms.get_mut(room_id) {
            members.remove(&id);
            if members.is_empty() {
                self.rooms.remove(room_id);
                log::debug!("Room {room_id} closed (empty)");
            }
        }
        MembershipChange {
            room_id: room_id.to_string(),
            members: self.sorted_members(room_id),
        }
    }
}

/// Connection and room registry shared by all connection tasks.
pub struct RoomRegistry {
    state: RwLock<RegistryState>,
    volatile_capacity: usize,
}

impl RoomRegistry {
    /// `volatile_capacity` bounds each connection's volatile queue.
    pub fn new(volatile_capacity: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            volatile_capacity: volatile_capacity.max(1),
        }
    }

    /// Create the outbound queues for a new connection.
    pub async fn register(&self, id: ConnectionId) -> (ConnectionHandle, ConnectionQueues) {
        let (reliable_tx, reliable_rx) = mpsc::unbounded_channel();
        let (volatile_tx, volatile_rx) = mpsc::channel(self.volatile_capacity);
        let handle = ConnectionHandle {
            id,
            reliable: reliable_tx,
            volatile: volatile_tx,
        };

        let mut state = self.state.write().await;
        state.connections.insert(
            id,
            ConnectionEntry {
                handle: handle.clone(),
                rooms: HashSet::new(),
            },
        );

        (
            handle,
            ConnectionQueues {
                reliable: reliable_rx,
                volatile: volatile_rx,
            },
        )
    }

    /// Leave every room and forget the connection.
    pub async fn unregister(&self, id: ConnectionId) -> Vec<MembershipChange> {
        let mut state = self.state.write().await;
        let changes = Self::leave_all_locked(&mut state, id);
        state.connections.remove(&id);
        changes
    }

    pub async fn join(&self, id: ConnectionId, room_id: &str) -> Result<JoinOutcome, RegistryError> {
        let mut state = self.state.write().await;
        let entry = state
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;
        let newly_joined = entry.rooms.insert(room_id.to_string());
        state
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(id);

        Ok(JoinOutcome {
            room_id: room_id.to_string(),
            members: state.sorted_members(room_id),
            newly_joined,
        })
    }

    /// Returns `None` if the connection was not in the room.
    pub async fn leave(&self, id: ConnectionId, room_id: &str) -> Option<MembershipChange> {
        let mut state = self.state.write().await;
        let entry = state.connections.get_mut(&id)?;
        if !entry.rooms.remove(room_id) {
            return None;
        }
        Some(state.remove_member(room_id, id))
    }

    /// Leave every room; one change per room the connection was in.
    pub async fn leave_all(&self, id: ConnectionId) -> Vec<MembershipChange> {
        let mut state = self.state.write().await;
        Self::leave_all_locked(&mut state, id)
    }

    fn leave_all_locked(state: &mut RegistryState, id: ConnectionId) -> Vec<MembershipChange> {
        let rooms: Vec<String> = match state.connections.get_mut(&id) {
            Some(entry) => entry.rooms.drain().collect(),
            None => return Vec::new(),
        };
        rooms
            .iter()
            .map(|room_id| state.remove_member(room_id, id))
            .collect()
    }

    /// Current members of a room, sorted. Empty if the room does not exist.
    pub async fn members_of(&self, room_id: &str) -> Vec<ConnectionId> {
        self.state.read().await.sorted_members(room_id)
    }

    pub async fn rooms_of(&self, id: ConnectionId) -> Vec<String> {
        let state = self.state.read().await;
        let mut rooms: Vec<String> = state
            .connections
            .get(&id)
            .map(|e| e.rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    /// Handles of a room's members, minus `except`.
    pub async fn handles_in(&self, room_id: &str, except: Option<ConnectionId>) -> Vec<ConnectionHandle> {
        let state = self.state.read().await;
        let Some(members) = state.rooms.get(room_id) else {
            return Vec::new();
        };
        members
            .iter()
            .filter(|id| Some(**id) != except)
            .filter_map(|id| state.connections.get(id).map(|e| e.handle.clone()))
            .collect()
    }

    /// Handles of every registered connection, minus `except`.
    pub async fn all_handles(&self, except: Option<ConnectionId>) -> Vec<ConnectionHandle> {
        let state = self.state.read().await;
        state
            .connections
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .map(|(_, e)| e.handle.clone())
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn room_count(&self) -> usize {
        self.state.read().await.rooms.len()
    }
}
