use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionId, SendError};
use super::models::ServerMessage;

/// Upper bound on a single delivery before the member is treated as dead.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// A room's exclusive right to run code.
pub type RunGate = Arc<tokio::sync::Mutex<()>>;
pub type RunGuard = OwnedMutexGuard<()>;

struct Room {
    members: HashMap<ConnectionId, Weak<dyn Connection>>,
    gate: RunGate,
}

impl Room {
    fn new() -> Self {
        Self {
            members: HashMap::new(),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Nobody outside the registry holds the gate (neither a guard nor a pending acquire).
    fn gate_idle(&self) -> bool {
        Arc::strong_count(&self.gate) == 1
    }

    fn disposable(&self) -> bool {
        self.members.is_empty() && self.gate_idle()
    }
}

/// Room membership and run gates for the whole process.
///
/// The internal map lock only guards bookkeeping; delivery happens on a snapshot taken under
/// it, so a stalled socket never blocks joins or leaves. Members are held weakly: the transport
/// owns connections and a member that can no longer be upgraded is pruned like a failed send.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Room>>,
    send_timeout: Duration,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::with_send_timeout(SEND_TIMEOUT)
    }

    pub fn with_send_timeout(send_timeout: Duration) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            send_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Room>> {
        self.rooms.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Registers `connection` in `room_id`, creating the room on first join. Joining twice is a no-op.
    pub fn join(&self, room_id: &str, connection: &Arc<dyn Connection>) -> usize {
        let mut rooms = self.lock();
        let room = rooms.entry(room_id.to_string()).or_insert_with(Room::new);
        room.members
            .insert(connection.id().clone(), Arc::downgrade(connection));
        let members = room.members.len();
        info!(room = %room_id, connection = %connection.id(), members, "connection joined room");
        members
    }

    pub fn leave(&self, room_id: &str, connection: &ConnectionId) -> bool {
        let mut rooms = self.lock();
        let removed = rooms
            .get_mut(room_id)
            .map(|room| room.members.remove(connection).is_some())
            .unwrap_or(false);
        drop_if_disposable(&mut rooms, room_id);
        if removed {
            info!(room = %room_id, connection = %connection, "connection left room");
        }
        removed
    }

    /// The room's gate, created on first access. Callers that never lock it should follow up
    /// with [`RoomRegistry::prune_if_idle`].
    pub fn run_gate(&self, room_id: &str) -> RunGate {
        let mut rooms = self.lock();
        let room = rooms.entry(room_id.to_string()).or_insert_with(Room::new);
        Arc::clone(&room.gate)
    }

    /// Non-blocking acquire: `None` when a run already holds the room's gate.
    pub fn try_acquire_run(&self, room_id: &str) -> Option<RunGuard> {
        self.run_gate(room_id).try_lock_owned().ok()
    }

    /// Delivers `message` to every current member and returns how many accepted it. Members
    /// whose delivery failed are removed and closed once all sends have finished.
    pub async fn broadcast(&self, room_id: &str, message: &ServerMessage) -> usize {
        let targets = self.snapshot(room_id);
        if targets.is_empty() {
            debug!(room = %room_id, kind = message.kind(), "broadcast to empty room");
            return 0;
        }

        let limit = self.send_timeout;
        let sends = targets.into_iter().map(|(id, member)| async move {
            let result = deliver(member, message, limit).await;
            (id, result)
        });

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, result) in join_all(sends).await {
            match result {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(
                        room = %room_id,
                        connection = %id,
                        kind = message.kind(),
                        error = %err,
                        "dropping connection after failed send"
                    );
                    dead.push(id);
                }
            }
        }

        if !dead.is_empty() {
            self.prune(room_id, &dead);
        }
        delivered
    }

    /// Delivers `message` to a single member of `room_id`, pruning it on failure.
    pub async fn send_to(
        &self,
        room_id: &str,
        connection: &ConnectionId,
        message: &ServerMessage,
    ) -> Result<(), SendError> {
        let member = self
            .lock()
            .get(room_id)
            .and_then(|room| room.members.get(connection).cloned());
        let Some(member) = member else {
            return Err(SendError::Closed);
        };

        let result = deliver(member, message, self.send_timeout).await;
        if let Err(err) = &result {
            warn!(
                room = %room_id,
                connection = %connection,
                kind = message.kind(),
                error = %err,
                "dropping connection after failed send"
            );
            self.prune(room_id, std::slice::from_ref(connection));
        }
        result
    }

    pub fn member_count(&self, room_id: &str) -> usize {
        self.lock()
            .get(room_id)
            .map(|room| room.members.len())
            .unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.lock().len()
    }

    /// Drops the room if it has no members and no run in flight. Returns whether it was dropped.
    pub fn prune_if_idle(&self, room_id: &str) -> bool {
        drop_if_disposable(&mut self.lock(), room_id)
    }

    /// Forgets every room. Called once the server has stopped accepting connections.
    pub fn shutdown(&self) -> usize {
        let mut rooms = self.lock();
        let dropped = rooms.len();
        rooms.clear();
        info!(rooms = dropped, "room registry shut down");
        dropped
    }

    fn snapshot(&self, room_id: &str) -> Vec<(ConnectionId, Weak<dyn Connection>)> {
        self.lock()
            .get(room_id)
            .map(|room| {
                room.members
                    .iter()
                    .map(|(id, member)| (id.clone(), member.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn prune(&self, room_id: &str, dead: &[ConnectionId]) {
        let mut rooms = self.lock();
        if let Some(room) = rooms.get_mut(room_id) {
            for id in dead {
                // Hang up so the client learns it is no longer in the room.
                if let Some(connection) = room.members.remove(id).and_then(|m| m.upgrade()) {
                    connection.close();
                }
            }
        }
        drop_if_disposable(&mut rooms, room_id);
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn drop_if_disposable(rooms: &mut HashMap<String, Room>, room_id: &str) -> bool {
    let disposable = rooms.get(room_id).map(Room::disposable).unwrap_or(false);
    if disposable {
        rooms.remove(room_id);
        debug!(room = %room_id, "room dropped");
    }
    disposable
}

async fn deliver(
    member: Weak<dyn Connection>,
    message: &ServerMessage,
    limit: Duration,
) -> Result<(), SendError> {
    let connection = member.upgrade().ok_or(SendError::Closed)?;
    match tokio::time::timeout(limit, connection.send(message)).await {
        Ok(result) => result,
        Err(_) => Err(SendError::Timeout(limit)),
    }
}
