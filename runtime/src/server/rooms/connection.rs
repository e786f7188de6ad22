use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use super::models::ServerMessage;

/// Frames buffered per socket before senders start waiting on the writer.
pub const OUTBOX_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(format!("conn-{}", Uuid::new_v4()))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

/// Something a room can deliver protocol messages to. A failed send marks it dead.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> &ConnectionId;

    async fn send(&self, message: &ServerMessage) -> Result<(), SendError>;

    /// Asks the transport to hang up. Called when the registry drops a dead member.
    fn close(&self) {}
}

/// Room connection backed by a WebSocket writer task.
///
/// Messages are encoded here and queued for the writer; once the writer stops (socket gone),
/// every further send fails with [`SendError::Closed`].
pub struct WsConnection {
    id: ConnectionId,
    outbox: mpsc::Sender<String>,
    hangup: Arc<Notify>,
}

impl WsConnection {
    pub fn new(capacity: usize) -> (Arc<Self>, Outbox) {
        let (outbox, frames) = mpsc::channel(capacity);
        let hangup = Arc::new(Notify::new());
        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            outbox,
            hangup: Arc::clone(&hangup),
        });
        (connection, Outbox { frames, hangup })
    }
}

/// Writer side of a [`WsConnection`].
pub struct Outbox {
    frames: mpsc::Receiver<String>,
    hangup: Arc<Notify>,
}

impl Outbox {
    /// Next queued frame. `None` once the connection is gone or was closed.
    pub async fn recv(&mut self) -> Option<String> {
        tokio::select! {
            biased;
            _ = self.hangup.notified() => None,
            frame = self.frames.recv() => frame,
        }
    }

    /// Resolves when the connection is closed. Only one waiter observes each close.
    pub fn closed(&self) -> Notified<'_> {
        self.hangup.notified()
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn send(&self, message: &ServerMessage) -> Result<(), SendError> {
        let text = serde_json::to_string(message)?;
        self.outbox.send(text).await.map_err(|_| SendError::Closed)
    }

    fn close(&self) {
        self.hangup.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ws_connection_queues_json_frames() {
        let (connection, mut outbox) = WsConnection::new(4);
        connection
            .send(&ServerMessage::RoomJoined {
                room_id: "r1".into(),
            })
            .await
            .unwrap();

        let frame = outbox.recv().await.unwrap();
        assert_eq!(frame, r#"{"type":"room.joined","room_id":"r1"}"#);
    }

    #[tokio::test]
    async fn send_fails_once_the_writer_is_gone() {
        let (connection, outbox) = WsConnection::new(4);
        drop(outbox);
        let result = connection
            .send(&ServerMessage::RoomLeft {
                room_id: "r1".into(),
            })
            .await;
        assert!(matches!(result, Err(SendError::Closed)));
    }

    #[tokio::test]
    async fn close_stops_the_outbox_even_with_frames_queued() {
        let (connection, mut outbox) = WsConnection::new(4);
        connection
            .send(&ServerMessage::RoomJoined {
                room_id: "r1".into(),
            })
            .await
            .unwrap();

        connection.close();
        assert_eq!(outbox.recv().await, None);
    }

    #[tokio::test]
    async fn outbox_ends_when_the_connection_is_dropped() {
        let (connection, mut outbox) = WsConnection::new(4);
        drop(connection);
        assert_eq!(outbox.recv().await, None);
    }

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
        assert!(ConnectionId::new().0.starts_with("conn-"));
    }
}
