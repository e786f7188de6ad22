//! In-memory room connections for tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::server::rooms::{Connection, ConnectionId, SendError, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behaviour {
    Record,
    Fail,
    Stall,
}

struct Recorder {
    id: ConnectionId,
    behaviour: Behaviour,
    messages: Mutex<Vec<ServerMessage>>,
    received: Notify,
    closed: AtomicBool,
}

impl Recorder {
    fn lock(&self) -> MutexGuard<'_, Vec<ServerMessage>> {
        self.messages.lock().unwrap_or_else(|err| err.into_inner())
    }
}

#[async_trait]
impl Connection for Recorder {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn send(&self, message: &ServerMessage) -> Result<(), SendError> {
        match self.behaviour {
            Behaviour::Record => {
                self.lock().push(message.clone());
                self.received.notify_waiters();
                Ok(())
            }
            Behaviour::Fail => Err(SendError::Closed),
            Behaviour::Stall => std::future::pending().await,
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A connection that records what it is sent. Dropping it makes the registry's weak handle dead.
pub struct RecordingConnection {
    inner: Arc<Recorder>,
}

impl RecordingConnection {
    pub fn new() -> Self {
        Self::with_behaviour(Behaviour::Record)
    }

    /// Every send fails as if the socket had closed.
    pub fn failing() -> Self {
        Self::with_behaviour(Behaviour::Fail)
    }

    /// Every send hangs forever.
    pub fn stalled() -> Self {
        Self::with_behaviour(Behaviour::Stall)
    }

    fn with_behaviour(behaviour: Behaviour) -> Self {
        Self {
            inner: Arc::new(Recorder {
                id: ConnectionId::new(),
                behaviour,
                messages: Mutex::new(Vec::new()),
                received: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    pub fn handle(&self) -> Arc<dyn Connection> {
        self.inner.clone()
    }

    pub fn messages(&self) -> Vec<ServerMessage> {
        self.inner.lock().clone()
    }

    /// Whether the registry hung up on this connection.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.inner.lock().iter().map(ServerMessage::kind).collect()
    }

    /// Waits until a recorded message satisfies `predicate`, returning everything recorded so far.
    pub async fn wait_for<F>(&self, predicate: F) -> Vec<ServerMessage>
    where
        F: Fn(&ServerMessage) -> bool,
    {
        loop {
            let notified = self.inner.received.notified();
            {
                let messages = self.inner.lock();
                if messages.iter().any(&predicate) {
                    return messages.clone();
                }
            }
            notified.await;
        }
    }
}

impl Default for RecordingConnection {
    fn default() -> Self {
        Self::new()
    }
}
